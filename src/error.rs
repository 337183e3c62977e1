use thiserror::Error;

/// Domain errors raised while producing a plan.
///
/// `Alignment`, `Horizon` and `Provider` are specific diagnoses that all
/// surface to callers as resolve failures; [`EmsError::into_resolve`]
/// performs that collapse at the planning boundary.
#[derive(Debug, Error)]
pub enum EmsError {
    #[error("config error: {0}")]
    Config(String),

    #[error("resolve error: {0}")]
    Resolve(String),

    #[error("alignment error: {0}")]
    Alignment(String),

    #[error("horizon error: {0}")]
    Horizon(String),

    #[error("solver error: {0}")]
    Solver(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EmsError {
    /// Collapse alignment/horizon/provider diagnoses into a resolve error.
    pub fn into_resolve(self) -> EmsError {
        match self {
            EmsError::Alignment(msg) | EmsError::Horizon(msg) | EmsError::Provider(msg) => {
                EmsError::Resolve(msg)
            }
            other => other,
        }
    }
}

pub type EmsResult<T> = Result<T, EmsError>;
