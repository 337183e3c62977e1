use good_lp::{
    default_solver, Constraint, Expression, ProblemVariables, ResolutionError, Solution,
    SolverModel, Variable, VariableDefinition,
};
use tracing::debug;

use crate::domain::plan::PlanStatus;

/// Owned working problem: variables, constraints and accumulated objective
/// terms. Finishing a build hands the solver everything at once; callers
/// only ever see opaque [`Variable`] handles.
pub struct ModelBuilder {
    vars: ProblemVariables,
    constraints: Vec<Constraint>,
    objective: Expression,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            vars: ProblemVariables::new(),
            constraints: Vec::new(),
            objective: Expression::default(),
        }
    }

    pub fn var(&mut self, definition: VariableDefinition) -> Variable {
        self.vars.add(definition)
    }

    pub fn var_vec(&mut self, definition: VariableDefinition, len: usize) -> Vec<Variable> {
        self.vars.add_vector(definition, len)
    }

    pub fn constrain(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    /// Add a term to the (minimized) objective.
    pub fn add_cost(&mut self, term: Expression) {
        self.objective += term;
    }

    /// Solve with the CBC backend. Non-Optimal outcomes are results, not
    /// errors: the returned valuation reads 0.0 for every variable.
    pub fn solve(self) -> SolveOutcome {
        let num_constraints = self.constraints.len();
        let objective = self.objective.clone();
        let mut model = self.vars.minimise(self.objective).using(default_solver);
        for constraint in self.constraints {
            model = model.with(constraint);
        }

        match model.solve() {
            Ok(solution) => {
                let objective_value = objective.eval_with(&solution);
                debug!(num_constraints, objective_value, "solve finished");
                SolveOutcome {
                    status: PlanStatus::Optimal,
                    objective_value: Some(objective_value),
                    message: None,
                    solution: Some(Box::new(solution)),
                }
            }
            Err(err) => {
                let status = match err {
                    ResolutionError::Infeasible => PlanStatus::Infeasible,
                    ResolutionError::Unbounded => PlanStatus::Unbounded,
                    _ => PlanStatus::Unknown,
                };
                debug!(num_constraints, %err, "solve did not reach optimality");
                SolveOutcome {
                    status,
                    objective_value: None,
                    message: Some(err.to_string()),
                    solution: None,
                }
            }
        }
    }
}

/// Solver status plus the variable valuation.
pub struct SolveOutcome {
    pub status: PlanStatus,
    pub objective_value: Option<f64>,
    pub message: Option<String>,
    solution: Option<Box<dyn Solution>>,
}

impl SolveOutcome {
    /// Valuation of a variable; missing valuations resolve to 0.0.
    pub fn value(&self, variable: Variable) -> f64 {
        self.solution.as_ref().map(|solution| solution.value(variable)).unwrap_or(0.0)
    }

    /// An outcome with no valuations, used when the model was never solved.
    pub fn not_solved(message: impl Into<String>) -> Self {
        Self {
            status: PlanStatus::NotSolved,
            objective_value: None,
            message: Some(message.into()),
            solution: None,
        }
    }
}

impl std::fmt::Debug for SolveOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolveOutcome")
            .field("status", &self.status)
            .field("objective_value", &self.objective_value)
            .field("message", &self.message)
            .finish()
    }
}
