pub mod compiler;
pub mod extract;
pub mod model;

pub use compiler::{CompiledModel, CompiledPlan, MilpCompiler, ResolvedEvState, ResolvedSeries};
pub use extract::{extract_plan, not_solved_plan};
pub use model::{ModelBuilder, SolveOutcome};
