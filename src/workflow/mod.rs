pub mod executor;
pub mod scheduler;
pub mod types;

pub use executor::StageExecutor;
pub use scheduler::WorkflowScheduler;
pub use types::{
    Dependency, DependencyPolicy, InputSource, RunManifest, RunStatus, SplitStrategy,
    StageDefinition, StageInputs, StageResult, StageStatus, StageWork, UnitOutcome, UnitStatus,
    WorkUnit, WorkflowRun,
};
