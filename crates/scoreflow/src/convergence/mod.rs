pub mod registry;
pub mod session;
pub mod state;
pub mod workflow;

pub use registry::SessionRegistry;
pub use session::{
    BroadcastInvalidator, ConvergenceDeps, ConvergenceSession, ConvergenceSettings, Invalidator,
    NoopInvalidator,
};
pub use state::{ConvergenceState, ConvergenceStatus, RunCounters};
pub use workflow::{run_steps, StepReporter, StepsOutcome};
