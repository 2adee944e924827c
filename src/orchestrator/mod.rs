pub mod events;
pub mod pipeline;
pub mod runner;
pub mod state;

pub use events::{EventSink, TracingSink};
pub use pipeline::{PipelineOrchestrator, RunOptions, RunOutcome};
pub use runner::{PhaseOutcome, PhaseRunner, RunContext};
pub use state::StatusStore;
