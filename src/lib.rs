//! forgeline drives agent-executed pipeline phases through verification,
//! quality gates and a three-tier escalation ladder (retry, autonomous
//! recovery, human decision), and exposes runs as observable jobs.

pub mod baseline;
pub mod config;
pub mod errors;
pub mod escalation;
pub mod executor;
pub mod feedback;
pub mod gates;
pub mod jobs;
pub mod logging;
pub mod orchestrator;
pub mod project;
pub mod util;
pub mod verify;
