//! CLI command implementations.
//!
//! | Module     | Commands handled       |
//! |------------|------------------------|
//! | `run`      | `Run`, `Baseline`      |
//! | `status`   | `Status`, `Validate`   |
//! | `decide`   | `Decide`               |
//! | `config`   | `Config`               |
//! | `serve`    | `Serve`                |

pub mod config;
pub mod decide;
pub mod run;
pub mod serve;
pub mod status;

pub use config::cmd_config;
pub use decide::cmd_decide;
pub use run::{cmd_baseline, cmd_run};
pub use serve::cmd_serve;
pub use status::{cmd_status, cmd_validate};
