//! CLI command implementations.
//!
//! | Module   | Commands handled     |
//! |----------|----------------------|
//! | `plan`   | `Plan`, `Validate`   |
//! | `run`    | `Run`                |
//! | `config` | `Config`             |

pub mod config;
pub mod plan;
pub mod run;

pub use config::cmd_config;
pub use plan::{cmd_plan, cmd_validate};
pub use run::{RunOptions, cmd_run};
