//! labrun: kernel test-job orchestration for the Beaker lab scheduler.
//!
//! Given a kernel build, labrun renders Beaker job templates, submits them
//! with the `bkr` tool, watches every recipe set until it resolves, retries
//! the ones the lab aborted (excluding their hosts) under a shared abort
//! budget and folds the results into one exit code.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Template**: `##NAME##` substitution into job XML ([`template`])
//! - **Blacklist**: host exclusion constraints ([`blacklist`])
//! - **Lab**: the `bkr` process boundary ([`lab`]) behind [`LabClient`]
//! - **Dispatch**: submission, discovery and cancellation ([`dispatch`])
//! - **Orchestrator**: watch loop, retries and verdict ([`orchestrator`])
//! - **Interrupt**: signal handling and one-shot cleanup ([`interrupt`])
//!
//! # Example
//!
//! ```no_run
//! use labrun::config::load_config;
//! use labrun::lab::BkrClient;
//! use labrun::orchestrator::{Orchestrator, RunRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("labrun.toml"))?;
//!     let client = BkrClient::new(&config.bkr)?;
//!     let orchestrator = Orchestrator::from_config(config.runner, client)?;
//!     let outcome = orchestrator
//!         .run(&RunRequest::new("https://builds/kernel.tar.gz", "4.17.0").wait(true))
//!         .await;
//!     std::process::exit(outcome.verdict.code());
//! }
//! ```

pub mod blacklist;
pub mod config;
pub mod dispatch;
pub mod interrupt;
pub mod lab;
pub mod model;
pub mod orchestrator;
pub mod report;
pub mod template;
pub mod xml;

// Re-export commonly used types
pub use blacklist::Blacklist;
pub use config::{Config, load_config};
pub use interrupt::InterruptGuard;
pub use lab::{BkrClient, LabClient};
pub use model::{TaskSpec, Verdict};
pub use orchestrator::{Orchestrator, RunOutcome, RunRequest};
