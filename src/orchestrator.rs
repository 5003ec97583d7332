//! Job orchestration and retry engine.
//!
//! The orchestrator renders the job templates, submits them, watches every
//! recipe set until it resolves and folds the results into a [`Verdict`].
//!
//! # Architecture
//!
//! ```text
//!   RunRequest
//!       │ replacements()
//!       ▼
//!   template::render_file ──► exclude_hosts_in_job ──► JobDispatcher::submit
//!                                                            │
//!                                                  discover ─┤
//!                                                            ▼
//!                                                        RunState
//!                                                    (watchlist, budget,
//!                                                     blacklist, results)
//!                                                            │
//!              ┌─────────────── watch() ◄────────────────────┤
//!              │                                             │
//!   Completed ─┼─► resolve                                   │
//!   Aborted   ─┼─► handle_infrastructure_failure ──► submit ─┘
//!   Running   ─┘   (budget, blacklist, narrowed job)
//!                                                            │
//!                                                            ▼
//!                                           aggregate::verdict ──► RunOutcome
//! ```
//!
//! # Exit codes
//!
//! | Code | Verdict |
//! |------|---------|
//! | 0 | Every completed non-soak task passed |
//! | 1 | A non-soak task failed |
//! | 2 | Infrastructure error, exhausted budget or interrupt |
//! | 3 | The kernel failed to install |
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
//!
//!     let request = RunRequest::new("https://builds/kernel-4.17.tar.gz", "4.17.0")
//!         .wait(true)
//!         .uid("build-42");
//!     let outcome = orchestrator.run(&request).await;
//!     std::process::exit(outcome.verdict.code());
//! }
//! ```

pub mod aggregate;
pub mod poller;
pub mod retry;
pub mod state;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::blacklist::{Blacklist, BlacklistError, exclude_hosts_in_job};
use crate::config::RunnerConfig;
use crate::dispatch::{DispatchError, JobDispatcher};
use crate::interrupt::InterruptGuard;
use crate::lab::LabClient;
use crate::model::{AbortBudget, JobId, RecipeSetId, Verdict};
use crate::template::{Replacements, TemplateError, render_file};
use crate::xml::Element;

use poller::WatchEnd;
pub use poller::classify;
pub use retry::{culprit_hosts, recipe_set_to_job};
pub use state::{ResolvedRecipeSet, RunState};

/// Errors that end a run early. [`Orchestrator::run`] turns them into
/// [`Verdict::Error`].
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Arguments of a single run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// URL of the kernel artifact to test.
    pub url: String,
    /// Kernel release string.
    pub release: String,
    /// Watch the submitted jobs until they finish.
    pub wait: bool,
    /// Identifier added to the job whiteboard.
    pub uid: String,
    pub arch: String,
    /// Force every recipe onto this host.
    pub host: Option<String>,
    /// Overrides the configured abort budget.
    pub max_aborted: Option<u32>,
}

impl RunRequest {
    pub fn new(url: impl Into<String>, release: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            release: release.into(),
            wait: false,
            uid: String::new(),
            arch: std::env::consts::ARCH.to_string(),
            host: None,
            max_aborted: None,
        }
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    pub fn arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = arch.into();
        self
    }

    pub fn host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    pub fn max_aborted(mut self, max_aborted: Option<u32>) -> Self {
        self.max_aborted = max_aborted;
        self
    }

    /// Template placeholder values for this request.
    pub fn replacements(&self) -> Replacements {
        let artifact = self.url.rsplit('/').next().unwrap_or_default();
        let uid = if self.uid.is_empty() {
            artifact.to_string()
        } else {
            format!("{} {}", self.uid, artifact)
        };
        let (hostname, hostnametag) = match &self.host {
            Some(host) => (
                format!("({}) ", host),
                format!(r#"<hostname op="=" value="{}"/>"#, host),
            ),
            None => (String::new(), String::new()),
        };

        BTreeMap::from([
            ("KVER".to_string(), Value::from(self.release.as_str())),
            ("KPKG_URL".to_string(), Value::from(self.url.as_str())),
            ("UID".to_string(), Value::from(uid)),
            ("ARCH".to_string(), Value::from(self.arch.as_str())),
            ("HOSTNAME".to_string(), Value::from(hostname)),
            ("HOSTNAMETAG".to_string(), Value::from(hostnametag)),
        ])
    }
}

/// Everything a finished run knows.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub verdict: Verdict,
    /// Every job submitted, retries included, in submission order.
    pub jobs: Vec<JobId>,
    pub whiteboard: Option<String>,
    /// Final trees of every recipe set that was not replaced by a retry.
    pub recipe_sets: BTreeMap<RecipeSetId, ResolvedRecipeSet>,
    /// Initial blacklist plus every host blamed during the run.
    pub blacklist: Blacklist,
    pub remaining_budget: u32,
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.verdict == Verdict::Success
    }
}

/// Drives a run against a [`LabClient`].
pub struct Orchestrator<C> {
    config: RunnerConfig,
    dispatcher: JobDispatcher<C>,
    guard: InterruptGuard,
    blacklist: Blacklist,
}

impl<C: LabClient> Orchestrator<C> {
    /// Creates an orchestrator with an empty blacklist and a fresh guard.
    pub fn new(config: RunnerConfig, client: C) -> Self {
        Self {
            config,
            dispatcher: JobDispatcher::new(client),
            guard: InterruptGuard::new(),
            blacklist: Blacklist::new(),
        }
    }

    /// Like [`new`](Self::new), loading the configured blacklist file.
    ///
    /// # Errors
    ///
    /// Returns [`BlacklistError`] if the blacklist file cannot be read.
    pub fn from_config(config: RunnerConfig, client: C) -> Result<Self, BlacklistError> {
        let blacklist = match config.blacklist_path() {
            Some(path) => {
                let blacklist = Blacklist::load(&path)?;
                info!(
                    "Loaded {} blacklisted host(s) from {}",
                    blacklist.len(),
                    path.display()
                );
                blacklist
            }
            None => Blacklist::new(),
        };
        Ok(Self::new(config, client).with_blacklist(blacklist))
    }

    /// Shares an interrupt guard, typically one with signal handlers
    /// installed.
    pub fn with_guard(mut self, guard: InterruptGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_blacklist(mut self, blacklist: Blacklist) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn guard(&self) -> &InterruptGuard {
        &self.guard
    }

    pub fn dispatcher(&self) -> &JobDispatcher<C> {
        &self.dispatcher
    }

    /// Runs one request to completion. Never fails: every error is logged
    /// and reported as [`Verdict::Error`].
    pub async fn run(&self, request: &RunRequest) -> RunOutcome {
        let started_at = Utc::now();
        let budget = AbortBudget::new(request.max_aborted.unwrap_or(self.config.max_aborted));
        let mut state = RunState::new(self.blacklist.clone(), budget);

        let verdict = match self.execute(request, &mut state).await {
            Ok(verdict) => verdict,
            Err(e) => {
                error!("{}", e);
                if request.wait {
                    self.cleanup(&mut state).await;
                }
                Verdict::Error
            }
        };

        RunOutcome {
            verdict,
            jobs: state.jobs,
            whiteboard: state.whiteboard,
            recipe_sets: state.recipe_set_results,
            blacklist: state.blacklist,
            remaining_budget: state.budget.remaining(),
            interrupted: self.guard.is_interrupted(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn execute(
        &self,
        request: &RunRequest,
        state: &mut RunState,
    ) -> Result<Verdict, RunError> {
        let values = request.replacements();

        let main = render_file(&self.config.jobtemplate_path(), &values)?;
        if self.guard.is_interrupted() {
            return Ok(self.interrupted(state).await);
        }
        self.submit_template(state, &main, false, request.wait).await?;

        if let Some(path) = self.config.soak_jobtemplate_path() {
            let soak = render_file(&path, &values)?;
            if self.guard.is_interrupted() {
                return Ok(self.interrupted(state).await);
            }
            self.submit_template(state, &soak, true, request.wait).await?;
        }

        if self.guard.is_interrupted() {
            return Ok(self.interrupted(state).await);
        }
        if !request.wait {
            info!("Not waiting for results, submitted {:?}", state.jobs);
            return Ok(Verdict::Success);
        }

        match self.watch(state).await? {
            WatchEnd::Drained => Ok(aggregate::verdict(
                &state.recipe_set_results,
                state.budget_exhausted,
            )),
            WatchEnd::BudgetExhausted => {
                error!("Too many aborted recipe sets, giving up");
                self.cleanup(state).await;
                Ok(Verdict::Error)
            }
            WatchEnd::Interrupted => Ok(self.interrupted(state).await),
        }
    }

    /// Cancels whatever was submitted so far, waiting or not.
    async fn interrupted(&self, state: &mut RunState) -> Verdict {
        warn!("Run interrupted");
        self.cleanup(state).await;
        Verdict::Error
    }

    /// Submits a rendered template with the blacklist applied and, when
    /// waiting, starts watching its recipe sets.
    async fn submit_template(
        &self,
        state: &mut RunState,
        rendered: &str,
        soak: bool,
        wait: bool,
    ) -> Result<(), RunError> {
        let job = Element::parse(rendered).map_err(DispatchError::InvalidJob)?;
        let job = exclude_hosts_in_job(&job, &state.blacklist);
        let document = job.to_xml().map_err(DispatchError::InvalidJob)?;

        for job_id in self.dispatcher.submit(&document).await? {
            state.record_job(&job_id);
            if wait {
                let job = self.dispatcher.discover(&job_id).await?;
                state.track_job(job, soak, 0, None);
            }
        }
        Ok(())
    }

    /// Cancels outstanding jobs once and stops watching everything.
    async fn cleanup(&self, state: &mut RunState) {
        let jobs = state.outstanding_jobs();
        if !self.guard.cleanup(&self.dispatcher, &jobs).await {
            info!("Cleanup already done");
        }
        state.abandon_all();
    }
}
