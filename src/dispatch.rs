//! Job submission, discovery and cancellation.
//!
//! [`JobDispatcher`] turns the raw text interface of a [`LabClient`] into
//! typed operations:
//!
//! - [`submit`](JobDispatcher::submit) parses the `Submitted: [...]`
//!   acknowledgment into job ids
//! - [`discover`](JobDispatcher::discover) reads a job's whiteboard and
//!   recipe sets
//! - [`fetch`](JobDispatcher::fetch) returns a parsed result tree
//! - [`cancel`](JobDispatcher::cancel) is best-effort and never fails

use std::sync::LazyLock;

use regex::Regex;
use tracing::{info, warn};

use crate::lab::{LabClient, LabError};
use crate::model::{Job, JobId, RecipeSetId, TaskSpec, TaskSpecError};
use crate::xml::{Element, XmlError};

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The submission tool answered with something other than a job list.
    #[error("Unable to submit the job! Unexpected output: {0:?}")]
    Acknowledgment(String),

    /// The lab tool failed.
    #[error(transparent)]
    Lab(#[from] LabError),

    /// A document could not be parsed.
    #[error("Malformed result for {taskspec}: {source}")]
    Malformed {
        taskspec: String,
        #[source]
        source: XmlError,
    },

    /// A job document to submit is not well-formed.
    #[error("Invalid job document: {0}")]
    InvalidJob(#[source] XmlError),

    #[error(transparent)]
    TaskSpec(#[from] TaskSpecError),
}

static SUBMITTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Submitted: \[(.*)\]$").expect("ack pattern is valid"));

static QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:'([^']+)'|"([^"]+)")\s*$"#).expect("quoted id pattern is valid")
});

/// Parses a submission acknowledgment.
///
/// The first line of the form `Submitted: ['J:1', 'J:2']` wins; every item
/// in its list must be a quoted job taskspec. Anything else (no such line,
/// an empty list, an unquoted item, a non-job id) is an error, never a
/// partial result.
pub fn parse_acknowledgment(output: &str) -> DispatchResult<Vec<JobId>> {
    let fail = || DispatchError::Acknowledgment(output.trim().to_string());

    let list = output
        .lines()
        .find_map(|line| SUBMITTED.captures(line.trim_end()))
        .map(|caps| caps[1].to_string())
        .ok_or_else(fail)?;

    if list.trim().is_empty() {
        return Err(fail());
    }

    let mut jobs = Vec::new();
    for item in list.split(',') {
        let caps = QUOTED.captures(item).ok_or_else(fail)?;
        let id = caps.get(1).or_else(|| caps.get(2)).ok_or_else(fail)?.as_str();
        match id.parse::<TaskSpec>() {
            Ok(TaskSpec::Job(job)) => jobs.push(job),
            _ => return Err(fail()),
        }
    }
    Ok(jobs)
}

/// Reads the whiteboard and recipe-set ids from a job result tree.
pub fn parse_job(id: JobId, root: &Element) -> Job {
    let whiteboard = root
        .child("whiteboard")
        .map(|w| w.text().trim().to_string())
        .unwrap_or_default();
    let recipe_sets = root
        .children_named("recipeSet")
        .filter_map(|rs| rs.attr("id"))
        .map(RecipeSetId::from_number)
        .collect();

    Job {
        id,
        recipe_sets,
        whiteboard,
    }
}

/// Typed front-end over a [`LabClient`].
pub struct JobDispatcher<C> {
    client: C,
}

impl<C: LabClient> JobDispatcher<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Submits a rendered job document.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Acknowledgment`] when the tool output does not match
    /// the acknowledgment grammar, [`DispatchError::Lab`] when the tool fails.
    pub async fn submit(&self, document: &str) -> DispatchResult<Vec<JobId>> {
        let output = self.client.submit(document).await?;
        let jobs = parse_acknowledgment(&output)?;
        for job in &jobs {
            info!("Submitted job {}", job);
        }
        Ok(jobs)
    }

    /// Fetches and parses the result tree of a job or recipe set.
    pub async fn fetch(&self, taskspec: &TaskSpec) -> DispatchResult<Element> {
        let output = self.client.results(taskspec).await?;
        Element::parse(&output).map_err(|source| DispatchError::Malformed {
            taskspec: taskspec.to_string(),
            source,
        })
    }

    /// Queries a job and returns its whiteboard and recipe sets.
    pub async fn discover(&self, job: &JobId) -> DispatchResult<Job> {
        let root = self.fetch(&TaskSpec::Job(job.clone())).await?;
        Ok(parse_job(job.clone(), &root))
    }

    /// Cancels a job, logging instead of failing.
    pub async fn cancel(&self, job: &JobId) {
        match self.client.cancel(job).await {
            Ok(()) => info!("Cancelled job {}", job),
            Err(e) => warn!("Failed to cancel job {}: {}", job, e),
        }
    }
}
