//! Core data types shared by the dispatcher, poller and aggregator.
//!
//! Identifiers are kept in Beaker's taskspec form (`J:123`, `RS:456`,
//! `R:789`) so they can be handed straight back to `bkr`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::xml::Element;

/// Error for identifiers that are not a known taskspec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown taskspec type: {0}")]
pub struct TaskSpecError(pub String);

/// A Beaker job identifier, e.g. `J:123`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(String);

/// A Beaker recipe-set identifier, e.g. `RS:456`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecipeSetId(String);

impl JobId {
    /// Builds a job id from the numeric part.
    pub fn from_number(id: &str) -> Self {
        Self(format!("J:{}", id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl RecipeSetId {
    /// Builds a recipe-set id from the numeric part.
    pub fn from_number(id: &str) -> Self {
        Self(format!("RS:{}", id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RecipeSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something `bkr job-results` can be asked about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskSpec {
    Job(JobId),
    RecipeSet(RecipeSetId),
}

impl FromStr for TaskSpec {
    type Err = TaskSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("J:")
            && !rest.is_empty()
        {
            Ok(TaskSpec::Job(JobId(s.to_string())))
        } else if let Some(rest) = s.strip_prefix("RS:")
            && !rest.is_empty()
        {
            Ok(TaskSpec::RecipeSet(RecipeSetId(s.to_string())))
        } else {
            Err(TaskSpecError(s.to_string()))
        }
    }
}

impl fmt::Display for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskSpec::Job(id) => fmt::Display::fmt(id, f),
            TaskSpec::RecipeSet(id) => fmt::Display::fmt(id, f),
        }
    }
}

impl From<JobId> for TaskSpec {
    fn from(id: JobId) -> Self {
        TaskSpec::Job(id)
    }
}

impl From<RecipeSetId> for TaskSpec {
    fn from(id: RecipeSetId) -> Self {
        TaskSpec::RecipeSet(id)
    }
}

/// Lifecycle state of a recipe set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipeSetState {
    Waiting,
    Running,
    Completed,
    Aborted,
    Cancelled,
}

impl RecipeSetState {
    /// Maps a Beaker status string. Queued/scheduled/installing states all
    /// count as waiting; anything unknown is treated as still running.
    pub fn from_status(status: &str) -> Self {
        match status {
            "Completed" => RecipeSetState::Completed,
            "Aborted" => RecipeSetState::Aborted,
            "Cancelled" => RecipeSetState::Cancelled,
            "New" | "Processed" | "Queued" | "Scheduled" | "Waiting" => RecipeSetState::Waiting,
            _ => RecipeSetState::Running,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            RecipeSetState::Completed | RecipeSetState::Aborted | RecipeSetState::Cancelled
        )
    }

    /// Aborted and cancelled sets are infrastructure failures.
    pub fn is_infrastructure_failure(self) -> bool {
        matches!(self, RecipeSetState::Aborted | RecipeSetState::Cancelled)
    }
}

/// A recipe set being tracked by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeSet {
    pub id: RecipeSetId,
    pub job: JobId,
    pub state: RecipeSetState,
    /// Soak sets are recorded but excluded from the verdict.
    pub soak: bool,
    /// Number of resubmissions that led to this set.
    pub retries: u32,
    /// The recipe set this one (transitively) replaces.
    pub origin: Option<RecipeSetId>,
}

/// A submitted job and the recipe sets it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub recipe_sets: Vec<RecipeSetId>,
    pub whiteboard: String,
}

/// Outcome of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Pass,
    Warn,
    Fail,
    Panic,
    /// The task never ran.
    Skip,
    None,
}

impl TaskOutcome {
    pub fn from_result(result: &str) -> Self {
        match result {
            "Pass" => TaskOutcome::Pass,
            "Warn" => TaskOutcome::Warn,
            "Fail" => TaskOutcome::Fail,
            "Panic" => TaskOutcome::Panic,
            "Skip" => TaskOutcome::Skip,
            _ => TaskOutcome::None,
        }
    }
}

/// Kernel install task, the boot stage of every recipe.
pub const KPKGINSTALL_TASK: &str = "/distribution/kpkginstall";

/// A task of a recipe, as read from a result tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub outcome: TaskOutcome,
    pub waived: bool,
}

impl Task {
    /// Reads a `<task>` element.
    pub fn from_element(task: &Element) -> Self {
        let waived = task
            .find_all("params/param")
            .into_iter()
            .any(|p| p.attr("name") == Some("_WAIVED") && p.attr("value").is_some_and(is_truthy));

        Task {
            name: task.attr("name").unwrap_or_default().to_string(),
            outcome: TaskOutcome::from_result(task.attr("result").unwrap_or_default()),
            waived,
        }
    }

    /// Whether this task flips the verdict to failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self.outcome, TaskOutcome::Pass | TaskOutcome::Skip) && !self.waived
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// Whether a `<task>` element is the kernel install (boot) task.
pub fn is_boot_task(task: &Element) -> bool {
    task.attr("name") == Some(KPKGINSTALL_TASK)
        || task
            .child("fetch")
            .and_then(|f| f.attr("url"))
            .is_some_and(|url| url.contains("kpkginstall"))
}

/// Names of the tasks of a recipe that actually ran.
pub fn recipe_test_list(recipe: &Element) -> Vec<String> {
    recipe
        .children_named("task")
        .filter(|t| t.attr("result") != Some("Skip"))
        .filter_map(|t| t.attr("name").map(str::to_string))
        .collect()
}

/// Final verdict of a run, used as the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Success,
    Failure,
    Error,
    BootFailure,
}

impl Verdict {
    pub fn code(self) -> i32 {
        match self {
            Verdict::Success => 0,
            Verdict::Failure => 1,
            Verdict::Error => 2,
            Verdict::BootFailure => 3,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Success => "success",
            Verdict::Failure => "failure",
            Verdict::Error => "error",
            Verdict::BootFailure => "boot failure",
        };
        f.write_str(s)
    }
}

/// Run-wide budget of infrastructure failures.
///
/// The counter only ever goes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortBudget {
    remaining: u32,
}

impl AbortBudget {
    pub fn new(max_aborted: u32) -> Self {
        Self {
            remaining: max_aborted,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Consumes one unit and reports whether the budget is now exhausted.
    pub fn consume(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.is_exhausted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taskspec_parse() {
        assert_eq!(
            "J:123".parse::<TaskSpec>(),
            Ok(TaskSpec::Job(JobId::from_number("123")))
        );
        assert_eq!(
            "RS:456".parse::<TaskSpec>(),
            Ok(TaskSpec::RecipeSet(RecipeSetId::from_number("456")))
        );
    }

    #[test]
    fn test_taskspec_unknown() {
        let err = "OHCOMEON:00001".parse::<TaskSpec>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown taskspec type: OHCOMEON:00001");
        assert!("J:".parse::<TaskSpec>().is_err());
        assert!("R:1".parse::<TaskSpec>().is_err());
    }

    #[test]
    fn test_task_failure_rules() {
        let task = |result: &str, waived: bool| Task {
            name: "t".to_string(),
            outcome: TaskOutcome::from_result(result),
            waived,
        };
        assert!(!task("Pass", false).is_failure());
        assert!(!task("Skip", false).is_failure());
        assert!(task("Warn", false).is_failure());
        assert!(task("Fail", false).is_failure());
        assert!(task("Panic", false).is_failure());
        assert!(task("None", false).is_failure());
        assert!(!task("Fail", true).is_failure());
        assert!(!task("Panic", true).is_failure());
    }

    #[test]
    fn test_task_waived_param() {
        let element = Element::parse(
            r#"<task name="/kernel/x" result="Fail"><params>
               <param name="_WAIVED" value="True"/></params></task>"#,
        )
        .unwrap();
        let task = Task::from_element(&element);
        assert!(task.waived);
        assert_eq!(task.outcome, TaskOutcome::Fail);
        assert!(!task.is_failure());
    }

    #[test]
    fn test_boot_task_detection() {
        let recipe = Element::parse(
            r#"<recipe><task name="Boot test"><fetch url="kpkginstall"/></task>
               <task name="/distribution/kpkginstall"/><task name="other"/></recipe>"#,
        )
        .unwrap();
        let boot: Vec<_> = recipe
            .children_named("task")
            .filter(|t| is_boot_task(t))
            .filter_map(|t| t.attr("name"))
            .collect();
        assert_eq!(boot, vec!["Boot test", "/distribution/kpkginstall"]);
    }

    #[test]
    fn test_recipe_test_list_skips() {
        let recipe = Element::parse(
            r#"<recipe><task result="Skip" name="bad"/><task name="good1"/>
               <task name="good2" result="Pass"/></recipe>"#,
        )
        .unwrap();
        assert_eq!(recipe_test_list(&recipe), vec!["good1", "good2"]);
    }

    #[test]
    fn test_abort_budget_monotonic() {
        let mut budget = AbortBudget::new(2);
        assert!(!budget.consume());
        assert_eq!(budget.remaining(), 1);
        assert!(budget.consume());
        assert!(budget.consume());
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_verdict_codes() {
        assert_eq!(Verdict::Success.code(), 0);
        assert_eq!(Verdict::Failure.code(), 1);
        assert_eq!(Verdict::Error.code(), 2);
        assert_eq!(Verdict::BootFailure.code(), 3);
    }
}
