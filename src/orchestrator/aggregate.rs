//! Folding resolved recipe sets into a verdict.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::state::ResolvedRecipeSet;
use crate::model::{
    RecipeSetId, RecipeSetState, Task, TaskOutcome, Verdict, is_boot_task, recipe_test_list,
};
use crate::xml::Element;

/// What went wrong in one completed recipe set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetFindings {
    /// The boot task ran and did not pass.
    pub boot_failed: bool,
    /// Names of counted task failures.
    pub failed_tasks: Vec<String>,
    /// Systems of the recipes with failures.
    pub hosts: Vec<String>,
}

impl SetFindings {
    pub fn is_clean(&self) -> bool {
        !self.boot_failed && self.failed_tasks.is_empty()
    }
}

/// Inspects every task of a completed recipe set.
pub fn inspect(tree: &Element) -> SetFindings {
    let mut findings = SetFindings::default();
    for recipe in tree.descendants("recipe") {
        let mut recipe_failed = false;
        for element in recipe.children_named("task") {
            let task = Task::from_element(element);
            if is_boot_task(element) && task.outcome != TaskOutcome::Pass {
                findings.boot_failed = true;
                recipe_failed = true;
            }
            if task.is_failure() {
                findings.failed_tasks.push(task.name);
                recipe_failed = true;
            }
        }
        if recipe_failed
            && let Some(system) = recipe.attr("system")
            && !findings.hosts.iter().any(|h| h == system)
        {
            findings.hosts.push(system.to_string());
        }
        debug!(
            "Recipe {} ran: {}",
            recipe.attr("id").unwrap_or("?"),
            recipe_test_list(recipe).join(", ")
        );
    }
    findings
}

/// Computes the run verdict.
///
/// Precedence is Error, then BootFailure, then Failure. Only completed
/// non-soak sets are inspected; soak findings are logged and otherwise
/// ignored. A run without any completed non-soak set is an error.
pub fn verdict(
    results: &BTreeMap<RecipeSetId, ResolvedRecipeSet>,
    budget_exhausted: bool,
) -> Verdict {
    let mut boot_failure = false;
    let mut failure = false;
    let mut completed = 0usize;

    for (id, resolved) in results {
        if resolved.set.state != RecipeSetState::Completed {
            continue;
        }
        let findings = inspect(&resolved.tree);

        if resolved.set.soak {
            if !findings.is_clean() {
                warn!(
                    "Soak recipe set {} failed {} (ignored)",
                    id,
                    findings.failed_tasks.join(", ")
                );
            }
            continue;
        }

        completed += 1;
        if findings.is_clean() {
            continue;
        }
        boot_failure |= findings.boot_failed;
        failure = true;
        warn!(
            "{} failed on {}: {}",
            id,
            if findings.hosts.is_empty() {
                "unknown host".to_string()
            } else {
                findings.hosts.join(", ")
            },
            findings.failed_tasks.join(", ")
        );
    }

    let verdict = if budget_exhausted || completed == 0 {
        Verdict::Error
    } else if boot_failure {
        Verdict::BootFailure
    } else if failure {
        Verdict::Failure
    } else {
        Verdict::Success
    };
    info!("{} completed recipe set(s), verdict: {}", completed, verdict);
    verdict
}
