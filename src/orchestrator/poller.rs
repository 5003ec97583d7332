//! The watch loop.
//!
//! Each iteration queries every watched recipe set once and moves it
//! forward:
//!
//! ```text
//!   Waiting/Running ──► (left in watchlist)
//!   Completed ───────► resolved, results kept for the verdict
//!   Aborted/Cancelled ► RetryCoordinator (resubmit or give up)
//! ```
//!
//! Interrupts are checked before every query and race the sleep between
//! iterations. Budget exhaustion lets the current batch finish before the
//! loop stops.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::Orchestrator;
use super::state::RunState;
use crate::dispatch::DispatchResult;
use crate::lab::LabClient;
use crate::model::{RecipeSet, RecipeSetState, TaskSpec};
use crate::xml::Element;

/// Why the watch loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchEnd {
    /// Every recipe set was resolved.
    Drained,
    /// A non-soak infrastructure failure exhausted the abort budget.
    BudgetExhausted,
    /// An interrupt arrived.
    Interrupted,
}

/// Derives the state of a recipe set from its result tree.
///
/// Recipes seen finished are added to `finished` (as `R:<id>`). The set is
/// only resolved once every recipe is finished, even if Beaker still
/// reports the set itself as running.
pub fn classify(tree: &Element, finished: &mut BTreeSet<String>) -> RecipeSetState {
    let recipes: Vec<&Element> = tree.children_named("recipe").collect();
    if recipes.is_empty() {
        return tree
            .attr("status")
            .map(RecipeSetState::from_status)
            .unwrap_or(RecipeSetState::Waiting);
    }

    let mut states = Vec::with_capacity(recipes.len());
    for (idx, recipe) in recipes.iter().enumerate() {
        let state = recipe_state(recipe);
        if state.is_finished() {
            let key = match recipe.attr("id") {
                Some(id) => format!("R:{}", id),
                None => format!("R:#{}", idx),
            };
            finished.insert(key);
        }
        states.push(state);
    }

    if states.iter().all(|s| s.is_finished()) {
        if states.contains(&RecipeSetState::Cancelled) {
            RecipeSetState::Cancelled
        } else if states.contains(&RecipeSetState::Aborted) {
            RecipeSetState::Aborted
        } else {
            RecipeSetState::Completed
        }
    } else if states.iter().all(|s| *s == RecipeSetState::Waiting) {
        RecipeSetState::Waiting
    } else {
        RecipeSetState::Running
    }
}

/// State of one recipe. A recipe whose tasks all finished counts as
/// finished even while Beaker still lists it as running, and takes the
/// worst task state: cancelled, then aborted, then completed.
pub(crate) fn recipe_state(recipe: &Element) -> RecipeSetState {
    let state = recipe
        .attr("status")
        .map(RecipeSetState::from_status)
        .unwrap_or(RecipeSetState::Waiting);
    if state.is_finished() {
        return state;
    }

    let tasks: Vec<RecipeSetState> = recipe
        .children_named("task")
        .map(|t| {
            t.attr("status")
                .map(RecipeSetState::from_status)
                .unwrap_or(RecipeSetState::Waiting)
        })
        .collect();
    if tasks.is_empty() || !tasks.iter().all(|s| s.is_finished()) {
        state
    } else if tasks.contains(&RecipeSetState::Cancelled) {
        RecipeSetState::Cancelled
    } else if tasks.contains(&RecipeSetState::Aborted) {
        RecipeSetState::Aborted
    } else {
        RecipeSetState::Completed
    }
}

impl<C: LabClient> Orchestrator<C> {
    /// Polls until the watchlist drains, the budget runs out or an
    /// interrupt arrives. Dispatch and document errors end the loop early.
    pub(crate) async fn watch(&self, state: &mut RunState) -> DispatchResult<WatchEnd> {
        let token = self.guard.token();
        let mut iteration = 0u64;

        while !state.watchlist.is_empty() {
            if iteration > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.watchdelay()) => {}
                    _ = token.cancelled() => {}
                }
            }
            if token.is_cancelled() {
                return Ok(WatchEnd::Interrupted);
            }

            debug!(
                "Poll iteration {}: {} recipe set(s) outstanding",
                iteration,
                state.watchlist.len()
            );

            let batch: Vec<RecipeSet> = state.watchlist.values().cloned().collect();
            for set in batch {
                if token.is_cancelled() {
                    return Ok(WatchEnd::Interrupted);
                }
                self.poll_one(state, set).await?;
            }

            if state.budget_exhausted {
                return Ok(WatchEnd::BudgetExhausted);
            }
            iteration += 1;
        }

        Ok(WatchEnd::Drained)
    }

    async fn poll_one(&self, state: &mut RunState, set: RecipeSet) -> DispatchResult<()> {
        let tree = self
            .dispatcher
            .fetch(&TaskSpec::RecipeSet(set.id.clone()))
            .await?;

        let finished = state.completed_recipes.entry(set.id.clone()).or_default();
        let status = classify(&tree, finished);

        match status {
            RecipeSetState::Completed => {
                info!("{} status changed to 'Completed', removing from watchlist", set.id);
                state.forget(&set.id);
                state.resolve(set, status, tree);
            }
            RecipeSetState::Aborted | RecipeSetState::Cancelled => {
                warn!("{} status changed to '{:?}'", set.id, status);
                let mut set = set;
                set.state = status;
                self.handle_infrastructure_failure(state, set, tree).await?;
            }
            RecipeSetState::Waiting | RecipeSetState::Running => {
                if let Some(watched) = state.watchlist.get_mut(&set.id) {
                    watched.state = status;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_str(xml: &str) -> (RecipeSetState, BTreeSet<String>) {
        let tree = Element::parse(xml).unwrap();
        let mut finished = BTreeSet::new();
        let state = classify(&tree, &mut finished);
        (state, finished)
    }

    #[test]
    fn test_classify_completed() {
        let (state, finished) = classify_str(
            r#"<recipeSet id="1"><recipe id="10" status="Completed"/>
               <recipe id="11" status="Completed"/></recipeSet>"#,
        );
        assert_eq!(state, RecipeSetState::Completed);
        assert_eq!(finished.len(), 2);
    }

    #[test]
    fn test_classify_partial_is_running() {
        let (state, finished) = classify_str(
            r#"<recipeSet id="1"><recipe id="10" status="Completed"/>
               <recipe id="11" status="Running"/></recipeSet>"#,
        );
        assert_eq!(state, RecipeSetState::Running);
        assert!(finished.contains("R:10"));
        assert!(!finished.contains("R:11"));
    }

    #[test]
    fn test_classify_waits_for_all_recipes_before_abort() {
        let (state, _) = classify_str(
            r#"<recipeSet id="1"><recipe id="10" status="Aborted"/>
               <recipe id="11" status="Running"/></recipeSet>"#,
        );
        assert_eq!(state, RecipeSetState::Running);

        let (state, _) = classify_str(
            r#"<recipeSet id="1"><recipe id="10" status="Aborted"/>
               <recipe id="11" status="Completed"/></recipeSet>"#,
        );
        assert_eq!(state, RecipeSetState::Aborted);
    }

    #[test]
    fn test_classify_cancelled_wins() {
        let (state, _) = classify_str(
            r#"<recipeSet id="1"><recipe id="10" status="Aborted"/>
               <recipe id="11" status="Cancelled"/></recipeSet>"#,
        );
        assert_eq!(state, RecipeSetState::Cancelled);
    }

    #[test]
    fn test_classify_running_recipe_with_finished_tasks() {
        let (state, finished) = classify_str(
            r#"<recipeSet id="1"><recipe id="10" status="Running">
               <task status="Completed" result="Pass"/>
               <task status="Completed" result="Pass"/></recipe></recipeSet>"#,
        );
        assert_eq!(state, RecipeSetState::Completed);
        assert!(finished.contains("R:10"));
    }

    #[test]
    fn test_classify_running_recipe_with_aborted_tasks() {
        let (state, finished) = classify_str(
            r#"<recipeSet id="1"><recipe id="10" status="Running">
               <task status="Completed" result="Pass"/>
               <task status="Aborted" result="Warn"/></recipe></recipeSet>"#,
        );
        assert_eq!(state, RecipeSetState::Aborted);
        assert!(finished.contains("R:10"));

        let (state, _) = classify_str(
            r#"<recipeSet id="1"><recipe id="10" status="Running">
               <task status="Aborted" result="Warn"/>
               <task status="Cancelled" result="Warn"/></recipe></recipeSet>"#,
        );
        assert_eq!(state, RecipeSetState::Cancelled);
    }

    #[test]
    fn test_classify_queued() {
        let (state, finished) = classify_str(
            r#"<recipeSet id="1"><recipe id="10" status="Queued"><task status="New"/></recipe></recipeSet>"#,
        );
        assert_eq!(state, RecipeSetState::Waiting);
        assert!(finished.is_empty());
    }

    #[test]
    fn test_classify_without_recipes_uses_set_status() {
        let (state, _) = classify_str(r#"<recipeSet id="1" status="Aborted"/>"#);
        assert_eq!(state, RecipeSetState::Aborted);
    }
}
