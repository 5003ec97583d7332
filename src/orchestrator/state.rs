//! Bookkeeping for a single run.

use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use crate::blacklist::Blacklist;
use crate::model::{AbortBudget, Job, JobId, RecipeSet, RecipeSetId, RecipeSetState};
use crate::xml::Element;

/// A recipe set that left the watchlist, with its last result tree.
#[derive(Debug, Clone)]
pub struct ResolvedRecipeSet {
    pub set: RecipeSet,
    pub tree: Element,
}

/// Mutable state of a run, owned by the watch loop.
#[derive(Debug)]
pub struct RunState {
    /// Recipe sets still awaited.
    pub(crate) watchlist: BTreeMap<RecipeSetId, RecipeSet>,
    /// Outstanding jobs and their unresolved recipe sets.
    pub(crate) job_to_recipe_sets: BTreeMap<JobId, BTreeSet<RecipeSetId>>,
    /// Recipe ids (`R:<n>`) seen finished, per recipe set.
    pub(crate) completed_recipes: BTreeMap<RecipeSetId, BTreeSet<String>>,
    /// Every recipe set that left the watchlist without being replaced.
    pub(crate) recipe_set_results: BTreeMap<RecipeSetId, ResolvedRecipeSet>,
    /// Every job submitted during the run, in submission order.
    pub(crate) jobs: Vec<JobId>,
    pub(crate) whiteboard: Option<String>,
    pub(crate) blacklist: Blacklist,
    pub(crate) budget: AbortBudget,
    /// Set when a non-soak infrastructure failure exhausted the budget.
    pub(crate) budget_exhausted: bool,
}

impl RunState {
    pub fn new(blacklist: Blacklist, budget: AbortBudget) -> Self {
        Self {
            watchlist: BTreeMap::new(),
            job_to_recipe_sets: BTreeMap::new(),
            completed_recipes: BTreeMap::new(),
            recipe_set_results: BTreeMap::new(),
            jobs: Vec::new(),
            whiteboard: None,
            blacklist,
            budget,
            budget_exhausted: false,
        }
    }

    /// Records a submitted job. It counts as outstanding until its recipe
    /// sets are known and resolved.
    pub fn record_job(&mut self, job: &JobId) {
        if !self.jobs.contains(job) {
            self.jobs.push(job.clone());
        }
        self.job_to_recipe_sets.entry(job.clone()).or_default();
    }

    /// Starts watching every recipe set of a job.
    pub fn track_job(&mut self, job: Job, soak: bool, retries: u32, origin: Option<RecipeSetId>) {
        self.record_job(&job.id);
        if self.whiteboard.is_none() {
            self.whiteboard = Some(job.whiteboard.clone());
        }

        let sets = self.job_to_recipe_sets.entry(job.id.clone()).or_default();
        for id in job.recipe_sets {
            sets.insert(id.clone());
            self.completed_recipes.insert(id.clone(), BTreeSet::new());
            info!("Added {} to watchlist{}", id, if soak { " (soak)" } else { "" });
            self.watchlist.insert(
                id.clone(),
                RecipeSet {
                    id,
                    job: job.id.clone(),
                    state: RecipeSetState::Waiting,
                    soak,
                    retries,
                    origin: origin.clone(),
                },
            );
        }
    }

    /// Removes a recipe set from the watchlist and from its job, dropping
    /// the job once it has no unresolved sets left.
    pub fn forget(&mut self, id: &RecipeSetId) -> Option<RecipeSet> {
        let set = self.watchlist.remove(id)?;
        self.completed_recipes.remove(id);
        if let Some(sets) = self.job_to_recipe_sets.get_mut(&set.job) {
            sets.remove(id);
            if sets.is_empty() {
                self.job_to_recipe_sets.remove(&set.job);
            }
        }
        Some(set)
    }

    /// Stores the final tree of a set that left the watchlist for good.
    pub fn resolve(&mut self, mut set: RecipeSet, state: RecipeSetState, tree: Element) {
        set.state = state;
        self.recipe_set_results
            .insert(set.id.clone(), ResolvedRecipeSet { set, tree });
    }

    /// Jobs that still own unresolved recipe sets.
    pub fn outstanding_jobs(&self) -> Vec<JobId> {
        self.job_to_recipe_sets.keys().cloned().collect()
    }

    /// Drops every remaining watchlist entry.
    pub fn abandon_all(&mut self) {
        let ids: Vec<_> = self.watchlist.keys().cloned().collect();
        for id in ids {
            self.forget(&id);
        }
    }
}
