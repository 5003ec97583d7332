//! Recovery from aborted and cancelled recipe sets.
//!
//! A failed set costs one unit of the shared abort budget. The hosts it ran
//! on are blacklisted, and unless the budget is gone the set is resubmitted
//! on its own as a narrowed job whose recipe sets replace it in the
//! watchlist.

use tracing::{error, info, warn};

use super::Orchestrator;
use super::poller::recipe_state;
use super::state::RunState;
use crate::blacklist::exclude_hosts_in_job;
use crate::dispatch::{DispatchError, DispatchResult};
use crate::lab::LabClient;
use crate::model::{RecipeSet, RecipeSetId};
use crate::xml::Element;

/// Attributes the scheduler adds to results that must not be resubmitted.
const RUNTIME_ATTRS: &[&str] = &[
    "id",
    "status",
    "result",
    "system",
    "start_time",
    "finish_time",
    "duration",
    "recipe_id",
    "job_id",
    "recipe_set_id",
    "task_id",
    "result_id",
    "distro",
    "family",
    "variant",
    "arch",
];

/// Result-only children dropped from resubmitted recipes.
const RUNTIME_CHILDREN: &[&str] = &["logs", "results", "installation"];

/// Hosts to blame for an infrastructure failure.
///
/// These are the systems of the aborted or cancelled recipes. When the
/// scheduler did not record any, the hosts pinned in `hostRequires` are
/// used, and failing that every system the set ran on.
pub fn culprit_hosts(tree: &Element) -> Vec<String> {
    let mut hosts = Vec::new();

    let recipes = tree.descendants("recipe");
    for recipe in &recipes {
        if recipe_state(recipe).is_infrastructure_failure()
            && let Some(system) = recipe.attr("system")
        {
            push_unique(&mut hosts, system);
        }
    }
    if !hosts.is_empty() {
        return hosts;
    }

    for pin in pinned_hosts(tree) {
        push_unique(&mut hosts, &pin);
    }
    if !hosts.is_empty() {
        return hosts;
    }

    for system in recipes.iter().filter_map(|r| r.attr("system")) {
        push_unique(&mut hosts, system);
    }
    hosts
}

fn push_unique(hosts: &mut Vec<String>, host: &str) {
    if !host.is_empty() && !hosts.iter().any(|h| h == host) {
        hosts.push(host.to_string());
    }
}

/// Hosts required through `<hostname op="=" .../>`.
fn pinned_hosts(tree: &Element) -> Vec<String> {
    tree.descendants("hostRequires")
        .into_iter()
        .flat_map(|hreq| hreq.descendants("hostname"))
        .filter(|h| matches!(h.attr("op"), Some("=") | Some("==")))
        .filter_map(|h| h.attr("value").map(str::to_string))
        .collect()
}

/// Builds a job that reruns a single recipe set.
///
/// Host constraints are removed from every `hostRequires` (both pins and
/// earlier exclusions, the caller reapplies the blacklist). With `samehost`
/// each recipe is pinned back to the system it ran on. Runtime attributes
/// and result children are stripped so the scheduler accepts the document.
pub fn recipe_set_to_job(
    tree: &Element,
    id: &RecipeSetId,
    whiteboard: &str,
    samehost: bool,
) -> Element {
    let mut recipe_set = if tree.name == "recipeSet" {
        tree.clone()
    } else {
        tree.find("recipeSet").cloned().unwrap_or_else(|| tree.clone())
    };
    recipe_set.name = "recipeSet".to_string();

    let mut systems = Vec::new();
    for system in recipe_set
        .descendants("recipe")
        .into_iter()
        .filter_map(|r| r.attr("system"))
    {
        push_unique(&mut systems, system);
    }

    recipe_set.for_each_descendant_mut("hostRequires", &mut |hreq| {
        hreq.remove_descendants(&|e| e.name == "hostname");
    });

    if samehost {
        pin_recipes(&mut recipe_set);
    }

    strip_runtime(&mut recipe_set);
    recipe_set.remove_descendants(&|e| RUNTIME_CHILDREN.contains(&e.name.as_str()));

    let mut text = format!("{} [{}]", whiteboard, id);
    if samehost && !systems.is_empty() {
        text.push_str(&format!(" ({})", systems.join(", ")));
    }

    let mut job = Element::new("job");
    job.push(Element::new("whiteboard").with_text(text));
    job.push(recipe_set);
    job
}

/// Pins every recipe (guest recipes included) to its recorded system.
fn pin_recipes(element: &mut Element) {
    for child in element.elements_mut() {
        if matches!(child.name.as_str(), "recipe" | "guestrecipe")
            && let Some(system) = child.attr("system").map(str::to_string)
        {
            if child.child("hostRequires").is_none() {
                child.push(Element::new("hostRequires"));
            }
            if let Some(hreq) = child.child_mut("hostRequires") {
                hreq.push(
                    Element::new("hostname")
                        .with_attr("op", "=")
                        .with_attr("value", system),
                );
            }
        }
        pin_recipes(child);
    }
}

fn strip_runtime(element: &mut Element) {
    if matches!(
        element.name.as_str(),
        "recipeSet" | "recipe" | "guestrecipe" | "task"
    ) {
        for attr in RUNTIME_ATTRS {
            element.remove_attr(attr);
        }
    }
    for child in element.elements_mut() {
        strip_runtime(child);
    }
}

impl<C: LabClient> Orchestrator<C> {
    /// Handles a recipe set the scheduler aborted or cancelled.
    ///
    /// The set leaves the watchlist either way. It is resolved when the
    /// budget is exhausted, replaced by the narrowed job's sets otherwise.
    pub(crate) async fn handle_infrastructure_failure(
        &self,
        state: &mut RunState,
        set: RecipeSet,
        tree: Element,
    ) -> DispatchResult<()> {
        state.forget(&set.id);
        let exhausted = state.budget.consume();

        let culprits = culprit_hosts(&tree);
        for host in &culprits {
            if state.blacklist.insert(host) {
                info!("Blacklisted {} after {} failed", host, set.id);
            }
        }

        if exhausted {
            let status = set.state;
            if set.soak {
                warn!(
                    "Abort budget exhausted, giving up on soak recipe set {}",
                    set.id
                );
            } else {
                error!(
                    "Abort budget exhausted by {}, no further retries",
                    set.id
                );
                state.budget_exhausted = true;
            }
            state.resolve(set, status, tree);
            return Ok(());
        }

        let samehost = self.config.samehost;
        let whiteboard = state.whiteboard.clone().unwrap_or_default();
        let job = recipe_set_to_job(&tree, &set.id, &whiteboard, samehost);

        let blacklist = if samehost {
            culprits
                .iter()
                .fold(state.blacklist.clone(), |list, host| list.without(host))
        } else {
            state.blacklist.clone()
        };
        let job = exclude_hosts_in_job(&job, &blacklist);
        let document = job.to_xml().map_err(DispatchError::InvalidJob)?;

        info!(
            "Resubmitting {} (retry {}, {} abort(s) left)",
            set.id,
            set.retries + 1,
            state.budget.remaining()
        );
        let origin = set.origin.clone().unwrap_or_else(|| set.id.clone());
        for job_id in self.dispatcher.submit(&document).await? {
            let job = self.dispatcher.discover(&job_id).await?;
            state.track_job(job, set.soak, set.retries + 1, Some(origin.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABORTED: &str = r#"<recipeSet id="77" status="Aborted" result="Warn">
        <recipe id="700" status="Aborted" result="Warn" system="host1.example.com" arch="x86_64">
          <hostRequires>
            <and><hostname op="!=" value="old.example.com"/><arch op="=" value="x86_64"/></and>
            <hostname op="=" value="pinned.example.com"/>
          </hostRequires>
          <task id="1" name="/distribution/install" status="Completed" result="Pass">
            <logs><log name="taskout.log"/></logs>
          </task>
          <task id="2" name="/kernel/misc/ltp" status="Aborted" result="Warn"/>
        </recipe>
      </recipeSet>"#;

    #[test]
    fn test_culprit_hosts_prefers_failed_recipes() {
        let tree = Element::parse(
            r#"<recipeSet id="1">
                 <recipe id="1" status="Completed" system="good"/>
                 <recipe id="2" status="Aborted" system="bad"/>
               </recipeSet>"#,
        )
        .unwrap();
        assert_eq!(culprit_hosts(&tree), vec!["bad"]);
    }

    #[test]
    fn test_culprit_hosts_uses_task_states() {
        let tree = Element::parse(
            r#"<recipeSet id="1">
                 <recipe id="1" status="Completed" system="good"/>
                 <recipe id="2" status="Running" system="bad">
                   <task status="Aborted" result="Warn"/>
                 </recipe>
               </recipeSet>"#,
        )
        .unwrap();
        assert_eq!(culprit_hosts(&tree), vec!["bad"]);
    }

    #[test]
    fn test_culprit_hosts_falls_back_to_pins() {
        let tree = Element::parse(
            r#"<recipeSet id="1" status="Cancelled">
                 <recipe id="1" status="Cancelled">
                   <hostRequires><hostname op="=" value="pinned"/></hostRequires>
                 </recipe>
               </recipeSet>"#,
        )
        .unwrap();
        assert_eq!(culprit_hosts(&tree), vec!["pinned"]);
    }

    #[test]
    fn test_recipe_set_to_job_strips_host_constraints() {
        let tree = Element::parse(ABORTED).unwrap();
        let job = recipe_set_to_job(&tree, &RecipeSetId::from_number("77"), "wb", false);

        assert_eq!(job.name, "job");
        assert_eq!(job.child("whiteboard").unwrap().text(), "wb [RS:77]");
        assert!(job.descendants("hostname").is_empty());
        // Other requirements survive.
        assert_eq!(job.descendants("arch").len(), 1);

        let recipe = job.find("recipeSet/recipe").unwrap();
        assert_eq!(recipe.attr("id"), None);
        assert_eq!(recipe.attr("system"), None);
        assert_eq!(recipe.attr("status"), None);
        assert!(job.descendants("logs").is_empty());
        assert!(
            job.descendants("task")
                .iter()
                .all(|t| t.attr("result").is_none() && t.attr("name").is_some())
        );
    }

    #[test]
    fn test_recipe_set_to_job_samehost_pins_system() {
        let tree = Element::parse(ABORTED).unwrap();
        let job = recipe_set_to_job(&tree, &RecipeSetId::from_number("77"), "wb", true);

        assert_eq!(
            job.child("whiteboard").unwrap().text(),
            "wb [RS:77] (host1.example.com)"
        );
        let hostnames = job.descendants("hostname");
        assert_eq!(hostnames.len(), 1);
        assert_eq!(hostnames[0].attr("op"), Some("="));
        assert_eq!(hostnames[0].attr("value"), Some("host1.example.com"));
    }
}
