//! Console output for finished runs.

use crate::model::Verdict;
use crate::orchestrator::{RunOutcome, aggregate};

/// Prints a summary of a run to the console.
///
/// Lists every submitted job, the resolved recipe sets with their retry
/// history and failing tasks, the blacklist and the verdict.
pub fn print_summary(outcome: &RunOutcome) {
    println!();
    println!("Run Results:");
    if let Some(whiteboard) = &outcome.whiteboard {
        println!("  Whiteboard: {}", whiteboard);
    }
    let jobs: Vec<&str> = outcome.jobs.iter().map(|j| j.as_str()).collect();
    println!("  Jobs:       {}", jobs.join(" "));

    for (id, resolved) in &outcome.recipe_sets {
        let set = &resolved.set;
        let mut line = format!("  {} {:?}", id, set.state);
        if set.soak {
            line.push_str(" (soak)");
        }
        if let Some(origin) = &set.origin {
            line.push_str(&format!(" retry {} of {}", set.retries, origin));
        }
        println!("{}", line);

        let findings = aggregate::inspect(&resolved.tree);
        for task in &findings.failed_tasks {
            println!("    {} {}", console::style("FAIL").red(), task);
        }
        if findings.boot_failed {
            println!("    {}", console::style("kernel install failed").red().bold());
        }
    }

    if !outcome.blacklist.is_empty() {
        println!(
            "  Blacklist:  {}",
            console::style(outcome.blacklist.hosts().join(", ")).yellow()
        );
    }
    println!("  Aborts left: {}", outcome.remaining_budget);
    let duration = outcome.finished_at - outcome.started_at;
    println!("  Duration:   {}s", duration.num_seconds());

    println!();
    let message = match outcome.verdict {
        Verdict::Success => console::style("All tests passed!").green().bold(),
        Verdict::Failure => console::style("Some tests failed.").red().bold(),
        Verdict::BootFailure => console::style("Kernel failed to boot.").red().bold(),
        Verdict::Error if outcome.interrupted => {
            console::style("Run interrupted, jobs cancelled.").red().bold()
        }
        Verdict::Error => console::style("Infrastructure error.").red().bold(),
    };
    println!("{} (exit code {})", message, outcome.verdict.code());
}
