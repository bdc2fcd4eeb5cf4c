// The `plan` command: computes and prints what an apply would do,
// without executing anything. State is read through the lock-free
// read-only path so a plan can run next to an in-flight apply.

use crate::libs::config_loading::load_resources;
use crate::libs::download::http_agent;
use crate::libs::plan::{Action, Plan, PlanOptions, compute_plan};
use crate::libs::state_management::StateStore;
use crate::libs::utilities::paths::EnvPaths;
use crate::log_info;
use anyhow::Result;
use colored::Colorize;

pub struct PlanArgs {
    pub root: Option<String>,
    pub config_dir: Option<String>,
    pub update_latest: bool,
}

pub fn run(args: PlanArgs) -> Result<()> {
    let paths = EnvPaths::resolve(args.root.as_deref())?;
    let config_dir = crate::libs::utilities::paths::resolve_dir(
        args.config_dir.as_deref(),
        &paths.config_dir,
    );

    let resources = load_resources(&config_dir)?;
    let state = StateStore::load_read_only(&paths.data_dir)?;
    let plan = compute_plan(
        &http_agent(),
        &resources,
        &state,
        &PlanOptions { update_latest: args.update_latest },
    )?;

    print_plan(&plan);
    Ok(())
}

/// Renders the plan: layers first (the execution order), then the action
/// table and the pending removals.
pub fn print_plan(plan: &Plan) {
    log_info!("[Plan] Dependency layers:");
    for (index, layer) in plan.layers.iter().enumerate() {
        let names: Vec<String> = layer.nodes.iter().map(|n| n.to_string()).collect();
        log_info!("[Plan]   {}: {}", index, names.join(", ").cyan());
    }

    let mut changes = 0usize;
    for planned in plan.actions.values() {
        if planned.action == Action::None {
            continue;
        }
        changes += 1;
        log_info!(
            "[Plan] {} {} ({})",
            colored_action(planned.action),
            planned.reference.to_string().bold(),
            planned.reason
        );
    }
    for planned in &plan.removals {
        // Disabled-in-manifest removals already appeared above.
        if plan.actions.contains_key(&planned.reference) {
            continue;
        }
        changes += 1;
        log_info!(
            "[Plan] {} {} ({})",
            colored_action(Action::Remove),
            planned.reference.to_string().bold(),
            planned.reason
        );
    }

    if changes == 0 {
        log_info!("[Plan] Nothing to do; everything matches the manifests.");
    }
}

fn colored_action(action: Action) -> String {
    match action {
        Action::Install => "install".green().to_string(),
        Action::Upgrade => "upgrade".cyan().to_string(),
        Action::Downgrade => "downgrade".magenta().to_string(),
        Action::Reinstall => "reinstall".yellow().to_string(),
        Action::Remove => "remove".red().to_string(),
        Action::None => "none".dimmed().to_string(),
    }
}
