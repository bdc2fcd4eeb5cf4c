// The `apply` command: the end-to-end reconciliation run.
// Loads the manifests, computes the plan, prints it, and (unless
// `--dry-run`) hands it to the engine. Engine events are rendered to the
// terminal here; the engine separately mirrors them into the session log.

use crate::libs::config_loading::load_resources;
use crate::libs::download::http_agent;
use crate::libs::engine::{Engine, EngineOptions, default_parallelism};
use crate::libs::events::{Event, EventSink};
use crate::libs::plan::{PlanOptions, compute_plan};
use crate::libs::state_management::StateStore;
use crate::libs::utilities::paths::EnvPaths;
use crate::{log_error, log_info, log_warn};
use anyhow::Result;
use colored::Colorize;

pub struct ApplyArgs {
    pub root: Option<String>,
    pub config_dir: Option<String>,
    pub parallel: Option<usize>,
    pub update_latest: bool,
    pub dry_run: bool,
    pub registry_ref: Option<String>,
    pub registry_url: Option<String>,
}

pub fn run(args: ApplyArgs) -> Result<()> {
    let paths = EnvPaths::resolve(args.root.as_deref())?;
    let config_dir = crate::libs::utilities::paths::resolve_dir(
        args.config_dir.as_deref(),
        &paths.config_dir,
    );

    if args.update_latest {
        log_info!(
            "[Apply] {} is set; latest/alias versions will be re-resolved",
            "--update-latest".bright_yellow()
        );
    }

    let resources = load_resources(&config_dir)?;
    log_info!(
        "[Apply] Loaded {} resource(s) from {}",
        resources.len(),
        config_dir.display().to_string().cyan()
    );

    // The plan is computed against a lock-free read of state; the engine
    // re-reads under its lock before executing.
    let state = StateStore::load_read_only(&paths.data_dir)?;
    let plan = compute_plan(
        &http_agent(),
        &resources,
        &state,
        &PlanOptions { update_latest: args.update_latest },
    )?;
    super::plan::print_plan(&plan);

    if args.dry_run {
        log_info!("[Apply] Dry run requested; stopping before execution.");
        return Ok(());
    }
    if plan.is_noop() {
        return Ok(());
    }

    let defaults = EngineOptions::default();
    let options = EngineOptions {
        parallelism: args.parallel.unwrap_or_else(default_parallelism),
        registry_ref: args.registry_ref.unwrap_or(defaults.registry_ref),
        registry_base_url: args.registry_url.unwrap_or(defaults.registry_base_url),
    };

    let engine = Engine::new(paths, terminal_sink(), options);
    let summary = engine.apply(&resources, &plan)?;

    for (reference, message) in &summary.remove_failures {
        log_warn!(
            "[Apply] Removal of {} failed and was skipped: {}",
            reference.to_string().yellow(),
            message
        );
    }
    log_info!("[Apply] 'envbox apply' completed!");
    Ok(())
}

/// Renders engine events as log lines. Download progress arrives
/// pre-throttled by the engine.
fn terminal_sink() -> EventSink {
    EventSink::new(|event| match event {
        Event::Start { kind, name, version, action, method } => {
            log_info!(
                "[Apply] {} {}/{} {} ({})",
                action.to_string().cyan(),
                kind,
                name.bold(),
                version.yellow(),
                method
            );
        }
        Event::Output { kind, name, line } => {
            log_info!("[Apply] {}/{}: {}", kind, name, line.dimmed());
        }
        Event::DownloadProgress { kind, name, downloaded, total } => {
            match total {
                Some(total) => log_info!(
                    "[Apply] {}/{}: downloaded {} / {} bytes",
                    kind,
                    name,
                    downloaded,
                    total
                ),
                None => log_info!("[Apply] {}/{}: downloaded {} bytes", kind, name, downloaded),
            };
        }
        Event::Error { kind, name, message } => {
            log_error!("[Apply] {}/{} failed: {}", kind, name.red(), message);
        }
        Event::Complete { kind, name, version, action } => {
            log_info!(
                "[Apply] {} {}/{} {} {}",
                action.to_string().cyan(),
                kind,
                name.bold(),
                version.yellow(),
                "done".green()
            );
        }
    })
}
