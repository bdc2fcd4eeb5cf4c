// Reconciliation engine.
// Executes a computed plan layer by layer: removals first (tolerating
// individual failures), then every dependency layer in order with up to P
// resources running concurrently. Workers only perform I/O; all state
// mutation happens on the coordinating thread, which applies each
// worker's delta and checkpoints the state file atomically before the
// next result is consumed. The file lock is held for the whole apply and
// released on every exit path.

use crate::installers::{self, InstallContext, StateDelta};
use crate::libs::errors::EnvboxError;
use crate::libs::events::{Event, EventSink, ThrottledProgress};
use crate::libs::install_log::SessionLogger;
use crate::libs::plan::{Action, Plan, PlannedAction};
use crate::libs::state_management::StateStore;
use crate::libs::utilities::paths::EnvPaths;
use crate::libs::utilities::timestamps::current_timestamp;
use crate::schemas::resource::{Kind, Ref, Resource};
use crate::schemas::state_file::{RegistryState, UserState};
use crate::{log_debug, log_error, log_info, log_warn};
use colored::Colorize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;
use threadpool::ThreadPool;

/// Hard bounds on per-layer parallelism.
pub const MIN_PARALLELISM: usize = 1;
pub const MAX_PARALLELISM: usize = 20;

pub struct EngineOptions {
    /// Concurrent resources per layer, clamped to [1, 20].
    pub parallelism: usize,
    /// Registry ref used by package resolution.
    pub registry_ref: String,
    pub registry_base_url: String,
}

impl Default for EngineOptions {
    fn default() -> EngineOptions {
        EngineOptions {
            parallelism: default_parallelism(),
            registry_ref: "main".to_string(),
            registry_base_url: crate::libs::registry_resolver::DEFAULT_REGISTRY_BASE_URL
                .to_string(),
        }
    }
}

/// The default worker count: one per core, capped by the engine bound.
pub fn default_parallelism() -> usize {
    num_cpus::get().clamp(MIN_PARALLELISM, MAX_PARALLELISM)
}

/// Counts of what one apply did, split the way the summary prints them.
#[derive(Debug, Default, Clone)]
pub struct ApplySummary {
    pub installed: usize,
    pub upgraded: usize,
    pub downgraded: usize,
    pub reinstalled: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Removal failures are tolerated and summarized separately.
    pub remove_failures: Vec<(Ref, String)>,
}

pub struct Engine {
    paths: EnvPaths,
    agent: ureq::Agent,
    sink: EventSink,
    options: EngineOptions,
}

enum WorkerOutcome {
    Done(StateDelta),
    Failed(EnvboxError),
    Cancelled,
}

impl Engine {
    pub fn new(paths: EnvPaths, sink: EventSink, options: EngineOptions) -> Engine {
        Engine {
            paths,
            agent: crate::libs::download::http_agent(),
            sink,
            options,
        }
    }

    /// Runs the plan to completion (or to the first failing layer).
    ///
    /// The state lock is held for the duration. The returned summary
    /// tallies successes, failures and skips; a fail-fast error carries
    /// the first failing resource's error after outstanding work drains.
    pub fn apply(&self, resources: &[Resource], plan: &Plan) -> Result<ApplySummary, EnvboxError> {
        let logger = SessionLogger::create(&self.paths.logs_dir)?;
        let sink = ThrottledProgress::wrap(
            EventSink::fanout(vec![self.sink.clone(), logger.sink()]),
            Duration::from_millis(150),
        );
        let cancel = Arc::new(AtomicBool::new(false));

        let mut store = StateStore::new(&self.paths.data_dir);
        store.lock()?;
        let mut state = store.load()?;
        let mut summary = ApplySummary {
            unchanged: plan
                .actions
                .values()
                .filter(|p| p.action == Action::None)
                .count(),
            ..ApplySummary::default()
        };

        // Taints decided by the planner become durable before execution,
        // so a crash mid-apply still reinstalls the tainted tools next run.
        self.persist_taints(&store, &mut state, plan)?;

        // Phase one: removals, continue-on-error.
        self.run_removals(&store, &mut state, plan, &sink, &logger, &cancel, &mut summary)?;

        // Phase two: layered execution of installs/upgrades/reinstalls.
        let resource_index: BTreeMap<Ref, &Resource> =
            resources.iter().map(|r| (r.reference(), r)).collect();
        let result = self.run_layers(
            &store,
            &mut state,
            plan,
            &resource_index,
            &sink,
            &cancel,
            &mut summary,
        );

        // Registry bookkeeping: record the ref consulted by this apply
        // when any resource goes through the package registry.
        if result.is_ok() && uses_registry(resources) {
            state.registry = Some(RegistryState {
                reference: self.options.registry_ref.clone(),
                updated_at: current_timestamp(),
            });
            store.save(&state)?;
        }

        store.unlock();
        log_info!(
            "[Engine] Apply finished: {} installed, {} upgraded, {} reinstalled, {} removed, {} failed ({} unchanged); logs in {}",
            summary.installed,
            summary.upgraded,
            summary.reinstalled,
            summary.removed,
            summary.failed,
            summary.unchanged,
            logger.session_dir().display().to_string().dimmed()
        );
        result.map(|_| summary)
    }

    /// Writes planner-computed taints into state before execution.
    fn persist_taints(
        &self,
        store: &StateStore,
        state: &mut UserState,
        plan: &Plan,
    ) -> Result<(), EnvboxError> {
        let mut dirty = false;
        for planned in plan.actions.values() {
            let Some(taint) = &planned.taint_reason else {
                continue;
            };
            if planned.reference.kind == Kind::Tool {
                if let Some(entry) = state.tools.get_mut(&planned.reference.name) {
                    if entry.taint_reason.as_deref() != Some(taint) {
                        entry.taint_reason = Some(taint.clone());
                        dirty = true;
                    }
                }
            }
        }
        if dirty {
            store.save(state)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_removals(
        &self,
        store: &StateStore,
        state: &mut UserState,
        plan: &Plan,
        sink: &EventSink,
        logger: &Arc<SessionLogger>,
        cancel: &Arc<AtomicBool>,
        summary: &mut ApplySummary,
    ) -> Result<(), EnvboxError> {
        if plan.removals.is_empty() {
            return Ok(());
        }
        let ctx = self.context(Arc::new(state.clone()), sink, cancel);
        for planned in &plan.removals {
            let reference = &planned.reference;
            sink.emit(&Event::Start {
                kind: reference.kind,
                name: reference.name.clone(),
                version: String::new(),
                action: Action::Remove,
                method: "remove".to_string(),
            });
            match installers::execute_remove(&ctx, reference, state) {
                Ok(_) => {
                    state.remove(reference);
                    store.save(state)?;
                    summary.removed += 1;
                    sink.emit(&Event::Complete {
                        kind: reference.kind,
                        name: reference.name.clone(),
                        version: String::new(),
                        action: Action::Remove,
                    });
                }
                Err(err) => {
                    // Removes tolerate individual failures.
                    log_warn!("[Engine] Removal of {} failed: {}", reference.to_string().red(), err);
                    logger.note(reference.kind, &reference.name, Action::Remove, &err.to_string());
                    sink.emit(&Event::Error {
                        kind: reference.kind,
                        name: reference.name.clone(),
                        message: err.to_string(),
                    });
                    summary.remove_failures.push((reference.clone(), err.to_string()));
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_layers(
        &self,
        store: &StateStore,
        state: &mut UserState,
        plan: &Plan,
        resource_index: &BTreeMap<Ref, &Resource>,
        sink: &EventSink,
        cancel: &Arc<AtomicBool>,
        summary: &mut ApplySummary,
    ) -> Result<(), EnvboxError> {
        let parallelism = self
            .options
            .parallelism
            .clamp(MIN_PARALLELISM, MAX_PARALLELISM);

        for (index, layer) in plan.layers.iter().enumerate() {
            let jobs: Vec<(&Resource, &PlannedAction)> = layer
                .nodes
                .iter()
                .filter_map(|reference| {
                    let planned = plan.actions.get(reference)?;
                    if !matches!(
                        planned.action,
                        Action::Install | Action::Upgrade | Action::Downgrade | Action::Reinstall
                    ) {
                        return None;
                    }
                    Some((*resource_index.get(reference)?, planned))
                })
                .collect();
            if jobs.is_empty() {
                continue;
            }
            log_debug!(
                "[Engine] Layer {} runs {} resource(s) with parallelism {}",
                index,
                jobs.len(),
                parallelism.min(jobs.len())
            );

            // Workers see the state as of the start of this layer; the
            // barrier below makes every mutation durable before the next
            // layer observes it.
            let snapshot = Arc::new(state.clone());
            let pool = ThreadPool::new(parallelism.min(jobs.len()));
            let (tx, rx) = mpsc::channel::<(Ref, Action, String, WorkerOutcome)>();

            for (resource, planned) in &jobs {
                let ctx = self.context(Arc::clone(&snapshot), sink, cancel);
                let resource = (*resource).clone();
                let planned = (*planned).clone();
                let tx = tx.clone();
                let cancel = Arc::clone(cancel);
                pool.execute(move || {
                    let reference = resource.reference();
                    let version = planned
                        .resolved_version
                        .clone()
                        .unwrap_or_else(|| spec_version_display(&resource));
                    if cancel.load(Ordering::Relaxed) {
                        let _ = tx.send((reference, planned.action, version, WorkerOutcome::Cancelled));
                        return;
                    }
                    ctx.sink.emit(&Event::Start {
                        kind: reference.kind,
                        name: reference.name.clone(),
                        version: version.clone(),
                        action: planned.action,
                        method: method_of(&resource),
                    });
                    let outcome = match installers::execute(&ctx, &resource, &planned) {
                        Ok(delta) => WorkerOutcome::Done(delta),
                        Err(_) if cancel.load(Ordering::Relaxed) => WorkerOutcome::Cancelled,
                        Err(err) => WorkerOutcome::Failed(err),
                    };
                    let _ = tx.send((reference, planned.action, version, outcome));
                });
            }
            drop(tx);

            // Collect every result of this layer; the first failure trips
            // fail-fast, cancelling outstanding work cooperatively.
            let mut first_error: Option<EnvboxError> = None;
            for (reference, action, version, outcome) in rx {
                match outcome {
                    WorkerOutcome::Done(delta) => {
                        apply_delta(state, delta);
                        // Checkpoint: completed work survives a crash.
                        store.save(state)?;
                        count_action(summary, action);
                        sink.emit(&Event::Complete {
                            kind: reference.kind,
                            name: reference.name.clone(),
                            version,
                            action,
                        });
                    }
                    WorkerOutcome::Failed(err) => {
                        summary.failed += 1;
                        sink.emit(&Event::Error {
                            kind: reference.kind,
                            name: reference.name.clone(),
                            message: err.to_string(),
                        });
                        log_error!("[Engine] {} failed: {}", reference.to_string().red(), err);
                        if first_error.is_none() {
                            first_error = Some(err);
                            cancel.store(true, Ordering::Relaxed);
                        }
                    }
                    WorkerOutcome::Cancelled => {
                        summary.cancelled += 1;
                        log_debug!("[Engine] {} cancelled", reference.to_string().dimmed());
                    }
                }
            }
            pool.join();

            if let Some(err) = first_error {
                // Layers after the failing one never run.
                return Err(err);
            }
        }
        Ok(())
    }

    fn context(
        &self,
        snapshot: Arc<UserState>,
        sink: &EventSink,
        cancel: &Arc<AtomicBool>,
    ) -> InstallContext {
        InstallContext {
            paths: self.paths.clone(),
            agent: self.agent.clone(),
            sink: sink.clone(),
            cancel: Arc::clone(cancel),
            state: snapshot,
            registry_ref: self.options.registry_ref.clone(),
            registry_base_url: self.options.registry_base_url.clone(),
        }
    }
}

fn apply_delta(state: &mut UserState, delta: StateDelta) {
    match delta {
        StateDelta::Runtime { name, state: entry } => {
            state.runtimes.insert(name, entry);
        }
        StateDelta::Tool { name, state: entry } => {
            state.tools.insert(name, entry);
        }
        StateDelta::Installer { name, state: entry } => {
            state.installers.insert(name, entry);
        }
        StateDelta::Repository { name, state: entry } => {
            state.repositories.insert(name, entry);
        }
        StateDelta::Removed { reference } => {
            state.remove(&reference);
        }
    }
}

fn count_action(summary: &mut ApplySummary, action: Action) {
    match action {
        Action::Install => summary.installed += 1,
        Action::Upgrade => summary.upgraded += 1,
        Action::Downgrade => summary.downgraded += 1,
        Action::Reinstall => summary.reinstalled += 1,
        Action::Remove => summary.removed += 1,
        Action::None => summary.unchanged += 1,
    }
}

fn spec_version_display(resource: &Resource) -> String {
    match resource {
        Resource::Runtime { spec, .. } => spec.version.clone(),
        Resource::Tool { spec, .. } => spec.version.clone(),
        Resource::Installer { spec, .. } => spec.version.clone(),
        Resource::InstallerRepository { .. } | Resource::ToolSet { .. } => String::new(),
    }
}

/// The Start event's method field: how this resource gets installed.
fn method_of(resource: &Resource) -> String {
    match resource {
        Resource::Runtime { spec, .. } => spec.install_type.to_string(),
        Resource::Installer { spec, .. } => spec.install_type.to_string(),
        Resource::Tool { spec, .. } => match (&spec.runtime_ref, &spec.installer_ref) {
            (Some(runtime), _) => format!("runtime/{runtime}"),
            (_, Some(installer)) => format!("installer/{installer}"),
            _ => "unknown".to_string(),
        },
        Resource::InstallerRepository { spec, .. } => spec.source.source_type.to_string(),
        Resource::ToolSet { .. } => "tool_set".to_string(),
    }
}

fn uses_registry(resources: &[Resource]) -> bool {
    resources.iter().any(|resource| {
        matches!(
            resource,
            Resource::Tool { spec, .. }
                if spec.runtime_ref.is_none() && spec.source.is_none() && spec.package.is_some()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::download::http_agent;
    use crate::libs::plan::{PlanOptions, compute_plan};
    use crate::libs::utilities::checksum::sha256_bytes;
    use crate::schemas::resource::{InstallType, RuntimeSpec, SourceSpec, ToolCommands, ToolSpec};
    use crate::schemas::state_file::{RuntimeState, ToolState, VersionKind};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs;
    use std::path::Path;

    /// A gzipped tarball with executable entries, as a release would ship.
    fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        {
            let mut builder = tar::Builder::new(&mut encoder);
            for (name, data) in entries {
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o755);
                header.set_cksum();
                builder.append_data(&mut header, name, *data).unwrap();
            }
            builder.finish().unwrap();
        }
        encoder.finish().unwrap()
    }

    fn engine_for(root: &Path) -> Engine {
        Engine::new(
            crate::libs::utilities::paths::EnvPaths::for_root(root.to_path_buf()),
            EventSink::null(),
            EngineOptions { parallelism: 2, ..EngineOptions::default() },
        )
    }

    fn go_runtime(server_url: &str, version: &str, bin_dir: &Path, checksum: Option<String>) -> Resource {
        Resource::Runtime {
            api_version: "envbox/v1".into(),
            name: "go".into(),
            spec: RuntimeSpec {
                install_type: InstallType::Download,
                version: version.into(),
                source: Some(SourceSpec {
                    url: format!("{server_url}/go{{{{.Version}}}}.linux-amd64.tar.gz"),
                    checksum,
                    archive_type: Some("tar.gz".into()),
                }),
                bootstrap: None,
                binaries: vec![],
                bin_dir: None,
                tool_bin_path: bin_dir.to_string_lossy().into_owned(),
                commands: Some(ToolCommands {
                    install: "echo installing {{.Package}} {{.Version}} into {{.ToolBinPath}}"
                        .into(),
                    check: None,
                    remove: None,
                }),
                env: std::collections::BTreeMap::new(),
                taint_on_upgrade: true,
                resolve_version: vec![],
            },
        }
    }

    #[test]
    fn installs_a_download_runtime_end_to_end() {
        let mut server = mockito::Server::new();
        let archive = tar_gz(&[
            ("go/bin/go", b"#!/bin/sh\necho go\n"),
            ("go/bin/gofmt", b"#!/bin/sh\necho gofmt\n"),
        ]);
        let digest = sha256_bytes(&archive);
        server
            .mock("GET", "/go1.25.1.linux-amd64.tar.gz")
            .with_status(200)
            .with_body(archive.clone())
            .create();

        let root = tempfile::tempdir().unwrap();
        let bin_dir = root.path().join("bin");
        let resources = vec![go_runtime(
            &server.url(),
            "1.25.1",
            &bin_dir,
            Some(format!("sha256:{digest}")),
        )];

        let plan = compute_plan(
            &http_agent(),
            &resources,
            &UserState::default(),
            &PlanOptions { update_latest: false },
        )
        .unwrap();
        assert_eq!(plan.action_for(&Ref::new(Kind::Runtime, "go")), Action::Install);

        let summary = engine_for(root.path()).apply(&resources, &plan).unwrap();
        assert_eq!(summary.installed, 1);
        assert_eq!(summary.failed, 0);

        // State records the concrete version and the archive digest.
        let state = StateStore::load_read_only(&root.path().join("data")).unwrap();
        let go = &state.runtimes["go"];
        assert_eq!(go.version, "1.25.1");
        assert_eq!(go.digest.as_deref(), Some(digest.as_str()));
        assert_eq!(go.binaries, vec!["go".to_string(), "gofmt".to_string()]);

        // Symlinks point inside runtimes/go/1.25.1/bin/.
        let expected_dir = root.path().join("data/runtimes/go/1.25.1/bin");
        for binary in ["go", "gofmt"] {
            let target = fs::read_link(bin_dir.join(binary)).unwrap();
            assert_eq!(target, expected_dir.join(binary));
        }
    }

    #[test]
    fn checksum_mismatch_fails_without_state_mutation() {
        let mut server = mockito::Server::new();
        let archive = tar_gz(&[("go/bin/go", b"#!/bin/sh\necho go\n")]);
        server
            .mock("GET", "/go1.25.1.linux-amd64.tar.gz")
            .with_status(200)
            .with_body(archive)
            .create();

        let root = tempfile::tempdir().unwrap();
        let bin_dir = root.path().join("bin");
        let wrong = "0".repeat(64);
        let resources = vec![go_runtime(
            &server.url(),
            "1.25.1",
            &bin_dir,
            Some(format!("sha256:{wrong}")),
        )];

        let plan = compute_plan(
            &http_agent(),
            &resources,
            &UserState::default(),
            &PlanOptions { update_latest: false },
        )
        .unwrap();
        let err = engine_for(root.path()).apply(&resources, &plan).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));

        let state = StateStore::load_read_only(&root.path().join("data")).unwrap();
        assert!(state.runtimes.is_empty());
        assert!(!bin_dir.join("go").exists());
    }

    #[test]
    fn upgrade_taints_and_reinstalls_dependent_tools() {
        let mut server = mockito::Server::new();
        let archive = tar_gz(&[("go/bin/go", b"#!/bin/sh\necho go\n")]);
        server
            .mock("GET", "/go1.25.1.linux-amd64.tar.gz")
            .with_status(200)
            .with_body(archive)
            .create();

        let root = tempfile::tempdir().unwrap();
        let bin_dir = root.path().join("bin");

        // Pre-existing state: go 1.25.0 with artifacts on disk, gopls
        // installed through it.
        let old_install = root.path().join("data/runtimes/go/1.25.0");
        fs::create_dir_all(old_install.join("bin")).unwrap();
        fs::write(old_install.join("bin/go"), b"old").unwrap();
        let mut state = UserState::default();
        state.runtimes.insert(
            "go".into(),
            RuntimeState {
                install_type: InstallType::Download,
                version: "1.25.0".into(),
                version_kind: VersionKind::Exact,
                spec_version: "1.25.0".into(),
                digest: None,
                install_path: Some(old_install.to_string_lossy().into_owned()),
                binaries: vec!["go".into()],
                bin_dir: bin_dir.to_string_lossy().into_owned(),
                tool_bin_path: bin_dir.to_string_lossy().into_owned(),
                commands: None,
                env: std::collections::BTreeMap::new(),
                remove_command: None,
                taint_on_upgrade: true,
                taint_reason: None,
                updated_at: "2025-01-01T00:00:00+00:00".into(),
            },
        );
        state.tools.insert(
            "gopls".into(),
            ToolState {
                version: "0.16.0".into(),
                version_kind: VersionKind::Exact,
                spec_version: "0.16.0".into(),
                digest: None,
                install_path: None,
                binaries: vec![],
                runtime_ref: Some("go".into()),
                installer_ref: None,
                package: Some("golang.org/x/tools/gopls".into()),
                source_url: None,
                remove_command: None,
                taint_reason: None,
                updated_at: "2025-01-01T00:00:00+00:00".into(),
            },
        );
        fs::create_dir_all(root.path().join("data")).unwrap();
        crate::libs::utilities::file_operations::atomic_write(
            &root.path().join("data/state.json"),
            serde_json::to_string_pretty(&state).unwrap().as_bytes(),
        )
        .unwrap();

        let resources = vec![
            go_runtime(&server.url(), "1.25.1", &bin_dir, None),
            Resource::Tool {
                api_version: "envbox/v1".into(),
                name: "gopls".into(),
                spec: ToolSpec {
                    version: "0.16.0".into(),
                    installer_ref: None,
                    runtime_ref: Some("go".into()),
                    package: Some("golang.org/x/tools/gopls".into()),
                    source: None,
                    enabled: None,
                    commands: None,
                },
            },
        ];

        let plan = compute_plan(
            &http_agent(),
            &resources,
            &state,
            &PlanOptions { update_latest: false },
        )
        .unwrap();
        assert_eq!(plan.action_for(&Ref::new(Kind::Runtime, "go")), Action::Upgrade);
        assert_eq!(plan.action_for(&Ref::new(Kind::Tool, "gopls")), Action::Reinstall);

        let summary = engine_for(root.path()).apply(&resources, &plan).unwrap();
        assert_eq!(summary.upgraded, 1);
        assert_eq!(summary.reinstalled, 1);

        let state = StateStore::load_read_only(&root.path().join("data")).unwrap();
        assert_eq!(state.runtimes["go"].version, "1.25.1");
        // The taint cleared with the successful reinstall.
        assert!(state.tools["gopls"].taint_reason.is_none());
        // Old artifacts were swapped out only after the new version landed.
        assert!(!old_install.exists());
        assert!(root.path().join("data/runtimes/go/1.25.1").exists());
    }

    #[test]
    fn vanished_manifest_entry_is_removed() {
        let root = tempfile::tempdir().unwrap();
        let bin_dir = root.path().join("bin");
        fs::create_dir_all(&bin_dir).unwrap();

        // jq is installed on disk and recorded in state, but the manifest
        // set is empty.
        let install_path = root.path().join("data/tools/jq/1.7");
        fs::create_dir_all(&install_path).unwrap();
        fs::write(install_path.join("jq"), b"#!/bin/sh\necho jq\n").unwrap();
        std::os::unix::fs::symlink(install_path.join("jq"), bin_dir.join("jq")).unwrap();

        let mut state = UserState::default();
        state.tools.insert(
            "jq".into(),
            ToolState {
                version: "1.7".into(),
                version_kind: VersionKind::Exact,
                spec_version: "1.7".into(),
                digest: None,
                install_path: Some(install_path.to_string_lossy().into_owned()),
                binaries: vec!["jq".into()],
                runtime_ref: None,
                installer_ref: Some("download".into()),
                package: None,
                source_url: None,
                remove_command: None,
                taint_reason: None,
                updated_at: "2025-01-01T00:00:00+00:00".into(),
            },
        );
        crate::libs::utilities::file_operations::atomic_write(
            &root.path().join("data/state.json"),
            serde_json::to_string_pretty(&state).unwrap().as_bytes(),
        )
        .unwrap();

        let plan = compute_plan(
            &http_agent(),
            &[],
            &state,
            &PlanOptions { update_latest: false },
        )
        .unwrap();
        assert_eq!(plan.removals.len(), 1);

        let engine = Engine::new(
            crate::libs::utilities::paths::EnvPaths::for_root(root.path().to_path_buf()),
            EventSink::null(),
            EngineOptions::default(),
        );
        let summary = engine.apply(&[], &plan).unwrap();
        assert_eq!(summary.removed, 1);
        assert!(summary.remove_failures.is_empty());

        assert!(!bin_dir.join("jq").exists());
        assert!(!install_path.exists());
        let state = StateStore::load_read_only(&root.path().join("data")).unwrap();
        assert!(state.tools.is_empty());
    }

    #[test]
    fn fail_fast_stops_after_the_failing_layer() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/go1.25.1.linux-amd64.tar.gz")
            .with_status(404)
            .create();

        let root = tempfile::tempdir().unwrap();
        let bin_dir = root.path().join("bin");
        let resources = vec![
            go_runtime(&server.url(), "1.25.1", &bin_dir, None),
            // gopls depends on go, so it sits in the next layer and must
            // never run once go fails.
            Resource::Tool {
                api_version: "envbox/v1".into(),
                name: "gopls".into(),
                spec: ToolSpec {
                    version: "0.16.0".into(),
                    installer_ref: None,
                    runtime_ref: Some("go".into()),
                    package: Some("golang.org/x/tools/gopls".into()),
                    source: None,
                    enabled: None,
                    commands: None,
                },
            },
        ];

        let plan = compute_plan(
            &http_agent(),
            &resources,
            &UserState::default(),
            &PlanOptions { update_latest: false },
        )
        .unwrap();
        let err = engine_for(root.path()).apply(&resources, &plan).unwrap_err();
        assert!(err.to_string().contains("404"));

        let state = StateStore::load_read_only(&root.path().join("data")).unwrap();
        assert!(state.runtimes.is_empty());
        assert!(state.tools.is_empty());
    }
}
