// Entry point of envbox.
// Parses command-line arguments and dispatches to the subcommand logic.

mod commands; // Subcommand implementations (apply, plan, verify, version).
mod installers; // Per-resource install/remove logic.
mod libs; // Core subsystems: graph, engine, state store, pipeline.
mod logger; // Log macros and the debug gate.
mod schemas; // Manifest, state and registry schemas.

use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::commands::{apply, plan, verify, version};

/// Declarative developer environment reconciliation.
#[derive(Parser)]
#[command(name = "envbox")]
#[command(version, about)]
struct Cli {
    /// Enables detailed debug output.
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconciles the machine against the manifests.
    Apply {
        /// Root directory (defaults to ~/.envbox).
        #[arg(long, env = "ENVBOX_ROOT")]
        root: Option<String>,
        /// Manifest directory (defaults to <root>/configs).
        #[arg(long)]
        config_dir: Option<String>,
        /// Concurrent resources per layer (1-20).
        #[arg(long)]
        parallel: Option<usize>,
        /// Re-resolve tools and runtimes pinned to latest/alias versions.
        #[arg(long)]
        update_latest: bool,
        /// Print the plan and stop before executing.
        #[arg(long)]
        dry_run: bool,
        /// Package registry ref consulted for tool downloads.
        #[arg(long, env = "ENVBOX_REGISTRY_REF")]
        registry_ref: Option<String>,
        /// Package registry base URL.
        #[arg(long, env = "ENVBOX_REGISTRY_URL")]
        registry_url: Option<String>,
    },
    /// Computes and prints what an apply would do.
    Plan {
        #[arg(long, env = "ENVBOX_ROOT")]
        root: Option<String>,
        #[arg(long)]
        config_dir: Option<String>,
        #[arg(long)]
        update_latest: bool,
    },
    /// Verifies cosign signatures of module schema artifacts.
    Verify {
        /// Module references, as path@version.
        #[arg(required = true)]
        modules: Vec<String>,
        /// First-party module prefix; only matching modules are verified.
        #[arg(long)]
        prefix: Option<String>,
        /// Regex the signing certificate SAN must match.
        #[arg(long)]
        san_pattern: Option<String>,
    },
    /// Shows the current version.
    Version,
}

fn main() {
    let cli = Cli::parse();
    logger::init(cli.debug);
    log_debug!("[Envbox] Command line arguments parsed; debug={}", cli.debug);

    let outcome = match cli.command {
        Commands::Apply {
            root,
            config_dir,
            parallel,
            update_latest,
            dry_run,
            registry_ref,
            registry_url,
        } => apply::run(apply::ApplyArgs {
            root,
            config_dir,
            parallel,
            update_latest,
            dry_run,
            registry_ref,
            registry_url,
        }),
        Commands::Plan { root, config_dir, update_latest } => {
            plan::run(plan::PlanArgs { root, config_dir, update_latest })
        }
        Commands::Verify { modules, prefix, san_pattern } => {
            verify::run(verify::VerifyArgs { modules, prefix, san_pattern })
        }
        Commands::Version => {
            version::run();
            Ok(())
        }
    };

    if let Err(err) = outcome {
        log_error!("{}", err.to_string().red());
        std::process::exit(1);
    }
    log_debug!("[Envbox] Command execution completed.");
}
