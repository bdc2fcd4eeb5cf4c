// Subcommand implementations: apply, plan, verify, version.

pub mod apply;
pub mod plan;
pub mod verify;
pub mod version;
