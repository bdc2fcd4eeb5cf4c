// Typed schemas for everything envbox reads and writes:
// manifests (resources), the persisted state file, and registry metadata.

pub mod registry;
pub mod resource;
pub mod state_file;
