// The `version` command.

use crate::log_info;
use colored::Colorize;

pub fn run() {
    log_info!("envbox {}", env!("CARGO_PKG_VERSION").bold());
}
