//! Best-effort host network reset
//!
//! Runs route flush, DHCP renew and cache clearing commands in order. A
//! failing command is logged and the batch moves on.

use std::sync::Arc;
use tracing::{info, warn};

use crate::command::{display_command, CommandRunner};
use crate::config::NetworkResetSettings;

pub struct NetworkReset {
    settings: NetworkResetSettings,
    runner: Arc<dyn CommandRunner>,
}

impl NetworkReset {
    pub fn new(settings: NetworkResetSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self { settings, runner }
    }

    /// Run every reset command, returning how many failed.
    pub async fn run(&self) -> usize {
        let mut failed = 0;

        for argv in &self.settings.commands {
            let Some((program, args)) = argv.split_first() else {
                continue;
            };

            if let Err(e) = self.runner.run(program, args).await {
                warn!("Reset networking cmd error: {}: {}", display_command(program, args), e);
                failed += 1;
            }
        }

        info!(
            "Network reset finished ({}/{} commands succeeded)",
            self.settings.commands.len() - failed,
            self.settings.commands.len()
        );
        failed
    }
}
