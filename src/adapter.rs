//! Virtual tunnel adapter inventory
//!
//! Counts the virtual adapters reported by the OS interface listing. The
//! listing is a sequence of blank-line separated blocks, one per adapter.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::command::{display_command, CommandRunner};
use crate::config::AdapterSettings;

/// Adapter usage counts. `used <= available` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterCounts {
    /// Adapters with an active link
    pub used: u32,
    /// Adapters present regardless of link state
    pub available: u32,
}

/// Parse an interface listing into adapter counts.
///
/// A block counts as available when it contains `adapter_marker`, and as used
/// when it does not also contain `disconnected_marker`. A trailing block with
/// no blank line after it is counted too.
pub fn parse_adapter_listing(listing: &str, adapter_marker: &str, disconnected_marker: &str) -> AdapterCounts {
    let mut counts = AdapterCounts::default();
    let mut is_adapter = false;
    let mut is_disconnected = false;

    let mut close_block = |is_adapter: &mut bool, is_disconnected: &mut bool| {
        if *is_adapter {
            counts.available += 1;
            if !*is_disconnected {
                counts.used += 1;
            }
        }
        *is_adapter = false;
        *is_disconnected = false;
    };

    for line in listing.lines() {
        let line = line.trim();
        if line.is_empty() {
            close_block(&mut is_adapter, &mut is_disconnected);
        } else if line.contains(adapter_marker) {
            is_adapter = true;
        } else if line.contains(disconnected_marker) {
            is_disconnected = true;
        }
    }
    close_block(&mut is_adapter, &mut is_disconnected);

    counts
}

/// Lock-guarded adapter counts plus the command used to refresh them
pub struct AdapterInventory {
    counts: Mutex<AdapterCounts>,
    settings: AdapterSettings,
    runner: Arc<dyn CommandRunner>,
}

impl AdapterInventory {
    pub fn new(settings: AdapterSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            counts: Mutex::new(AdapterCounts::default()),
            settings,
            runner,
        }
    }

    /// Re-query the interface listing and recompute the counts.
    ///
    /// Concurrent refreshes are serialized. If the listing command fails the
    /// previous counts are kept and returned.
    pub async fn refresh(&self) -> AdapterCounts {
        let mut counts = self.counts.lock().await;

        match self.runner.run(&self.settings.command, &self.settings.args).await {
            Ok(listing) => {
                *counts = parse_adapter_listing(
                    &listing,
                    &self.settings.adapter_marker,
                    &self.settings.disconnected_marker,
                );
                debug!("Tunnel adapters: {}/{}", counts.used, counts.available);
            }
            Err(e) => {
                warn!(
                    "Failed to get tunnel adapter info from '{}': {}",
                    display_command(&self.settings.command, &self.settings.args),
                    e
                );
            }
        }

        *counts
    }

    /// Counts from the most recent successful refresh
    pub async fn counts(&self) -> AdapterCounts {
        *self.counts.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MockCommandRunner;
    use crate::error::{TunsvcError, TunsvcResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const TAP: &str = "TAP-Windows Adapter V9";
    const DISCONNECTED: &str = "Media disconnected";

    const LISTING: &str = "\
Windows IP Configuration

   Host Name . . . . . . . . . . . . : desk

Ethernet adapter Ethernet:

   Description . . . . . . . . . . . : Intel(R) Ethernet Connection
   Physical Address. . . . . . . . . : 00-11-22-33-44-55

Ethernet adapter Local Area Connection 2:

   Media State . . . . . . . . . . . : Media disconnected
   Description . . . . . . . . . . . : TAP-Windows Adapter V9

Ethernet adapter Local Area Connection 3:

   Description . . . . . . . . . . . : TAP-Windows Adapter V9 #2
   IPv4 Address. . . . . . . . . . . : 10.8.0.6

";

    #[test]
    fn test_parse_counts_used_and_available() {
        let counts = parse_adapter_listing(LISTING, TAP, DISCONNECTED);
        assert_eq!(counts, AdapterCounts { used: 1, available: 2 });
    }

    #[test]
    fn test_parse_trailing_block_without_blank_line() {
        let listing = "Description: TAP-Windows Adapter V9\nIPv4 Address: 10.8.0.2";
        let counts = parse_adapter_listing(listing, TAP, DISCONNECTED);
        assert_eq!(counts, AdapterCounts { used: 1, available: 1 });
    }

    #[test]
    fn test_parse_no_adapters() {
        let counts = parse_adapter_listing("Ethernet adapter Ethernet:\n\n   Media disconnected\n\n", TAP, DISCONNECTED);
        assert_eq!(counts, AdapterCounts::default());
    }

    fn inventory(runner: MockCommandRunner) -> AdapterInventory {
        AdapterInventory::new(AdapterSettings::default(), Arc::new(runner))
    }

    #[tokio::test]
    async fn test_refresh_uses_configured_command() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|program, args| program == "ipconfig" && args.len() == 1 && args[0] == "/all")
            .times(1)
            .returning(|_, _| Ok(LISTING.to_string()));

        let inventory = inventory(runner);
        assert_eq!(inventory.refresh().await, AdapterCounts { used: 1, available: 2 });
        assert_eq!(inventory.counts().await, AdapterCounts { used: 1, available: 2 });
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_previous_counts() {
        let mut runner = MockCommandRunner::new();
        let mut seq = mockall::Sequence::new();
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(LISTING.to_string()));
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Err(TunsvcError::CommandFailed {
                    cmd: "ipconfig /all".to_string(),
                    code: Some(1),
                    stderr: "unavailable".to_string(),
                })
            });

        let inventory = inventory(runner);
        inventory.refresh().await;
        let after_failure = inventory.refresh().await;
        assert_eq!(after_failure, AdapterCounts { used: 1, available: 2 });
    }

    #[tokio::test]
    async fn test_refresh_recomputes_wholesale() {
        let mut runner = MockCommandRunner::new();
        let mut seq = mockall::Sequence::new();
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(LISTING.to_string()));
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(String::new()));

        let inventory = inventory(runner);
        inventory.refresh().await;
        assert_eq!(inventory.refresh().await, AdapterCounts::default());
    }

    /// Runner that takes a while and records how many calls overlap
    #[derive(Default)]
    struct SlowRunner {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CommandRunner for SlowRunner {
        async fn run(&self, _program: &str, _args: &[String]) -> TunsvcResult<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LISTING.to_string())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_refreshes_are_serialized() {
        let runner = Arc::new(SlowRunner::default());
        let inventory = Arc::new(AdapterInventory::new(AdapterSettings::default(), runner.clone()));

        let (a, b) = tokio::join!(
            tokio::spawn({
                let inventory = inventory.clone();
                async move { inventory.refresh().await }
            }),
            tokio::spawn({
                let inventory = inventory.clone();
                async move { inventory.refresh().await }
            }),
        );

        assert_eq!(a.unwrap(), AdapterCounts { used: 1, available: 2 });
        assert_eq!(b.unwrap(), AdapterCounts { used: 1, available: 2 });
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
    }
}
