//! tunsvc - VPN tunnel supervisor service
//!
//! Launches tunnel processes for named connection profiles and tracks them
//! through a small status state machine:
//!
//! ```text
//! connecting ──► connected ◄──► reconnecting
//!      │
//!      └───────► auth_error
//! ```
//!
//! A record disappears from the registry once its tunnel process exits.
//! The crate also counts virtual tunnel adapters and can run a best-effort
//! host network reset.
//!
//! # Usage
//!
//! ```rust,no_run
//! use libtunsvc::{ConnectionManager, ServiceConfig};
//! use std::path::Path;
//!
//! # async fn example() -> libtunsvc::TunsvcResult<()> {
//! let manager = ConnectionManager::new(ServiceConfig::default());
//! let snapshot = manager
//!     .start_profile("work", Path::new("/etc/tunsvc/work.ovpn"), Some("secret"))
//!     .await?;
//! println!("{}: {}", snapshot.id, snapshot.status);
//! manager.stop_profile("work").await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod config;
pub mod command;
pub mod adapter;
pub mod credentials;
pub mod registry;
pub mod supervisor;
pub mod network_reset;
pub mod manager;

// Re-export commonly used types
pub use error::{TunsvcError, TunsvcResult};
pub use config::{ServiceConfig, TunnelSettings, AdapterSettings, NetworkResetSettings};
pub use command::{CommandRunner, SystemCommandRunner};
pub use adapter::{AdapterCounts, AdapterInventory};
pub use registry::{ConnectionRegistry, ConnectionSnapshot, ConnectionStatus};
pub use manager::ConnectionManager;
