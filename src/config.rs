//! Configuration management for tunsvc

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{TunsvcError, TunsvcResult};

/// Main service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Tunnel executable settings
    #[serde(default)]
    pub tunnel: TunnelSettings,
    /// Virtual adapter inventory settings
    #[serde(default)]
    pub adapters: AdapterSettings,
    /// Network reset command batch
    #[serde(default)]
    pub network_reset: NetworkResetSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Tunnel executable
    #[serde(default = "default_tunnel_binary")]
    pub binary: PathBuf,
    /// Arguments inserted ahead of the profile arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Upper bound on how long a start request waits for the first status marker
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Username line written into the credential file
    #[serde(default = "default_credential_username")]
    pub credential_username: String,
    /// Extension of the per-profile log file
    #[serde(default = "default_log_extension")]
    pub log_extension: String,
    /// Extension of the transient credential file
    #[serde(default = "default_credential_extension")]
    pub credential_extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSettings {
    /// Interface listing command
    #[serde(default = "default_adapter_command")]
    pub command: String,
    #[serde(default = "default_adapter_args")]
    pub args: Vec<String>,
    /// Substring identifying a virtual tunnel adapter block
    #[serde(default = "default_adapter_marker")]
    pub adapter_marker: String,
    /// Substring marking an adapter block without an active link
    #[serde(default = "default_disconnected_marker")]
    pub disconnected_marker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkResetSettings {
    /// Commands run in order, each as program followed by its arguments
    #[serde(default = "default_reset_commands")]
    pub commands: Vec<Vec<String>>,
}

fn default_tunnel_binary() -> PathBuf {
    PathBuf::from("openvpn")
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_credential_username() -> String {
    "tunsvc_client".to_string()
}

fn default_log_extension() -> String {
    "log".to_string()
}

fn default_credential_extension() -> String {
    "passwd".to_string()
}

fn default_adapter_command() -> String {
    "ipconfig".to_string()
}

fn default_adapter_args() -> Vec<String> {
    vec!["/all".to_string()]
}

fn default_adapter_marker() -> String {
    "TAP-Windows Adapter V9".to_string()
}

fn default_disconnected_marker() -> String {
    "Media disconnected".to_string()
}

fn default_reset_commands() -> Vec<Vec<String>> {
    [
        &["route", "-f"][..],
        &["ipconfig", "/release"],
        &["ipconfig", "/renew"],
        &["arp", "-d", "*"],
        &["nbtstat", "-R"],
        &["nbtstat", "-RR"],
        &["ipconfig", "/flushdns"],
        &["nbtstat", "/registerdns"],
    ]
    .iter()
    .map(|argv| argv.iter().map(|s| s.to_string()).collect())
    .collect()
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            binary: default_tunnel_binary(),
            args: Vec::new(),
            connect_timeout_secs: default_connect_timeout(),
            credential_username: default_credential_username(),
            log_extension: default_log_extension(),
            credential_extension: default_credential_extension(),
        }
    }
}

impl TunnelSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            command: default_adapter_command(),
            args: default_adapter_args(),
            adapter_marker: default_adapter_marker(),
            disconnected_marker: default_disconnected_marker(),
        }
    }
}

impl Default for NetworkResetSettings {
    fn default() -> Self {
        Self {
            commands: default_reset_commands(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> TunsvcResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TunsvcError::ConfigError(format!("Failed to read config {:?}: {}", path.as_ref(), e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| TunsvcError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> TunsvcResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TunsvcError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| TunsvcError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    fn validate(&self) -> TunsvcResult<()> {
        if self.tunnel.binary.as_os_str().is_empty() {
            return Err(TunsvcError::ConfigError("tunnel.binary cannot be empty".to_string()));
        }
        if self.adapters.command.is_empty() {
            return Err(TunsvcError::ConfigError("adapters.command cannot be empty".to_string()));
        }
        for ext in [&self.tunnel.log_extension, &self.tunnel.credential_extension] {
            if ext.is_empty() || ext.contains(['/', '\\']) {
                return Err(TunsvcError::ConfigError(format!("Invalid file extension: {:?}", ext)));
            }
        }
        if self.tunnel.log_extension == self.tunnel.credential_extension {
            return Err(TunsvcError::ConfigError(
                "tunnel.log_extension and tunnel.credential_extension must differ".to_string()
            ));
        }
        if self.network_reset.commands.iter().any(|argv| argv.is_empty()) {
            return Err(TunsvcError::ConfigError("network_reset.commands contains an empty command".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.tunnel.binary, PathBuf::from("openvpn"));
        assert_eq!(config.tunnel.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.adapters.args, vec!["/all".to_string()]);
        assert_eq!(config.network_reset.commands.len(), 8);
        assert_eq!(config.network_reset.commands[3], vec!["arp", "-d", "*"]);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tunsvc.toml");
        std::fs::write(&path, "[tunnel]\nbinary = \"/opt/ovpn/openvpn\"\nconnect_timeout_secs = 5\n").unwrap();

        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.tunnel.binary, PathBuf::from("/opt/ovpn/openvpn"));
        assert_eq!(config.tunnel.connect_timeout_secs, 5);
        assert_eq!(config.tunnel.credential_extension, "passwd");
        assert_eq!(config.adapters.adapter_marker, "TAP-Windows Adapter V9");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tunsvc.toml");

        let mut config = ServiceConfig::default();
        config.tunnel.args = vec!["--verb".to_string(), "3".to_string()];
        config.save(&path).unwrap();

        let loaded = ServiceConfig::load(&path).unwrap();
        assert_eq!(loaded.tunnel.args, config.tunnel.args);
    }

    #[test]
    fn test_rejects_clashing_extensions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tunsvc.toml");
        std::fs::write(&path, "[tunnel]\nlog_extension = \"txt\"\ncredential_extension = \"txt\"\n").unwrap();

        assert!(matches!(ServiceConfig::load(&path), Err(TunsvcError::ConfigError(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(ServiceConfig::load("/nonexistent/tunsvc.toml").is_err());
    }
}
