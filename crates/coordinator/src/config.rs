//! Configuration for the coordinator.
//!
//! # Security
//!
//! - Config file permission validation on Unix systems
//! - Rejects world-readable files containing API keys
//! - Warns about API keys stored in config files

use relay_common::Credential;
use relay_llm::{DialConfig, DEFAULT_API_VERSION};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Main coordinator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Routing LLM and the internal credential used to call it
    #[serde(default)]
    pub llm: RoutingLlmConfig,

    /// Users Management Service agent
    #[serde(default)]
    pub ums: UmsConfig,

    /// General-purpose agent
    #[serde(default = "default_gpa")]
    pub gpa: DialConfig,
}

/// Routing LLM settings. Every field has a default, so `[llm]` may set
/// only what differs from the local setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingLlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_llm_deployment")]
    pub deployment: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Fixed internal credential. Always used for the routing call,
    /// regardless of what the caller sends.
    #[serde(default = "default_internal_key")]
    pub api_key: String,
}

impl Default for RoutingLlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            deployment: default_llm_deployment(),
            api_version: default_api_version(),
            api_key: default_internal_key(),
        }
    }
}

impl RoutingLlmConfig {
    pub fn credential(&self) -> Credential {
        Credential::new(self.api_key.clone())
    }

    /// Connection settings for the routing deployment. No client-side
    /// timeout is applied to the routing call.
    pub fn dial(&self) -> DialConfig {
        DialConfig {
            api_version: self.api_version.clone(),
            ..DialConfig::new(&self.endpoint, &self.deployment)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UmsConfig {
    #[serde(default = "default_ums_endpoint")]
    pub endpoint: String,

    /// Timeout for `POST /conversations`
    #[serde(default = "default_create_timeout")]
    pub create_timeout_ms: u64,

    /// Upper bound on the total time of one streamed chat reply
    #[serde(default = "default_chat_timeout")]
    pub chat_timeout_ms: u64,
}

impl Default for UmsConfig {
    fn default() -> Self {
        Self {
            endpoint: default_ums_endpoint(),
            create_timeout_ms: default_create_timeout(),
            chat_timeout_ms: default_chat_timeout(),
        }
    }
}

fn default_llm_endpoint() -> String {
    "http://localhost:8080".into()
}

fn default_llm_deployment() -> String {
    "gpt-4o".into()
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_internal_key() -> String {
    "dial_api_key".into()
}

fn default_ums_endpoint() -> String {
    "http://localhost:8042".into()
}

fn default_create_timeout() -> u64 {
    30_000
}

fn default_chat_timeout() -> u64 {
    300_000
}

fn default_gpa() -> DialConfig {
    DialConfig::new("http://localhost:8052", "general-purpose-agent")
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            llm: RoutingLlmConfig::default(),
            ums: UmsConfig::default(),
            gpa: default_gpa(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file.
    ///
    /// On Unix systems, this function validates that:
    /// - The file is a regular file (not a symlink)
    /// - The file is not world-writable
    /// - The file is not world-readable if it contains an API key
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        #[cfg(unix)]
        validate_config_file_permissions(path)?;

        let config = Self::from_file_unchecked(path)?;

        if config.llm.api_key != default_internal_key() {
            warn!(
                "API key found in config file '{}'. Prefer the DIAL_API_KEY environment variable.",
                path.display()
            );
        }

        Ok(config)
    }

    /// Load configuration from a TOML file without permission checks.
    pub fn from_file_unchecked(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    ///
    /// - `DIAL_ENDPOINT`, `DEPLOYMENT_NAME`, `DIAL_API_KEY` -> routing LLM
    /// - `UMS_AGENT_ENDPOINT` -> UMS agent
    /// - `GPA_AGENT_ENDPOINT` -> general-purpose agent
    pub fn apply_env(self) -> Self {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = lookup("DIAL_ENDPOINT") {
            self.llm.endpoint = v;
        }
        if let Some(v) = lookup("DEPLOYMENT_NAME") {
            self.llm.deployment = v;
        }
        if let Some(v) = lookup("DIAL_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = lookup("UMS_AGENT_ENDPOINT") {
            self.ums.endpoint = v;
        }
        if let Some(v) = lookup("GPA_AGENT_ENDPOINT") {
            self.gpa.endpoint = v;
        }
        self
    }
}

/// Validate config file permissions on Unix systems.
///
/// - File must be a regular file (not symlink, directory, etc.)
/// - File must not be world-writable (mode & 0o002 == 0)
/// - If the file sets an API key, it must not be world-readable
#[cfg(unix)]
fn validate_config_file_permissions(path: &std::path::Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::symlink_metadata(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;

    if !metadata.is_file() {
        anyhow::bail!(
            "Config path '{}' is not a regular file. Symlinks and directories are not allowed.",
            path.display()
        );
    }

    let permission_bits = metadata.permissions().mode() & 0o777;

    if permission_bits & 0o002 != 0 {
        anyhow::bail!(
            "Config file '{}' is world-writable (mode {:04o}). Fix with: chmod o-w {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    let content = std::fs::read_to_string(path).unwrap_or_default();
    let has_api_key = content.lines().any(|l| l.trim_start().starts_with("api_key"));

    if has_api_key && permission_bits & 0o004 != 0 {
        anyhow::bail!(
            "Config file '{}' contains an API key but is world-readable (mode {:04o}). Fix with: chmod 600 {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    if has_api_key && permission_bits & 0o040 != 0 {
        warn!(
            "Config file '{}' contains an API key and is group-readable (mode {:04o}). \
             Consider restricting access with: chmod 600 {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const TOML_CONFIG: &str = r#"
[llm]
endpoint = "http://dial:8080"
deployment = "gpt-4o-mini"

[ums]
endpoint = "http://ums:8042"
chat_timeout_ms = 120000

[gpa]
endpoint = "http://gpa:8052"
deployment = "general-purpose-agent"
"#;

    #[test]
    fn defaults_match_local_setup() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.llm.endpoint, "http://localhost:8080");
        assert_eq!(config.llm.deployment, "gpt-4o");
        assert_eq!(config.llm.api_key, "dial_api_key");
        assert_eq!(config.ums.endpoint, "http://localhost:8042");
        assert_eq!(config.ums.create_timeout_ms, 30_000);
        assert_eq!(config.ums.chat_timeout_ms, 300_000);
        assert_eq!(config.gpa.endpoint, "http://localhost:8052");
        assert_eq!(config.gpa.deployment, "general-purpose-agent");
    }

    #[test]
    fn deserialize_partial_toml() {
        let config: CoordinatorConfig = toml::from_str(TOML_CONFIG).unwrap();
        assert_eq!(config.llm.endpoint, "http://dial:8080");
        assert_eq!(config.llm.deployment, "gpt-4o-mini");
        assert_eq!(config.llm.api_key, "dial_api_key");
        assert_eq!(config.ums.endpoint, "http://ums:8042");
        assert_eq!(config.ums.create_timeout_ms, 30_000);
        assert_eq!(config.ums.chat_timeout_ms, 120_000);
        assert_eq!(config.gpa.endpoint, "http://gpa:8052");
    }

    #[test]
    fn routing_dial_settings() {
        let mut config = RoutingLlmConfig::default();
        config.api_version = "2024-02-01".into();
        let dial = config.dial();
        assert_eq!(dial.endpoint, "http://localhost:8080");
        assert_eq!(dial.deployment, "gpt-4o");
        assert_eq!(dial.api_version, "2024-02-01");
        assert!(dial.timeout_ms.is_none());
    }

    #[test]
    fn empty_toml_is_default() {
        let config: CoordinatorConfig = toml::from_str("").unwrap();
        assert_eq!(config, CoordinatorConfig::default());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DIAL_ENDPOINT", "http://core:8080"),
            ("DIAL_API_KEY", "internal"),
            ("UMS_AGENT_ENDPOINT", "http://ums:9000"),
            ("GPA_AGENT_ENDPOINT", ""),
        ]);
        let config = CoordinatorConfig::default()
            .apply_env_from(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.llm.endpoint, "http://core:8080");
        assert_eq!(config.llm.credential().expose(), "internal");
        assert_eq!(config.ums.endpoint, "http://ums:9000");
        // Blank values do not override
        assert_eq!(config.gpa.endpoint, "http://localhost:8052");
    }

    #[cfg(unix)]
    #[test]
    fn world_readable_file_with_key_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[llm]\napi_key = \"secret\"").unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        assert!(CoordinatorConfig::from_file(file.path()).is_err());

        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600)).unwrap();
        let config = CoordinatorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.llm.api_key, "secret");
        assert_eq!(config.llm.endpoint, "http://localhost:8080");
    }

    #[cfg(unix)]
    #[test]
    fn world_writable_file_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[ums]\nendpoint = \"http://ums\"").unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o666)).unwrap();

        assert!(CoordinatorConfig::from_file(file.path()).is_err());
    }
}
