use std::sync::Arc;
use std::time::Duration;

use relay_common::{RelayError, Result};
use serde::{Deserialize, Serialize};

use crate::client::LlmClient;
use crate::dial::{DialClient, DEFAULT_API_VERSION};

/// Connection settings for one DIAL deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialConfig {
    pub endpoint: String,
    pub deployment: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Upper bound on total response time. `None` means no client-side limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

impl DialConfig {
    pub fn new(endpoint: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            deployment: deployment.into(),
            api_version: default_api_version(),
            timeout_ms: None,
        }
    }
}

pub fn build_dial_client(config: &DialConfig) -> Result<Arc<dyn LlmClient>> {
    if config.endpoint.trim().is_empty() {
        return Err(RelayError::Config("DIAL endpoint must not be empty".to_string()));
    }
    if config.deployment.trim().is_empty() {
        return Err(RelayError::Config(
            "DIAL deployment name must not be empty".to_string(),
        ));
    }

    let mut builder = reqwest::Client::builder();
    if let Some(ms) = config.timeout_ms {
        builder = builder.timeout(Duration::from_millis(ms));
    }
    let http_client = builder
        .build()
        .map_err(|e| RelayError::Config(format!("Failed to build HTTP client: {e}")))?;

    let client = DialClient::with_http_client(&config.endpoint, &config.deployment, http_client)
        .api_version(&config.api_version);

    Ok(Arc::new(client))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOML_CONFIG: &str = r#"
endpoint = "http://localhost:8080"
deployment = "gpt-4o"
api_version = "2024-02-01"
timeout_ms = 60000
"#;

    #[test]
    fn deserialize_config_from_toml() {
        let config: DialConfig = toml::from_str(TOML_CONFIG).unwrap();
        assert_eq!(config.endpoint, "http://localhost:8080");
        assert_eq!(config.deployment, "gpt-4o");
        assert_eq!(config.api_version, "2024-02-01");
        assert_eq!(config.timeout_ms, Some(60000));
    }

    #[test]
    fn deserialize_config_defaults() {
        let toml_str = r#"
endpoint = "http://localhost:8052"
deployment = "general-purpose-agent"
"#;
        let config: DialConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api_version, DEFAULT_API_VERSION);
        assert!(config.timeout_ms.is_none());
    }

    #[test]
    fn build_client_keeps_deployment() {
        let client = build_dial_client(&DialConfig::new("http://localhost:8080", "gpt-4o")).unwrap();
        assert_eq!(client.deployment(), "gpt-4o");
    }

    #[test]
    fn build_without_endpoint_fails() {
        assert!(build_dial_client(&DialConfig::new("", "gpt-4o")).is_err());
    }

    #[test]
    fn build_without_deployment_fails() {
        assert!(build_dial_client(&DialConfig::new("http://localhost:8080", " ")).is_err());
    }
}
