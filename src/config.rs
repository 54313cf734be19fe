//! Serving Configuration
//!
//! Settings shared by the request parser and the engine: which headers
//! mark a continuation, where continuations are delivered, and whether
//! inbound signatures are checked.
//!
//! # Example YAML Format
//!
//! ```yaml
//! url: https://app.example.com/api/workflow
//! internal_header: Workflow-Internal
//! workflow_id_header: Workflow-Id
//! signature_header: Workflow-Signature
//! verify_signatures: true
//! ```

use std::env;
use std::fs;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};

/// Header marking a request as a workflow continuation.
pub const DEFAULT_INTERNAL_HEADER: &str = "Workflow-Internal";

/// Header carrying the workflow id on continuations.
pub const DEFAULT_WORKFLOW_ID_HEADER: &str = "Workflow-Id";

/// Header carrying the queue's request signature.
pub const DEFAULT_SIGNATURE_HEADER: &str = "Workflow-Signature";

/// Value of the continuation marker header.
pub const CONTINUATION_MARKER: &str = "yes";

/// Environment variable overriding [`ServeConfig::url`].
pub const ENV_URL: &str = "STEPLEDGER_URL";

/// Environment variable overriding [`ServeConfig::verify_signatures`].
pub const ENV_VERIFY_SIGNATURES: &str = "STEPLEDGER_VERIFY_SIGNATURES";

/// Configuration for serving a workflow endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServeConfig {
    /// Endpoint continuations are delivered to. Defaults to the request url.
    pub url: Option<String>,

    /// Name of the continuation marker header
    pub internal_header: String,

    /// Name of the workflow id header
    pub workflow_id_header: String,

    /// Name of the signature header
    pub signature_header: String,

    /// Reject requests whose signature does not verify
    pub verify_signatures: bool,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            url: None,
            internal_header: DEFAULT_INTERNAL_HEADER.to_string(),
            workflow_id_header: DEFAULT_WORKFLOW_ID_HEADER.to_string(),
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            verify_signatures: true,
        }
    }
}

impl ServeConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        info!("Loading serve configuration from: {}", path);

        let content = fs::read_to_string(path).map_err(|e| {
            WorkflowError::Config(format!("failed to read config file '{}': {}", path, e))
        })?;

        let config: ServeConfig = serde_yaml::from_str(&content)
            .map_err(|e| WorkflowError::Config(format!("failed to parse config YAML: {}", e)))?;

        let config = config.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the continuation endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Enables or disables signature verification.
    pub fn with_signature_verification(mut self, verify: bool) -> Self {
        self.verify_signatures = verify;
        self
    }

    /// Applies `STEPLEDGER_*` environment variables.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(url) = env::var(ENV_URL) {
            debug!("Continuation url overridden by {}", ENV_URL);
            self.url = Some(url);
        }

        if let Ok(raw) = env::var(ENV_VERIFY_SIGNATURES) {
            self.verify_signatures = parse_bool(&raw).ok_or_else(|| {
                WorkflowError::Config(format!(
                    "{} must be true or false, got '{}'",
                    ENV_VERIFY_SIGNATURES, raw
                ))
            })?;
        }

        Ok(self)
    }

    /// Checks that header names and the url are usable.
    pub fn validate(&self) -> Result<()> {
        let headers = [
            ("internal_header", &self.internal_header),
            ("workflow_id_header", &self.workflow_id_header),
            ("signature_header", &self.signature_header),
        ];

        for (field, value) in headers {
            if value.trim().is_empty() {
                return Err(WorkflowError::Config(format!("{} must not be empty", field)));
            }
        }

        if let Some(url) = &self.url {
            if url.trim().is_empty() {
                return Err(WorkflowError::Config("url must not be empty when set".to_string()));
            }
        }

        Ok(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ServeConfig::default();
        assert_eq!(config.internal_header, "Workflow-Internal");
        assert_eq!(config.workflow_id_header, "Workflow-Id");
        assert!(config.verify_signatures);
        assert!(config.url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = ServeConfig::default()
            .with_url("https://app.example.com/wf")
            .with_signature_verification(false);

        assert_eq!(config.url.as_deref(), Some("https://app.example.com/wf"));
        assert!(!config.verify_signatures);
    }

    #[test]
    fn test_load_partial_yaml_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("serve.yaml");
        std::fs::write(&path, "workflow_id_header: X-Run-Id\n").unwrap();

        let config = ServeConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.workflow_id_header, "X-Run-Id");
        assert_eq!(config.internal_header, DEFAULT_INTERNAL_HEADER);
    }

    #[test]
    fn test_load_missing_file() {
        let result = ServeConfig::load("/nonexistent/serve.yaml");
        assert!(matches!(result, Err(WorkflowError::Config(_))));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        std::fs::write(&path, "verify_signatures: [[[").unwrap();

        assert!(ServeConfig::load(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_header() {
        let mut config = ServeConfig::default();
        config.signature_header = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
