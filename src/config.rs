//! Configuration loading via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Control-plane credentials and fleet defaults, read from the `OS_*`
/// environment family (with configuration-file fallback).
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "OS")]
pub struct CloudConfig {
    /// Identity endpoint used for the token-exchange POST.
    pub auth_url: String,
    /// Login used for the token exchange.
    pub username: String,
    /// Password used for the token exchange. Also doubles as the admin
    /// password handed to rebuilt instances.
    pub password: String,
    /// Tenant the fleet is provisioned under.
    pub tenant_name: String,
    /// Region used to pick endpoints out of the service catalog.
    pub region_name: String,
    /// Boot image label applied to every instance in the fleet.
    pub image: String,
    /// DNS suffix appended to instance names to form fully qualified names.
    pub hostname_suffix: Option<String>,
    /// Network label instances are attached to. When unset the provider
    /// default network assignment applies.
    pub network_label: Option<String>,
    /// SSH keypair name injected at creation time.
    pub key_name: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str) -> Self {
        Self {
            description,
            env_var,
        }
    }
}

impl CloudConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {}",
                metadata.description, metadata.env_var
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("fleetrun")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the DNS suffix, defaulting to the empty string.
    #[must_use]
    pub fn suffix(&self) -> &str {
        self.hostname_suffix.as_deref().unwrap_or("")
    }

    /// Performs semantic validation on required fields. Error messages name
    /// the environment variable that supplies the missing value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.auth_url,
            &FieldMetadata::new("identity endpoint URL", "OS_AUTH_URL"),
        )?;
        Self::require_field(
            &self.username,
            &FieldMetadata::new("control-plane login", "OS_USERNAME"),
        )?;
        Self::require_field(
            &self.password,
            &FieldMetadata::new("control-plane password", "OS_PASSWORD"),
        )?;
        Self::require_field(
            &self.tenant_name,
            &FieldMetadata::new("tenant name", "OS_TENANT_NAME"),
        )?;
        Self::require_field(
            &self.region_name,
            &FieldMetadata::new("region name", "OS_REGION_NAME"),
        )?;
        Self::require_field(&self.image, &FieldMetadata::new("boot image", "OS_IMAGE"))?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
