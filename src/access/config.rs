use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccessListError {
    #[error("failed to read access list file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse access list: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),
    #[error("invalid domain entry: {0}")]
    InvalidDomain(String),
}

/// Access list source format: two plain lists, loaded from a YAML file.
/// A remote key-value source publishes the same shape under the
/// `/domains/` and `/subnets/` prefixes and drives the add/delete
/// mutators on [`super::AccessList`] directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessListConfig {
    /// Domain suffixes to match ("example.com" matches any subdomain).
    #[serde(default)]
    pub domains: Vec<String>,

    /// Subnets in CIDR notation.
    #[serde(default)]
    pub subnets: Vec<String>,
}

impl AccessListConfig {
    /// Loads an access list from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AccessListError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses an access list from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, AccessListError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AccessListError> {
        for domain in &self.domains {
            if domain.is_empty() || domain.chars().any(|c| c.is_whitespace()) {
                return Err(AccessListError::InvalidDomain(domain.clone()));
            }
        }
        for subnet in &self.subnets {
            if subnet.parse::<ipnetwork::IpNetwork>().is_err() {
                return Err(AccessListError::InvalidCidr(subnet.clone()));
            }
        }
        Ok(())
    }
}
