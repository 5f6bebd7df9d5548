//! Runtime options loaded from JSON.
//!
//! Every section is optional; absent keys keep their defaults.
//!
//! ```json
//! {
//!   "conversion": {
//!     "allow_narrowing": false,
//!     "allow": [{"given": "float64", "spec": "int32", "result": "float64"}],
//!     "deny": [{"given": "uint8", "spec": "int8"}]
//!   },
//!   "json": {"compress": true, "level": 9}
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backend::json::JsonOptions;
use crate::build::convert::ConversionPolicy;
use crate::error::ConfigError;
use crate::model::value::Primitive;

/// Extra allowed conversion: `given` values in `spec` fields stored as `result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowRule {
    pub given: String,
    pub spec: String,
    pub result: String,
}

/// Conversion removed from the default table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyRule {
    pub given: String,
    pub spec: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Store whole floats in integer fields.
    pub allow_narrowing: bool,
    pub allow: Vec<AllowRule>,
    pub deny: Vec<DenyRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub conversion: ConversionConfig,
    pub json: JsonOptions,
}

impl Config {
    pub fn from_json_str(text: &str) -> Result<Config, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&text)
    }

    /// Builds the conversion policy: default table, then allow rules, then deny rules.
    pub fn conversion_policy(&self) -> Result<ConversionPolicy, ConfigError> {
        let conv = &self.conversion;
        let mut policy = ConversionPolicy::new().with_narrowing(conv.allow_narrowing);
        for rule in &conv.allow {
            policy = policy.allow(dtype(&rule.given)?, dtype(&rule.spec)?, dtype(&rule.result)?);
        }
        for rule in &conv.deny {
            policy = policy.deny(dtype(&rule.given)?, dtype(&rule.spec)?);
        }
        Ok(policy)
    }
}

fn dtype(name: &str) -> Result<Primitive, ConfigError> {
    Primitive::from_name(name).ok_or_else(|| ConfigError::UnknownDtype(name.to_string()))
}
