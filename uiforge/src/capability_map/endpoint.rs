use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ForgeError, ForgeResult};

const KNOWN_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// A host endpoint split out of a `"METHOD /path"` declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub method: String,
    pub path: String,
}

impl Endpoint {
    /// Parse `"METHOD /path"`. A bare path is accepted and defaults to `GET`.
    pub fn parse(declaration: &str) -> ForgeResult<Self> {
        let trimmed = declaration.trim();
        if trimmed.is_empty() {
            return Err(ForgeError::CapabilityMap(
                "Empty endpoint declaration".to_string(),
            ));
        }

        let (method, path) = match trimmed.split_once(char::is_whitespace) {
            Some((method, path)) => (method.to_uppercase(), path.trim().to_string()),
            None if trimmed.starts_with('/') => ("GET".to_string(), trimmed.to_string()),
            None => {
                return Err(ForgeError::CapabilityMap(format!(
                    "Endpoint '{}' is missing a path",
                    declaration
                )))
            }
        };

        if !KNOWN_METHODS.contains(&method.as_str()) {
            return Err(ForgeError::CapabilityMap(format!(
                "Endpoint '{}' uses unsupported method {}",
                declaration, method
            )));
        }
        if !path.starts_with('/') {
            return Err(ForgeError::CapabilityMap(format!(
                "Endpoint '{}' path must start with '/'",
                declaration
            )));
        }

        Ok(Self { method, path })
    }

    /// Names of `:param` segments in declaration order.
    pub fn path_params(&self) -> Vec<&str> {
        self.path
            .split('/')
            .filter_map(|segment| segment.strip_prefix(':'))
            .filter(|name| !name.is_empty())
            .collect()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}
