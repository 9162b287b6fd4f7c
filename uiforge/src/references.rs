//! Reference Extractor & Validator
//!
//! Finds the capability references a generated script passes to the two
//! host-call primitives and checks them against the [`CapabilityMap`]. The
//! scan is textual: only call sites whose first argument is a string literal
//! are seen. References assembled from variables or concatenation are
//! invisible here and are caught by the broker at call time instead.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::capability_map::{CapabilityMap, EndpointDef};

static HOST_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\b(query|action)\s*\(\s*(?:"([^"\n]+)"|'([^'\n]+)'|`([^`$\n]+)`)"#)
        .expect("valid host call pattern")
});

/// The two host-call primitives available to generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Query,
    Action,
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallKind::Query => f.write_str("query"),
            CallKind::Action => f.write_str("action"),
        }
    }
}

/// Deduplicated reference names found in a script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedReferences {
    pub queries: BTreeSet<String>,
    pub actions: BTreeSet<String>,
}

impl ExtractedReferences {
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty() && self.actions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown {kind} reference: {name}")]
pub struct UnknownReference {
    pub kind: CallKind,
    pub name: String,
}

/// Resolved `{method, path}` of a binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEndpoint {
    pub method: String,
    pub path: String,
}

/// A whitelisted reference. Derived from validation, never authored; the
/// list produced for a run becomes the broker's whitelist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiBinding {
    #[serde(rename = "type")]
    pub kind: CallKind,
    #[serde(rename = "ref")]
    pub reference: String,
    pub resolved: ResolvedEndpoint,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub references: ExtractedReferences,
    pub errors: Vec<UnknownReference>,
    pub bindings: Vec<ApiBinding>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn unknown_names(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.name.as_str()).collect()
    }
}

pub fn extract_references(script: &str) -> ExtractedReferences {
    let mut references = ExtractedReferences::default();
    for caps in HOST_CALL.captures_iter(script) {
        let name = caps
            .get(2)
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map(|m| m.as_str().to_string());
        let Some(name) = name else { continue };
        match &caps[1] {
            "query" => {
                references.queries.insert(name);
            }
            _ => {
                references.actions.insert(name);
            }
        }
    }
    references
}

/// Extract, validate and bind in one pass. Unknown names are reported in
/// `errors` and left out of `bindings`.
pub fn validate_references(script: &str, map: &CapabilityMap) -> ValidationReport {
    let references = extract_references(script);
    let mut errors = Vec::new();
    let mut bindings = Vec::new();

    let candidates = references
        .queries
        .iter()
        .map(|name| (CallKind::Query, name, map.query(name)))
        .chain(
            references
                .actions
                .iter()
                .map(|name| (CallKind::Action, name, map.action(name))),
        );

    for (kind, name, def) in candidates {
        match def {
            Some(def) => bindings.push(bind(kind, name, def)),
            None => errors.push(UnknownReference {
                kind,
                name: name.clone(),
            }),
        }
    }

    ValidationReport {
        references,
        errors,
        bindings,
    }
}

fn bind(kind: CallKind, name: &str, def: &EndpointDef) -> ApiBinding {
    let resolved = match def.resolve() {
        Ok(endpoint) => ResolvedEndpoint {
            method: endpoint.method,
            path: endpoint.path,
        },
        Err(e) => {
            log::warn!("Binding '{}' uses an unparsable endpoint: {}", name, e);
            let (method, path) = def
                .endpoint
                .trim()
                .split_once(char::is_whitespace)
                .unwrap_or(("GET", def.endpoint.trim()));
            ResolvedEndpoint {
                method: method.to_uppercase(),
                path: path.trim().to_string(),
            }
        }
    };
    ApiBinding {
        kind,
        reference: name.to_string(),
        resolved,
    }
}
