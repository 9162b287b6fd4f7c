use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::endpoint::Endpoint;
use crate::error::{ForgeError, ForgeResult};

/// Shape of a host entity exposed to generated code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDef {
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// A published query or action: `"METHOD /path"` plus a description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDef {
    pub endpoint: String,
    #[serde(default)]
    pub description: String,
}

impl EndpointDef {
    pub fn resolve(&self) -> ForgeResult<Endpoint> {
        Endpoint::parse(&self.endpoint)
    }
}

/// The three catalogues a capability map publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Entity,
    Query,
    Action,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapabilityKind::Entity => "entity",
            CapabilityKind::Query => "query",
            CapabilityKind::Action => "action",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CapabilityEntry<'a> {
    Entity(&'a EntityDef),
    Endpoint(&'a EndpointDef),
}

/// Read-only catalogue of host-exposed queries, actions and entity shapes.
///
/// A map is immutable for the duration of a pipeline run; callers share it
/// behind an `Arc`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityMap {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub entities: IndexMap<String, EntityDef>,
    #[serde(default)]
    pub actions: IndexMap<String, EndpointDef>,
    #[serde(default)]
    pub queries: IndexMap<String, EndpointDef>,
}

impl CapabilityMap {
    pub fn lookup(&self, reference: &str, kind: CapabilityKind) -> Option<CapabilityEntry<'_>> {
        match kind {
            CapabilityKind::Entity => self.entities.get(reference).map(CapabilityEntry::Entity),
            CapabilityKind::Query => self.queries.get(reference).map(CapabilityEntry::Endpoint),
            CapabilityKind::Action => self.actions.get(reference).map(CapabilityEntry::Endpoint),
        }
    }

    pub fn list(&self, kind: CapabilityKind) -> Vec<(&str, CapabilityEntry<'_>)> {
        match kind {
            CapabilityKind::Entity => self
                .entities
                .iter()
                .map(|(name, def)| (name.as_str(), CapabilityEntry::Entity(def)))
                .collect(),
            CapabilityKind::Query => self
                .queries
                .iter()
                .map(|(name, def)| (name.as_str(), CapabilityEntry::Endpoint(def)))
                .collect(),
            CapabilityKind::Action => self
                .actions
                .iter()
                .map(|(name, def)| (name.as_str(), CapabilityEntry::Endpoint(def)))
                .collect(),
        }
    }

    pub fn query(&self, reference: &str) -> Option<&EndpointDef> {
        self.queries.get(reference)
    }

    pub fn action(&self, reference: &str) -> Option<&EndpointDef> {
        self.actions.get(reference)
    }

    pub fn is_usable(&self) -> bool {
        !(self.entities.is_empty() && self.actions.is_empty() && self.queries.is_empty())
    }

    pub fn ensure_usable(&self) -> ForgeResult<()> {
        if self.is_usable() {
            Ok(())
        } else {
            Err(ForgeError::CapabilityMap(format!(
                "Capability map for '{}' declares no entities, queries or actions",
                self.project
            )))
        }
    }

    /// Report every endpoint declaration that does not parse.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let errors: Vec<String> = self
            .queries
            .iter()
            .map(|(name, def)| ("query", name, def))
            .chain(self.actions.iter().map(|(name, def)| ("action", name, def)))
            .filter_map(|(kind, name, def)| {
                def.resolve()
                    .err()
                    .map(|e| format!("{} '{}': {}", kind, name, e))
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Text block embedded in system prompts.
    pub fn render_for_prompt(&self) -> String {
        let mut out = String::new();
        if !self.project.is_empty() {
            out.push_str(&format!("Project: {}\n\n", self.project));
        }

        out.push_str("Entities:\n");
        if self.entities.is_empty() {
            out.push_str("  (none)\n");
        }
        for (name, entity) in &self.entities {
            out.push_str(&format!("  - {} {{ {} }}", name, entity.fields.join(", ")));
            if !entity.description.is_empty() {
                out.push_str(&format!(" - {}", entity.description));
            }
            out.push('\n');
        }

        for (title, catalogue) in [("Queries", &self.queries), ("Actions", &self.actions)] {
            out.push_str(&format!("\n{}:\n", title));
            if catalogue.is_empty() {
                out.push_str("  (none)\n");
            }
            for (name, def) in catalogue {
                out.push_str(&format!("  - {} ({})", name, def.endpoint));
                if !def.description.is_empty() {
                    out.push_str(&format!(" - {}", def.description));
                }
                out.push('\n');
            }
        }
        out
    }

    /// Comma-separated reference names, used by the review prompt.
    pub fn reference_names(&self, kind: CapabilityKind) -> String {
        let names: Vec<&str> = self.list(kind).into_iter().map(|(name, _)| name).collect();
        if names.is_empty() {
            "(none)".to_string()
        } else {
            names.join(", ")
        }
    }
}
