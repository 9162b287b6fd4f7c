//! Capability Map
//!
//! Declarative catalogue of what a host application exposes to generated
//! code: entity shapes, read-only queries and mutating actions, each keyed by
//! the reference name generated code passes to `query(...)` / `action(...)`.
//! Acquisition of the JSON document (fetching, caching) is left to callers.

pub mod endpoint;
pub mod types;

pub use endpoint::Endpoint;
pub use types::{CapabilityEntry, CapabilityKind, CapabilityMap, EndpointDef, EntityDef};

use crate::error::{ForgeError, ForgeResult};
use std::path::Path;

impl CapabilityMap {
    pub fn from_value(value: serde_json::Value) -> ForgeResult<Self> {
        if !value.is_object() {
            return Err(ForgeError::CapabilityMap(
                "Capability map must be a JSON object".to_string(),
            ));
        }
        let map: CapabilityMap = serde_json::from_value(value)?;
        if let Err(errors) = map.validate() {
            for error in &errors {
                log::warn!("Capability map entry will not resolve: {}", error);
            }
        }
        Ok(map)
    }

    pub fn from_json_str(json: &str) -> ForgeResult<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> ForgeResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ForgeError::CapabilityMap(format!(
                "Failed to read capability map {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASKS_MAP: &str = r#"{
        "project": "tasks",
        "entities": { "Task": { "fields": ["id", "title", "status"], "description": "A unit of work" } },
        "queries": { "listTasks": { "endpoint": "GET /api/tasks", "description": "All tasks" } },
        "actions": { "createTask": { "endpoint": "POST /api/tasks" } }
    }"#;

    #[test]
    fn loads_and_looks_up_entries() {
        let map = CapabilityMap::from_json_str(TASKS_MAP).unwrap();
        assert!(map.is_usable());
        assert!(matches!(
            map.lookup("listTasks", CapabilityKind::Query),
            Some(CapabilityEntry::Endpoint(def)) if def.endpoint == "GET /api/tasks"
        ));
        assert!(map.lookup("listTasks", CapabilityKind::Action).is_none());
        assert!(matches!(
            map.lookup("Task", CapabilityKind::Entity),
            Some(CapabilityEntry::Entity(entity)) if entity.fields == vec!["id", "title", "status"]
        ));
        assert_eq!(map.list(CapabilityKind::Action).len(), 1);
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let map = CapabilityMap::from_json_str(r#"{"project":"bare"}"#).unwrap();
        assert!(!map.is_usable());
        assert!(map.ensure_usable().is_err());
    }

    #[test]
    fn non_object_documents_are_rejected() {
        assert!(CapabilityMap::from_json_str("[1, 2]").is_err());
    }

    #[test]
    fn validate_reports_malformed_endpoints() {
        let map = CapabilityMap::from_json_str(
            r#"{"queries": {"broken": {"endpoint": "tasks"}, "ok": {"endpoint": "GET /ok"}}}"#,
        )
        .unwrap();
        let errors = map.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("broken"));
    }

    #[test]
    fn prompt_rendering_lists_every_catalogue() {
        let map = CapabilityMap::from_json_str(TASKS_MAP).unwrap();
        let rendered = map.render_for_prompt();
        assert!(rendered.contains("Project: tasks"));
        assert!(rendered.contains("Task { id, title, status }"));
        assert!(rendered.contains("listTasks (GET /api/tasks) - All tasks"));
        assert!(rendered.contains("createTask (POST /api/tasks)"));
    }
}
