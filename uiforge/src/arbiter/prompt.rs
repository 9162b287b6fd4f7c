use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ForgeError, ForgeResult};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("valid placeholder pattern"));

pub const INTENT_SYSTEM: &str = "intent_system";
pub const CODEGEN_SYSTEM: &str = "codegen_system";
pub const CODEGEN_USER: &str = "codegen_user";
pub const CODEGEN_ITERATE: &str = "codegen_iterate";
pub const REVIEW_SYSTEM: &str = "review_system";
pub const REVIEW_USER: &str = "review_user";

#[derive(Clone, Debug)]
pub struct PromptTemplate {
    pub id: String,
    pub content: String,
}

pub trait PromptStore: Send + Sync {
    fn get_template(&self, id: &str) -> ForgeResult<PromptTemplate>;
}

/// Templates compiled into the binary.
#[derive(Clone, Default)]
pub struct BuiltinPromptStore;

impl PromptStore for BuiltinPromptStore {
    fn get_template(&self, id: &str) -> ForgeResult<PromptTemplate> {
        let content = match id {
            INTENT_SYSTEM => BUILTIN_INTENT_SYSTEM,
            CODEGEN_SYSTEM => BUILTIN_CODEGEN_SYSTEM,
            CODEGEN_USER => BUILTIN_CODEGEN_USER,
            CODEGEN_ITERATE => BUILTIN_CODEGEN_ITERATE,
            REVIEW_SYSTEM => BUILTIN_REVIEW_SYSTEM,
            REVIEW_USER => BUILTIN_REVIEW_USER,
            other => {
                return Err(ForgeError::Config(format!(
                    "No builtin prompt template '{}'",
                    other
                )))
            }
        };
        Ok(PromptTemplate {
            id: id.to_string(),
            content: content.to_string(),
        })
    }
}

/// Reads `<base_dir>/<id>.md`, falling back to the builtin template.
#[derive(Clone)]
pub struct FilePromptStore {
    base_dir: PathBuf,
}

impl FilePromptStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }
}

impl PromptStore for FilePromptStore {
    fn get_template(&self, id: &str) -> ForgeResult<PromptTemplate> {
        let path = self.base_dir.join(format!("{}.md", id));
        match fs::read_to_string(&path) {
            Ok(content) => Ok(PromptTemplate {
                id: id.to_string(),
                content,
            }),
            Err(e) => {
                log::debug!(
                    "Prompt override {} unavailable ({}); using builtin",
                    path.display(),
                    e
                );
                BuiltinPromptStore.get_template(id)
            }
        }
    }
}

#[derive(Clone)]
pub struct PromptManager {
    store: Arc<dyn PromptStore>,
}

impl Default for PromptManager {
    fn default() -> Self {
        Self::new(Arc::new(BuiltinPromptStore))
    }
}

impl PromptManager {
    pub fn new(store: Arc<dyn PromptStore>) -> Self {
        Self { store }
    }

    /// Render a template with `{var}` substitution in a single pass.
    /// Substituted values are never rescanned; unknown placeholders are left
    /// as written.
    pub fn render(&self, id: &str, vars: &HashMap<&str, String>) -> ForgeResult<String> {
        let template = self.store.get_template(id)?;
        let rendered = PLACEHOLDER.replace_all(&template.content, |caps: &Captures| {
            match vars.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        });
        Ok(rendered.into_owned())
    }
}

const BUILTIN_INTENT_SYSTEM: &str = r#"You turn requests for UI components into a structured intent for a host application.

Available capabilities:
{capabilities}

Reply with a single JSON object:
{"uiType": "...", "description": "...", "queries": ["..."], "actions": ["..."], "entityFocus": "...", "requirements": ["..."]}

Only reference queries and actions listed above. If the request is too ambiguous to build, reply instead with:
{"needsClarification": true, "question": "...", "options": ["..."], "reasoning": "..."}
"#;

const BUILTIN_CODEGEN_SYSTEM: &str = r#"You write a self-contained UI fragment for a host application.

Available capabilities:
{capabilities}

Intent:
{intent}

Rules:
- Reply with exactly one ```html block, one ```css block and one ```javascript block.
- The script may only reach host data through `await query(ref, params)` and `await action(ref, data)`.
- Pass the reference name as a string literal. Valid queries: {queries}. Valid actions: {actions}.
- No fetch, XMLHttpRequest, WebSocket, storage or imports.
"#;

const BUILTIN_CODEGEN_USER: &str = r#"Build this UI: {request}"#;

const BUILTIN_CODEGEN_ITERATE: &str = r#"The previous attempt for "{request}" failed review.

Previous markup:
```html
{markup}
```

Previous styles:
```css
{styles}
```

Previous script:
```javascript
{script}
```

Errors to fix:
{feedback}

Regenerate all three blocks in full."#;

const BUILTIN_REVIEW_SYSTEM: &str = r#"You review generated UI fragments before they run in a sandbox.

Valid queries: {queries}
Valid actions: {actions}

Check that every query(...) and action(...) call uses a valid reference name, that the markup and script agree on element ids, and that no other network or storage primitive is used.

Reply with a single JSON object:
{"verdict": "PASS" | "FAIL", "issues": [{"severity": "error" | "warning", "category": "...", "description": "...", "suggestion": "..."}], "notes": "..."}
"#;

const BUILTIN_REVIEW_USER: &str = r#"Request: {request}

```html
{markup}
```

```css
{styles}
```

```javascript
{script}
```"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_builtin_with_variables() {
        let manager = PromptManager::default();
        let mut vars = HashMap::new();
        vars.insert("request", "a task board".to_string());
        let rendered = manager.render(CODEGEN_USER, &vars).unwrap();
        assert_eq!(rendered, "Build this UI: a task board");
    }

    #[test]
    fn file_store_overrides_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("codegen_user.md"), "Custom {request}").unwrap();
        let manager = PromptManager::new(Arc::new(FilePromptStore::new(dir.path())));

        let mut vars = HashMap::new();
        vars.insert("request", "board".to_string());
        assert_eq!(manager.render(CODEGEN_USER, &vars).unwrap(), "Custom board");
        assert!(manager
            .render(REVIEW_SYSTEM, &HashMap::new())
            .unwrap()
            .contains("verdict"));
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("review_user.md"), "S:{styles}\nJS:{script}\n{missing}").unwrap();
        let manager = PromptManager::new(Arc::new(FilePromptStore::new(dir.path())));

        let mut vars = HashMap::new();
        vars.insert("styles", "#a { color: red; }".to_string());
        vars.insert("script", "el.textContent = '{styles}';".to_string());
        for _ in 0..20 {
            assert_eq!(
                manager.render(REVIEW_USER, &vars).unwrap(),
                "S:#a { color: red; }\nJS:el.textContent = '{styles}';\n{missing}"
            );
        }
    }

    #[test]
    fn json_braces_in_templates_survive() {
        let rendered = PromptManager::default()
            .render(INTENT_SYSTEM, &HashMap::new())
            .unwrap();
        assert!(rendered.contains(r#"{"needsClarification": true"#));
        assert!(rendered.contains("{capabilities}"));
    }

    #[test]
    fn unknown_template_is_an_error() {
        assert!(BuiltinPromptStore.get_template("nope").is_err());
    }
}
