//! Code Block Parser
//!
//! Splits one text-generation response into markup, styles, script and the
//! free-form reasoning around the fenced blocks.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+.-]*)[^\n]*\n(.*?)```").expect("valid fence pattern")
});

static EXTRA_BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("valid blank line pattern"));

/// Which part of a fragment a fenced block carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    Markup,
    Styles,
    Script,
}

impl BlockRole {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "html" => Some(BlockRole::Markup),
            "css" => Some(BlockRole::Styles),
            "js" | "javascript" | "jsx" | "mjs" => Some(BlockRole::Script),
            _ => None,
        }
    }
}

/// A generated UI fragment. Replaced wholesale on every iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedCode {
    pub markup: String,
    pub styles: String,
    pub script: String,
    pub reasoning: String,
}

impl GeneratedCode {
    /// Only code with markup may be executed.
    pub fn is_usable(&self) -> bool {
        !self.markup.is_empty()
    }
}

/// Parse a raw response. Empty input yields empty fields; input without
/// fenced blocks is returned entirely as reasoning.
pub fn parse_code_blocks(raw: &str) -> GeneratedCode {
    if raw.is_empty() {
        return GeneratedCode::default();
    }

    let mut markup: Vec<&str> = Vec::new();
    let mut styles: Vec<&str> = Vec::new();
    let mut script: Vec<&str> = Vec::new();
    let mut outside = String::with_capacity(raw.len());
    let mut cursor = 0;
    let mut found_block = false;

    for caps in FENCED_BLOCK.captures_iter(raw) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(2)) else {
            continue;
        };
        found_block = true;
        outside.push_str(&raw[cursor..whole.start()]);
        cursor = whole.end();

        let tag = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let content = body.as_str().trim();
        match BlockRole::from_tag(tag) {
            Some(BlockRole::Markup) => markup.push(content),
            Some(BlockRole::Styles) => styles.push(content),
            Some(BlockRole::Script) => script.push(content),
            None => log::debug!("Ignoring fenced block tagged '{}'", tag),
        }
    }

    if !found_block {
        return GeneratedCode {
            reasoning: raw.to_string(),
            ..GeneratedCode::default()
        };
    }
    outside.push_str(&raw[cursor..]);

    GeneratedCode {
        markup: markup.join("\n"),
        styles: styles.join("\n"),
        script: script.join("\n"),
        reasoning: EXTRA_BLANK_LINES
            .replace_all(&outside, "\n\n")
            .trim()
            .to_string(),
    }
}

/// Same as [`parse_code_blocks`] for untyped payloads; non-strings parse to
/// an empty result.
pub fn parse_code_blocks_value(raw: &serde_json::Value) -> GeneratedCode {
    match raw.as_str() {
        Some(text) => parse_code_blocks(text),
        None => GeneratedCode::default(),
    }
}
