//! Extraction of tool calls from model replies.
//!
//! Recognized forms, tried in order:
//! 1. a JSON object `{"tool": ..., "arguments": {...}}` (or
//!    `{"name": ..., "parameters"|"args": {...}}`) anywhere in the reply;
//! 2. function syntax `tool_name({...})`;
//! 3. a fenced unified diff, read as `propose_patch`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::tools::PROPOSE_PATCH;
use crate::patch::clean_patch_text;

/// A tool call extracted from the model's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Trait for parsing tool calls from LLM responses.
pub trait ToolCallParser: Send + Sync {
    fn parse(&self, response: &str) -> Option<ToolCall>;
}

/// Parser restricted to a set of known tool names.
pub struct JsonToolCallParser {
    known: Vec<String>,
}

impl JsonToolCallParser {
    pub fn new<I, S>(known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: known.into_iter().map(Into::into).collect(),
        }
    }

    fn is_known(&self, name: &str) -> bool {
        self.known.iter().any(|k| k == name)
    }

    fn parse_json_format(&self, response: &str) -> Option<ToolCall> {
        for (_, object) in json_objects(response) {
            let Ok(value) = serde_json::from_str::<Value>(object) else {
                continue;
            };
            if let Some(call) = self.call_from_value(&value) {
                return Some(call);
            }
        }
        None
    }

    fn call_from_value(&self, value: &Value) -> Option<ToolCall> {
        let (name, arguments) = if let Some(name) = value.get("tool").and_then(|v| v.as_str()) {
            (name, value.get("arguments"))
        } else if let Some(name) = value.get("name").and_then(|v| v.as_str()) {
            (name, value.get("parameters").or_else(|| value.get("args")).or_else(|| value.get("arguments")))
        } else {
            return None;
        };
        if !self.is_known(name) {
            return None;
        }

        // Some models send the arguments object as a JSON string.
        let arguments = match arguments {
            Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(Value::String(s.clone())),
            Some(v) => v.clone(),
            None => Value::Object(serde_json::Map::new()),
        };
        Some(ToolCall {
            name: name.to_string(),
            arguments,
        })
    }

    fn parse_function_format(&self, response: &str) -> Option<ToolCall> {
        for name in &self.known {
            let pattern = format!("{name}(");
            let Some(start) = response.find(&pattern) else {
                continue;
            };
            let remaining = &response[start + pattern.len()..];
            let Some((offset, object)) = json_objects(remaining).next() else {
                continue;
            };
            if !remaining[..offset].trim().is_empty() {
                continue;
            }
            if let Ok(arguments) = serde_json::from_str::<Value>(object) {
                return Some(ToolCall {
                    name: name.clone(),
                    arguments,
                });
            }
        }
        None
    }

    fn parse_bare_diff(&self, response: &str) -> Option<ToolCall> {
        if !self.is_known(PROPOSE_PATCH) {
            return None;
        }
        let has_headers = response.lines().any(|l| l.starts_with("--- "))
            && response.lines().any(|l| l.starts_with("+++ "))
            && response.lines().any(|l| l.starts_with("@@"));
        if !has_headers {
            return None;
        }
        let diff = clean_patch_text(response);
        Some(ToolCall {
            name: PROPOSE_PATCH.to_string(),
            arguments: serde_json::json!({ "diff": diff }),
        })
    }
}

impl ToolCallParser for JsonToolCallParser {
    fn parse(&self, response: &str) -> Option<ToolCall> {
        self.parse_json_format(response)
            .or_else(|| self.parse_function_format(response))
            .or_else(|| self.parse_bare_diff(response))
    }
}

/// Top-level `{...}` substrings of `text` with their byte offsets, skipping
/// braces inside JSON strings.
fn json_objects(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut objects = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        objects.push((s, &text[s..=i]));
                    }
                }
            }
            _ => {}
        }
    }
    objects.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> JsonToolCallParser {
        JsonToolCallParser::new(["read_file", "search_in_files", "propose_patch", "no_patch"])
    }

    #[test]
    fn test_parse_json_format() {
        let reply = r#"Let me look at the file first.
{"tool": "read_file", "arguments": {"path": "src/A.java", "start_line": 10}}"#;
        let call = parser().parse(reply).unwrap();
        assert_eq!(call.name, "read_file");
        assert_eq!(call.arguments["start_line"], 10);
    }

    #[test]
    fn test_braces_inside_strings_do_not_confuse_the_scanner() {
        let reply = r#"{"tool": "propose_patch", "arguments": {"diff": "--- a/A.java\n+++ b/A.java\n@@ -1,1 +1,1 @@\n-if (x) {\n+if (y) {\n"}}"#;
        let call = parser().parse(reply).unwrap();
        assert_eq!(call.name, "propose_patch");
        assert!(call.arguments["diff"].as_str().unwrap().contains("+if (y) {"));
    }

    #[test]
    fn test_name_parameters_and_string_arguments() {
        let call = parser()
            .parse(r#"{"name": "no_patch", "parameters": "{\"reason\": \"cannot tell\"}"}"#)
            .unwrap();
        assert_eq!(call.name, "no_patch");
        assert_eq!(call.arguments["reason"], "cannot tell");
    }

    #[test]
    fn test_unknown_tools_are_skipped() {
        let reply = r#"{"tool": "bash", "arguments": {"command": "ls"}} then {"tool": "no_patch", "arguments": {"reason": "x"}}"#;
        assert_eq!(parser().parse(reply).unwrap().name, "no_patch");
        assert!(parser().parse(r#"{"tool": "bash", "arguments": {}}"#).is_none());
    }

    #[test]
    fn test_function_format() {
        let call = parser()
            .parse(r#"search_in_files({"pattern": "add\\(", "glob": "*.java"})"#)
            .unwrap();
        assert_eq!(call.name, "search_in_files");
        assert_eq!(call.arguments["glob"], "*.java");
    }

    #[test]
    fn test_bare_diff_is_a_proposal() {
        let reply = "Here is the fix:\n```diff\n--- a/A.java\n+++ b/A.java\n@@ -1 +1 @@\n-a\n+b\n```\n";
        let call = parser().parse(reply).unwrap();
        assert_eq!(call.name, "propose_patch");
        assert!(call.arguments["diff"].as_str().unwrap().starts_with("--- a/A.java"));
    }

    #[test]
    fn test_plain_prose_has_no_call() {
        assert!(parser().parse("I think the bug is in add().").is_none());
    }
}
