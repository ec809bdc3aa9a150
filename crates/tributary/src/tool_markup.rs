//! Recovery of tool calls that some vendors write into the text channel.

use serde_json::{json, Map, Value};

use crate::types::ToolCall;
use crate::vendor::Vendor;

const INLINE_OPEN: &str = "<xai:function_call";
const INLINE_CLOSE: &str = "</xai:function_call>";

const BLOCK_OPEN: &str = "<tool_call>";
const BLOCK_CLOSE: &str = "</tool_call>";
const KEY_OPEN: &str = "<arg_key>";
const KEY_CLOSE: &str = "</arg_key>";
const VALUE_OPEN: &str = "<arg_value>";
const VALUE_CLOSE: &str = "</arg_value>";

const MULTI_EDIT_TOOL: &str = "multiedit";

/// Scans `text` with the grammar the vendor is known to use.
pub fn extract_tool_calls(vendor: Vendor, text: &str) -> Vec<ToolCall> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    match vendor {
        Vendor::Standard => Vec::new(),
        Vendor::Xai => parse_inline_tag_calls(text, vendor.call_id_prefix()),
        Vendor::Zhipu => parse_key_value_blocks(text, vendor.call_id_prefix()),
    }
}

/// `<xai:function_call name="NAME"> ARGS [</xai:function_call>]`
///
/// The closing tag is optional: an unterminated call runs to the next opening
/// tag or to the end of the text.
pub fn parse_inline_tag_calls(text: &str, id_prefix: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find(INLINE_OPEN) {
        let tag_start = cursor + offset + INLINE_OPEN.len();
        cursor = tag_start;

        let Some((name, body_start)) = parse_inline_open_tag(&text[tag_start..]) else {
            continue;
        };
        let body_start = tag_start + body_start;
        let rest = &text[body_start..];
        let body_end = [rest.find(INLINE_CLOSE), rest.find(INLINE_OPEN)]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(rest.len());
        let raw_args = rest[..body_end].trim();
        cursor = body_start + body_end;
        if rest[body_end..].starts_with(INLINE_CLOSE) {
            cursor += INLINE_CLOSE.len();
        }

        let input = if name == MULTI_EDIT_TOOL {
            repair_multi_edit_arguments(raw_args)
        } else {
            normalize_inline_arguments(raw_args)
        };
        if input.is_empty() {
            continue;
        }

        let id = format!("{id_prefix}_call_{}", calls.len());
        calls.push(ToolCall::finished(id, name, input));
    }

    calls
}

/// Parses ` name="NAME">` after the tag marker. Returns the name and the
/// offset just past `>`.
fn parse_inline_open_tag(tag: &str) -> Option<(String, usize)> {
    let trimmed = tag.trim_start();
    if trimmed.len() == tag.len() {
        // marker must be followed by whitespace
        return None;
    }
    let consumed = tag.len() - trimmed.len();
    let after_attr = trimmed.strip_prefix("name=\"")?;
    let name_end = after_attr.find('"')?;
    let name = &after_attr[..name_end];
    if name.is_empty() {
        return None;
    }

    let after_name = &after_attr[name_end + 1..];
    let after_space = after_name.trim_start();
    after_space.strip_prefix('>')?;

    let attr_len = "name=\"".len() + name_end + 1;
    let space_len = after_name.len() - after_space.len();
    Some((name.to_string(), consumed + attr_len + space_len + 1))
}

fn normalize_inline_arguments(raw_args: &str) -> String {
    if serde_json::from_str::<Value>(raw_args).is_ok() {
        return raw_args.to_string();
    }
    if raw_args.starts_with('[') && raw_args.ends_with(']') {
        return raw_args.to_string();
    }
    Value::String(raw_args.to_string()).to_string()
}

/// The multi-edit convention sends only the edit list. It is re-wrapped as
/// `{"file_path": "", "edits": [...]}`; an array missing its final `]` is
/// repaired once. Anything that still does not parse is returned unchanged so
/// the caller can report the bad arguments.
pub fn repair_multi_edit_arguments(raw_args: &str) -> String {
    if !raw_args.starts_with('[') {
        return raw_args.to_string();
    }

    if let Some(wrapped) = wrap_edit_list(raw_args) {
        return wrapped;
    }
    if !raw_args.ends_with(']') {
        let repaired = format!("{raw_args}]");
        if let Some(wrapped) = wrap_edit_list(&repaired) {
            return wrapped;
        }
    }

    raw_args.to_string()
}

fn wrap_edit_list(raw_args: &str) -> Option<String> {
    let edits = serde_json::from_str::<Vec<Map<String, Value>>>(raw_args).ok()?;
    serde_json::to_string(&json!({
        "file_path": "",
        "edits": edits,
    }))
    .ok()
}

/// `<tool_call>NAME\n<arg_key>K</arg_key><arg_value>V</arg_value>...</tool_call>`
///
/// Pairs become a JSON object. Values that parse as JSON keep their type,
/// anything else is a string. A block without a name is skipped.
pub fn parse_key_value_blocks(text: &str, id_prefix: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find(BLOCK_OPEN) {
        let body_start = cursor + offset + BLOCK_OPEN.len();
        let rest = &text[body_start..];
        let body_end = [rest.find(BLOCK_CLOSE), rest.find(BLOCK_OPEN)]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(rest.len());
        let body = &rest[..body_end];
        cursor = body_start + body_end;

        let Some(name) = block_tool_name(body) else {
            continue;
        };
        let arguments = Value::Object(block_arguments(body));
        let id = format!("{id_prefix}_call_{}", calls.len());
        calls.push(ToolCall::finished(id, name, arguments.to_string()));
    }

    calls
}

fn block_tool_name(body: &str) -> Option<String> {
    let head_end = body.find(KEY_OPEN).unwrap_or(body.len());
    let name = body[..head_end].lines().map(str::trim).find(|line| !line.is_empty())?;
    Some(name.to_string())
}

fn block_arguments(body: &str) -> Map<String, Value> {
    let mut arguments = Map::new();
    let mut cursor = 0;

    while let Some(key) = between(body, cursor, KEY_OPEN, KEY_CLOSE) {
        cursor = key.end;
        let Some(value) = between(body, cursor, VALUE_OPEN, VALUE_CLOSE) else {
            break;
        };
        // a value belongs to the nearest preceding key only
        if let Some(next_key) = body[cursor..].find(KEY_OPEN) {
            if cursor + next_key < value.start {
                continue;
            }
        }
        cursor = value.end;

        let key_text = body[key.start..key.inner_end].trim();
        if key_text.is_empty() {
            continue;
        }
        let value_text = body[value.start..value.inner_end].trim();
        let parsed = serde_json::from_str::<Value>(value_text)
            .unwrap_or_else(|_| Value::String(value_text.to_string()));
        arguments.insert(key_text.to_string(), parsed);
    }

    arguments
}

struct Span {
    start: usize,
    inner_end: usize,
    end: usize,
}

fn between(text: &str, from: usize, open: &str, close: &str) -> Option<Span> {
    let open_at = from + text[from..].find(open)?;
    let start = open_at + open.len();
    let inner_len = text[start..].find(close)?;
    Some(Span {
        start,
        inner_end: start + inner_len,
        end: start + inner_len + close.len(),
    })
}
