use jsonschema::JSONSchema;
use serde_json::{json, Value};

use crate::error::{ErrorCode, TributaryError};
use crate::types::{ToolCall, ToolInfo};

/// Parses a finished call's input and checks it against the catalog entry's
/// schema. Returns the parsed arguments.
pub fn validate_tool_call(tools: &[ToolInfo], tool_call: &ToolCall) -> Result<Value, TributaryError> {
    let Some(tool) = tools.iter().find(|tool| tool.name == tool_call.name) else {
        let available = tools
            .iter()
            .map(|tool| tool.name.clone())
            .collect::<Vec<_>>();
        return Err(TributaryError::new(
            ErrorCode::ToolNotFound,
            format!("tool '{}' not found", tool_call.name),
        )
        .with_details(json!({
            "toolName": tool_call.name,
            "availableTools": available,
        })));
    };

    let arguments = parse_tool_arguments(tool_call)?;
    validate_tool_arguments(tool, tool_call, &arguments)?;
    Ok(arguments)
}

/// Empty input means "no arguments".
pub fn parse_tool_arguments(tool_call: &ToolCall) -> Result<Value, TributaryError> {
    let input = tool_call.input.trim();
    if input.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(input).map_err(|error| {
        TributaryError::new(
            ErrorCode::MalformedToolCallArguments,
            format!("arguments for tool '{}' are not valid JSON: {error}", tool_call.name),
        )
        .with_details(json!({
            "toolName": tool_call.name,
            "toolCallId": tool_call.id,
            "input": tool_call.input,
        }))
    })
}

fn validate_tool_arguments(
    tool: &ToolInfo,
    tool_call: &ToolCall,
    arguments: &Value,
) -> Result<(), TributaryError> {
    let schema = tool.schema();
    let compiled = JSONSchema::compile(&schema).map_err(|error| {
        TributaryError::new(
            ErrorCode::SchemaInvalid,
            format!("invalid JSON schema for tool '{}': {error}", tool.name),
        )
        .with_details(json!({
            "toolName": tool.name,
        }))
    })?;

    if let Err(errors) = compiled.validate(arguments) {
        let validation_errors = errors
            .map(|error| {
                json!({
                    "path": error.instance_path.to_string(),
                    "message": error.to_string(),
                })
            })
            .collect::<Vec<_>>();

        return Err(TributaryError::new(
            ErrorCode::ToolArgumentsInvalid,
            format!("validation failed for tool '{}'", tool.name),
        )
        .with_details(json!({
            "toolName": tool.name,
            "toolCallId": tool_call.id,
            "arguments": arguments,
            "validationErrors": validation_errors,
        })));
    }

    Ok(())
}
