use serde_json::json;
use tributary::{
    extract_tool_calls, validate_tool_call, ErrorCode, ToolCall, ToolInfo, Vendor,
};

fn sample_tool() -> ToolInfo {
    ToolInfo {
        name: "view".to_string(),
        description: "Read a file".to_string(),
        parameters: json!({
            "file_path": { "type": "string" },
            "offset": { "type": "integer", "minimum": 0 }
        }),
        required: vec!["file_path".to_string()],
    }
}

#[test]
fn validate_tool_call_accepts_valid_arguments() {
    let tools = vec![sample_tool()];
    let call = ToolCall::finished("tool-1", "view", r#"{"file_path":"README.md","offset":10}"#);

    let validated = validate_tool_call(&tools, &call).expect("validation should pass");
    assert_eq!(validated["file_path"], json!("README.md"));
    assert_eq!(validated["offset"], json!(10));
}

#[test]
fn validate_tool_call_rejects_missing_tool() {
    let tools = vec![sample_tool()];
    let call = ToolCall::finished("tool-2", "write", r#"{"file_path":"x"}"#);

    let error = validate_tool_call(&tools, &call).expect_err("missing tool should fail");
    assert_eq!(error.code, ErrorCode::ToolNotFound);
    assert!(error.message.contains("tool 'write' not found"));
    assert_eq!(error.details.unwrap()["availableTools"], json!(["view"]));
}

#[test]
fn validate_tool_call_rejects_invalid_arguments_with_structured_details() {
    let tools = vec![sample_tool()];
    let call = ToolCall::finished("tool-3", "view", r#"{"file_path":10}"#);

    let error = validate_tool_call(&tools, &call).expect_err("invalid arguments should fail");
    assert_eq!(error.code, ErrorCode::ToolArgumentsInvalid);

    let details = error
        .details
        .expect("validation error should contain details");
    let validation_errors = details["validationErrors"]
        .as_array()
        .expect("validationErrors should be array");
    assert!(!validation_errors.is_empty());
}

#[test]
fn validate_tool_call_reports_malformed_arguments() {
    let tools = vec![sample_tool()];
    let call = ToolCall::finished("tool-4", "view", r#"{"file_path": "#);

    let error = validate_tool_call(&tools, &call).expect_err("truncated JSON should fail");
    assert_eq!(error.code, ErrorCode::MalformedToolCallArguments);
    assert_eq!(error.details.unwrap()["toolCallId"], "tool-4");
}

#[test]
fn recovered_text_calls_validate_against_catalog() {
    let text = "<xai:function_call name=\"view\"> {\"file_path\":\"/x\"}</xai:function_call>\
                <xai:function_call name=\"view\"> /y";
    let calls = extract_tool_calls(Vendor::Xai, text);
    assert_eq!(calls.len(), 2);

    let tools = vec![sample_tool()];
    assert!(validate_tool_call(&tools, &calls[0]).is_ok());

    // Free text is wrapped as a JSON string, which is not an object.
    let error = validate_tool_call(&tools, &calls[1]).unwrap_err();
    assert_eq!(error.code, ErrorCode::ToolArgumentsInvalid);
}
