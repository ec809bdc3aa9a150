//! Heuristic endpoint classification.
//!
//! Every check here is a string match on the configured base URL or model id.
//! None of it is authoritative; it only selects quirk handling.

use serde::{Deserialize, Serialize};

/// Endpoint families that need special handling on top of the standard
/// chat-completions protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    Standard,
    /// Grok models; may emit `<xai:function_call name="...">` tags in text.
    Xai,
    /// GLM models; may emit `<tool_call>` blocks with `<arg_key>`/`<arg_value>` pairs.
    Zhipu,
}

impl Vendor {
    pub fn classify(base_url: &str, model_id: &str) -> Self {
        let base_url = base_url.to_lowercase();
        let model_id = model_id.to_lowercase();

        if base_url.contains("x.ai") || base_url.contains("xai") || model_id.contains("grok") {
            return Vendor::Xai;
        }
        if base_url.contains("bigmodel.cn")
            || base_url.contains("z.ai")
            || model_id.starts_with("glm")
            || model_id.contains("/glm")
        {
            return Vendor::Zhipu;
        }
        Vendor::Standard
    }

    /// Whether tool calls may show up as free text instead of structured fields.
    pub fn embeds_tool_calls_in_text(self) -> bool {
        !matches!(self, Vendor::Standard)
    }

    pub fn call_id_prefix(self) -> &'static str {
        match self {
            Vendor::Standard => "call",
            Vendor::Xai => "xai",
            Vendor::Zhipu => "zhipu",
        }
    }
}

/// Local/development servers (LM Studio, Ollama, anything on loopback).
/// These are known to answer 429 when they are merely busy loading a model.
pub fn is_local_endpoint(base_url: &str) -> bool {
    if is_loopback_base_url(base_url) {
        return true;
    }
    let lowered = base_url.to_lowercase();
    lowered.contains("lmstudio") || lowered.contains(":1234") || lowered.contains(":11434")
}

pub fn is_loopback_base_url(base_url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(base_url) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "[::1]" || host == "::1"
}

/// Anthropic models routed through OpenRouter accept `cache_control` on
/// individual content segments.
pub fn supports_cache_annotations(base_url: &str, model_id: &str) -> bool {
    base_url.to_lowercase().contains("openrouter") && model_id.starts_with("anthropic/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_xai_by_base_url_or_model_id() {
        assert_eq!(Vendor::classify("https://api.x.ai/v1", "grok-2"), Vendor::Xai);
        assert_eq!(
            Vendor::classify("https://openrouter.ai/api/v1", "x-ai/grok-code-fast-1"),
            Vendor::Xai
        );
    }

    #[test]
    fn classifies_zhipu_by_base_url_or_model_id() {
        assert_eq!(
            Vendor::classify("https://open.bigmodel.cn/api/paas/v4", "glm-4.5"),
            Vendor::Zhipu
        );
        assert_eq!(
            Vendor::classify("https://openrouter.ai/api/v1", "z-ai/glm-4.6"),
            Vendor::Zhipu
        );
    }

    #[test]
    fn everything_else_is_standard() {
        let vendor = Vendor::classify("https://api.openai.com/v1", "gpt-4o");
        assert_eq!(vendor, Vendor::Standard);
        assert!(!vendor.embeds_tool_calls_in_text());
    }

    #[test]
    fn local_endpoints_include_loopback_and_known_dev_ports() {
        assert!(is_local_endpoint("http://localhost:8080/v1"));
        assert!(is_local_endpoint("http://127.0.0.1/v1"));
        assert!(is_local_endpoint("http://192.168.1.20:1234/v1"));
        assert!(!is_local_endpoint("https://api.openai.com/v1"));
    }

    #[test]
    fn cache_annotations_only_for_anthropic_on_openrouter() {
        assert!(supports_cache_annotations(
            "https://openrouter.ai/api/v1",
            "anthropic/claude-sonnet-4"
        ));
        assert!(!supports_cache_annotations(
            "https://openrouter.ai/api/v1",
            "openai/gpt-4o"
        ));
        assert!(!supports_cache_annotations(
            "https://api.anthropic.com/v1",
            "anthropic/claude-sonnet-4"
        ));
    }
}
