use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use thiserror::Error;
use tracing::debug;

use crate::agent::ChatModel;

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_base: String, // e.g. "https://api.openai.com/v1"
    pub api_key: String,  // env OPENAI_API_KEY
    pub model: String,    // e.g. "gpt-4o-mini"
    pub temperature: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            temperature: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("OPENAI_API_KEY missing")]
    MissingApiKey,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("OpenAI error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them.
    pub arguments: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".into()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".into(),
            content,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ModelTurn {
    /// Final answer; the run is over.
    Message { text: String },
    ToolCalls {
        text: Option<String>,
        calls: Vec<ToolCall>,
    },
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    cfg: LlmConfig,
}

impl LlmClient {
    pub fn new(cfg: LlmConfig) -> Result<Self, LlmError> {
        if cfg.api_key.is_empty() {
            return Err(LlmError::MissingApiKey);
        }
        Ok(Self {
            http: Client::new(),
            cfg,
        })
    }

    pub fn model(&self) -> &str {
        &self.cfg.model
    }

    fn request_body(&self, messages: &[ChatMessage], tools: &Value) -> Value {
        let mut req = json!({
            "model": self.cfg.model,
            "messages": messages,
        });
        if tools.as_array().is_some_and(|t| !t.is_empty()) {
            req["tools"] = tools.clone();
            // One call at a time keeps page operations strictly serial.
            req["parallel_tool_calls"] = Value::Bool(false);
        }
        if let Some(t) = self.cfg.temperature {
            req["temperature"] = json!(t);
        }
        req
    }

    pub async fn complete(&self, messages: &[ChatMessage], tools: &Value) -> Result<ModelTurn, LlmError> {
        let url = format!("{}/chat/completions", self.cfg.api_base.trim_end_matches('/'));
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&self.request_body(messages, tools))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                body: text,
            });
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::Decode(format!("failed to parse response JSON: {e}")))?;
        Self::parse_output(v)
    }

    /// Reads `choices[0].message`; tool calls take precedence over content.
    pub fn parse_output(v: Value) -> Result<ModelTurn, LlmError> {
        let message = v
            .pointer("/choices/0/message")
            .ok_or_else(|| LlmError::Decode("missing choices[0].message".into()))?;
        let text = message
            .get("content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty());

        let calls: Vec<ToolCall> = match message.get("tool_calls") {
            Some(Value::Array(arr)) if !arr.is_empty() => serde_json::from_value(Value::Array(arr.clone()))
                .map_err(|e| LlmError::Decode(format!("bad tool_calls: {e}")))?,
            _ => Vec::new(),
        };
        if !calls.is_empty() {
            debug!(count = calls.len(), "model requested tool calls");
            return Ok(ModelTurn::ToolCalls { text, calls });
        }
        Ok(ModelTurn::Message {
            text: text.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete(&self, messages: &[ChatMessage], tools: &Value) -> Result<ModelTurn, LlmError> {
        LlmClient::complete(self, messages, tools).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_calls() {
        let v = json!({
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "finish_reason": "tool_calls",
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": { "name": "open_url", "arguments": "{\"url\":\"https://ui.chaicode.com\"}" }
                    }]
                }
            }]
        });
        let turn = LlmClient::parse_output(v).unwrap();
        let ModelTurn::ToolCalls { text, calls } = turn else {
            panic!("expected tool calls");
        };
        assert!(text.is_none());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_abc");
        assert_eq!(calls[0].function.name, "open_url");
        let args: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["url"], "https://ui.chaicode.com");
    }

    #[test]
    fn parses_final_message() {
        let v = json!({
            "choices": [{ "message": { "role": "assistant", "content": "Account created." } }]
        });
        assert_eq!(
            LlmClient::parse_output(v).unwrap(),
            ModelTurn::Message { text: "Account created.".into() }
        );
    }

    #[test]
    fn missing_choices_is_a_decode_error() {
        let err = LlmClient::parse_output(json!({"error": {"message": "boom"}})).unwrap_err();
        assert!(matches!(err, LlmError::Decode(_)));
    }

    #[test]
    fn request_carries_tools_and_serial_calls() {
        let client = LlmClient::new(LlmConfig {
            api_base: "http://localhost".into(),
            api_key: "k".into(),
            model: "m".into(),
            temperature: Some(0.0),
        })
        .unwrap();
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::tool("call_1", "{\"success\":true}"),
        ];
        let body = client.request_body(&messages, &crate::tools::definitions());
        assert_eq!(body["model"], "m");
        assert_eq!(body["parallel_tool_calls"], false);
        assert_eq!(body["tools"].as_array().unwrap().len(), 5);
        assert_eq!(body["messages"][1]["tool_call_id"], "call_1");
        assert!(body["messages"][0].get("tool_calls").is_none());
    }

    #[test]
    fn missing_key_is_rejected() {
        let cfg = LlmConfig {
            api_key: String::new(),
            ..LlmConfig::default()
        };
        assert!(matches!(LlmClient::new(cfg), Err(LlmError::MissingApiKey)));
    }
}
