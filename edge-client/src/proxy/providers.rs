//! Request and response shapes of each upstream AI provider.

use serde_json::{json, Value};

use crate::types::{ChatMessage, KnownService, TokenUsage};

pub const CLAUDE_BASE_URL: &str = "https://api.anthropic.com";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const ANTHROPIC_VERSION: &str = "2023-06-01";
const CLAUDE_DEFAULT_MAX_TOKENS: u32 = 1024;

/// A ready-to-send upstream request.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamCall {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Value,
}

/// Normalized inputs for one completion.
#[derive(Debug, Clone, Copy)]
pub struct Completion<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

pub fn build_call(service: &KnownService, completion: &Completion<'_>) -> UpstreamCall {
    let settings = service.settings();
    match service {
        KnownService::Claude(_) => {
            let base = settings.base_url.as_deref().unwrap_or(CLAUDE_BASE_URL);
            UpstreamCall {
                url: format!("{}/v1/messages", base.trim_end_matches('/')),
                headers: vec![
                    ("x-api-key", settings.api_key.clone()),
                    ("anthropic-version", ANTHROPIC_VERSION.to_string()),
                ],
                body: claude_body(completion),
            }
        }
        KnownService::Openai(_) => {
            let base = settings.base_url.as_deref().unwrap_or(OPENAI_BASE_URL);
            UpstreamCall {
                url: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
                headers: vec![("authorization", format!("Bearer {}", settings.api_key))],
                body: openai_body(completion),
            }
        }
        KnownService::Gemini(_) => {
            let base = settings.base_url.as_deref().unwrap_or(GEMINI_BASE_URL);
            UpstreamCall {
                url: format!(
                    "{}/v1beta/models/{}:generateContent",
                    base.trim_end_matches('/'),
                    completion.model
                ),
                headers: vec![("x-goog-api-key", settings.api_key.clone())],
                body: gemini_body(completion),
            }
        }
    }
}

/// Pull the text and token counts out of a provider response.
pub fn parse_reply(service: &KnownService, body: &Value) -> Result<Reply, String> {
    match service {
        KnownService::Claude(_) => parse_claude(body),
        KnownService::Openai(_) => parse_openai(body),
        KnownService::Gemini(_) => parse_gemini(body),
    }
}

fn claude_body(c: &Completion<'_>) -> Value {
    let system: Vec<&str> = c
        .messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_str())
        .collect();
    let messages: Vec<Value> = c
        .messages
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect();

    let mut body = json!({
        "model": c.model,
        "max_tokens": c.max_tokens.unwrap_or(CLAUDE_DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = Value::String(system.join("\n"));
    }
    if let Some(t) = c.temperature {
        body["temperature"] = json!(t);
    }
    body
}

fn openai_body(c: &Completion<'_>) -> Value {
    let mut body = json!({
        "model": c.model,
        "messages": c.messages,
    });
    if let Some(max) = c.max_tokens {
        body["max_tokens"] = json!(max);
    }
    if let Some(t) = c.temperature {
        body["temperature"] = json!(t);
    }
    body
}

fn gemini_body(c: &Completion<'_>) -> Value {
    let contents: Vec<Value> = c
        .messages
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| {
            let role = if m.role == "assistant" { "model" } else { "user" };
            json!({"role": role, "parts": [{"text": m.content}]})
        })
        .collect();

    let mut body = json!({ "contents": contents });

    let system: Vec<Value> = c
        .messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| json!({"text": m.content}))
        .collect();
    if !system.is_empty() {
        body["systemInstruction"] = json!({ "parts": system });
    }

    let mut generation = serde_json::Map::new();
    if let Some(max) = c.max_tokens {
        generation.insert("maxOutputTokens".to_string(), json!(max));
    }
    if let Some(t) = c.temperature {
        generation.insert("temperature".to_string(), json!(t));
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }
    body
}

fn token_usage(usage: &Value, input: &str, output: &str) -> Option<TokenUsage> {
    Some(TokenUsage {
        input_tokens: usage.get(input)?.as_u64()?,
        output_tokens: usage.get(output)?.as_u64()?,
    })
}

fn parse_claude(body: &Value) -> Result<Reply, String> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or("response has no content blocks")?;
    let content: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();

    Ok(Reply {
        content,
        usage: body
            .get("usage")
            .and_then(|u| token_usage(u, "input_tokens", "output_tokens")),
    })
}

fn parse_openai(body: &Value) -> Result<Reply, String> {
    let content = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or("response has no choices")?;

    Ok(Reply {
        content: content.to_string(),
        usage: body
            .get("usage")
            .and_then(|u| token_usage(u, "prompt_tokens", "completion_tokens")),
    })
}

fn parse_gemini(body: &Value) -> Result<Reply, String> {
    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or("response has no candidates")?;
    let content: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();

    Ok(Reply {
        content,
        usage: body
            .get("usageMetadata")
            .and_then(|u| token_usage(u, "promptTokenCount", "candidatesTokenCount")),
    })
}
