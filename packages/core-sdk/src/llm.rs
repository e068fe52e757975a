use anyhow::{anyhow, Result};
use async_stream::try_stream;
use futures_util::Stream;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use std::pin::Pin;

use crate::models::{Message, Role};

/** \brief 请求未携带 instructions 时使用的系统指令。 */
pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful assistant.";

/**
 * \brief Provider 类型，封闭集合。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Google,
    OpenAi,
    DeepSeek,
}

impl ProviderKind {
    /**
     * \brief 按名称解析 Provider；未知名称静默回退到 Google。
     */
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "openai" => ProviderKind::OpenAi,
            "deepseek" => ProviderKind::DeepSeek,
            _ => ProviderKind::Google,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::Google => "google",
            ProviderKind::OpenAi => "openai",
            ProviderKind::DeepSeek => "deepseek",
        }
    }

    /**
     * \brief Provider 的 API 基地址。
     */
    pub fn api_base(self) -> &'static str {
        match self {
            ProviderKind::Google => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::OpenAi => "https://api.openai.com",
            ProviderKind::DeepSeek => "https://api.deepseek.com",
        }
    }

    /**
     * \brief 未指定 model 时使用的默认模型。
     */
    pub fn default_model(self) -> &'static str {
        self.known_models()[0]
    }

    /**
     * \brief 前端可选的固定模型列表，首项即默认模型。
     */
    pub fn known_models(self) -> &'static [&'static str] {
        match self {
            ProviderKind::Google => &["gemini-2.5-flash-preview-04-17", "gemini-pro"],
            ProviderKind::OpenAi => &["gpt-4o", "gpt-4-turbo", "gpt-3.5-turbo"],
            ProviderKind::DeepSeek => &["deepseek-chat"],
        }
    }
}

/**
 * \brief 由单次请求参数解析出的 Provider 调用配置。
 */
#[derive(Debug, Clone)]
pub struct Resolved {
    /** \brief Provider 类型 */
    pub kind: ProviderKind,
    /** \brief API 基地址 */
    pub api_base: String,
    /** \brief API Key（可为空，原样透传） */
    pub api_key: String,
    /** \brief 模型名 */
    pub model: String,
}

impl Resolved {
    /**
     * \brief 从请求的可选覆盖项解析出完整配置。
     */
    pub fn from_request(
        provider: Option<&str>,
        model: Option<&str>,
        api_key: Option<&str>,
    ) -> Self {
        let kind = ProviderKind::from_name(provider.unwrap_or(""));
        let model = match model {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => kind.default_model().to_string(),
        };
        Resolved {
            kind,
            api_base: kind.api_base().to_string(),
            api_key: api_key.unwrap_or("").to_string(),
            model,
        }
    }
}

/**
 * \brief 以统一接口返回流式增量；按 Provider 类型分派到对应协议。
 */
pub async fn stream_chat<'a>(
    resolved: &'a Resolved,
    instructions: &'a str,
    messages: &'a [Message],
) -> Result<Pin<Box<dyn Stream<Item = Result<String>> + Send + 'a>>> {
    match resolved.kind {
        ProviderKind::OpenAi | ProviderKind::DeepSeek => {
            stream_openai(resolved, instructions, messages).await
        }
        ProviderKind::Google => stream_gemini(resolved, instructions, messages).await,
    }
}

async fn stream_openai<'a>(
    resolved: &'a Resolved,
    instructions: &'a str,
    messages: &'a [Message],
) -> Result<Pin<Box<dyn Stream<Item = Result<String>> + Send + 'a>>> {
    let url = format!(
        "{}/v1/chat/completions",
        resolved.api_base.trim_end_matches('/')
    );
    let client = reqwest::Client::builder().build()?;
    let body = openai_request_body(&resolved.model, instructions, messages);

    let resp = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", resolved.api_key))
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("request failed: {} -> {}", status, text));
    }

    let mut stream = resp.bytes_stream();
    let mut buf = Vec::<u8>::new();

    let out = try_stream! {
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.extend_from_slice(&chunk);
            loop {
                if let Some(pos) = find_double_newline(&buf) {
                    let block = buf.drain(..pos + 2).collect::<Vec<u8>>();
                    if let Some(line) = extract_data_line(&block) {
                        if line.trim() == "[DONE]" {
                            break;
                        }
                        if let Some(delta) = parse_openai_delta(&line) {
                            yield delta;
                        }
                    }
                } else {
                    break;
                }
            }
        }
        if !buf.is_empty() {
            if let Some(line) = extract_data_line(&buf) {
                if line.trim() != "[DONE]" {
                    if let Some(delta) = parse_openai_delta(&line) {
                        yield delta;
                    }
                }
            }
        }
    };

    Ok(Box::pin(out))
}

async fn stream_gemini<'a>(
    resolved: &'a Resolved,
    instructions: &'a str,
    messages: &'a [Message],
) -> Result<Pin<Box<dyn Stream<Item = Result<String>> + Send + 'a>>> {
    let url = gemini_endpoint(&resolved.api_base, &resolved.model);
    let client = reqwest::Client::builder().build()?;
    let body = gemini_request_body(instructions, messages);

    let resp = client
        .post(url)
        .query(&[("alt", "sse"), ("key", resolved.api_key.as_str())])
        .header(CONTENT_TYPE, "application/json")
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("gemini request failed: {} -> {}", status, text));
    }

    let mut stream = resp.bytes_stream();
    let mut buf = Vec::<u8>::new();

    let out = try_stream! {
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.extend_from_slice(&chunk);
            loop {
                if let Some(pos) = find_double_newline(&buf) {
                    let block = buf.drain(..pos + 2).collect::<Vec<u8>>();
                    if let Some(line) = extract_data_line(&block) {
                        if let Some(delta) = parse_gemini_delta(&line) {
                            yield delta;
                        }
                    }
                } else {
                    break;
                }
            }
        }
        if !buf.is_empty() {
            if let Some(line) = extract_data_line(&buf) {
                if let Some(delta) = parse_gemini_delta(&line) {
                    yield delta;
                }
            }
        }
    };

    Ok(Box::pin(out))
}

/**
 * \brief OpenAI 兼容协议的请求体；instructions 作为首条 system 消息。
 */
fn openai_request_body(model: &str, instructions: &str, messages: &[Message]) -> Value {
    let mut wire = Vec::with_capacity(messages.len() + 1);
    if !instructions.is_empty() {
        wire.push(json!({"role": "system", "content": instructions}));
    }
    for msg in messages {
        wire.push(json!({"role": msg.role.as_str(), "content": msg.content}));
    }
    json!({
        "model": model,
        "messages": wire,
        "stream": true
    })
}

/**
 * \brief Gemini 流式接口地址（alt=sse 与 key 以查询参数附加）。
 */
fn gemini_endpoint(api_base: &str, model: &str) -> String {
    let base = normalize_gemini_base(api_base);
    format!("{}/models/{}:streamGenerateContent", base, model)
}

/**
 * \brief Gemini 请求体；instructions 与历史中的 system 消息合并进 system_instruction。
 */
fn gemini_request_body(instructions: &str, messages: &[Message]) -> Value {
    let mut system_parts = Vec::new();
    if !instructions.is_empty() {
        system_parts.push(instructions.to_string());
    }
    let mut contents = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.clone()),
            Role::Assistant => contents.push(json!({
                "role": "model",
                "parts": [{"text": msg.content}]
            })),
            Role::User => contents.push(json!({
                "role": "user",
                "parts": [{"text": msg.content}]
            })),
        }
    }
    let mut body = json!({ "contents": contents });
    if !system_parts.is_empty() {
        body["system_instruction"] = json!({
            "parts": [{"text": system_parts.join("\n\n")}]
        });
    }
    body
}

pub(crate) fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn extract_data_line(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    for line in text.lines() {
        let line = line.trim_start();
        if line.starts_with("data:") {
            return Some(line[5..].trim().to_string());
        }
    }
    None
}

fn parse_openai_delta(line: &str) -> Option<String> {
    let v: Value = serde_json::from_str(line).ok()?;
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

fn parse_gemini_delta(line: &str) -> Option<String> {
    let v: Value = serde_json::from_str(line).ok()?;
    let parts = v
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_provider_names_resolve() {
        assert_eq!(ProviderKind::from_name("google"), ProviderKind::Google);
        assert_eq!(ProviderKind::from_name("openai"), ProviderKind::OpenAi);
        assert_eq!(ProviderKind::from_name("DeepSeek"), ProviderKind::DeepSeek);
    }

    #[test]
    fn unknown_provider_falls_back_to_google() {
        let anthropic = Resolved::from_request(Some("anthropic"), None, None);
        let google = Resolved::from_request(Some("google"), None, None);
        assert_eq!(anthropic.kind, google.kind);
        assert_eq!(anthropic.api_base, google.api_base);
        assert_eq!(anthropic.model, google.model);
    }

    #[test]
    fn default_models_per_provider() {
        for (name, model) in [
            ("google", "gemini-2.5-flash-preview-04-17"),
            ("openai", "gpt-4o"),
            ("deepseek", "deepseek-chat"),
        ] {
            let resolved = Resolved::from_request(Some(name), None, None);
            assert_eq!(resolved.model, model, "provider {}", name);
        }
    }

    #[test]
    fn explicit_model_overrides_default() {
        let resolved = Resolved::from_request(Some("openai"), Some("gpt-4-turbo"), Some("sk-x"));
        assert_eq!(resolved.model, "gpt-4-turbo");
        assert_eq!(resolved.api_key, "sk-x");
    }

    #[test]
    fn deepseek_resolves_to_its_own_base() {
        let resolved = Resolved::from_request(Some("deepseek"), None, None);
        assert_eq!(resolved.api_base, "https://api.deepseek.com");
        assert_eq!(resolved.model, "deepseek-chat");
    }

    #[test]
    fn gemini_endpoint_targets_stream_generate_content() {
        let resolved = Resolved::from_request(None, None, None);
        let url = gemini_endpoint(&resolved.api_base, &resolved.model);
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash-preview-04-17:streamGenerateContent"
        );
    }

    #[test]
    fn gemini_base_gets_version_suffix_when_missing() {
        assert_eq!(
            normalize_gemini_base("https://generativelanguage.googleapis.com/"),
            "https://generativelanguage.googleapis.com/v1beta"
        );
        assert_eq!(
            normalize_gemini_base("https://generativelanguage.googleapis.com/v1beta"),
            "https://generativelanguage.googleapis.com/v1beta"
        );
    }

    #[test]
    fn openai_body_prepends_instructions_as_system() {
        let messages = vec![Message::new(Role::User, "Hi")];
        let body = openai_request_body("gpt-4o", DEFAULT_INSTRUCTIONS, &messages);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], DEFAULT_INSTRUCTIONS);
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "Hi");
    }

    #[test]
    fn gemini_body_maps_assistant_to_model_role() {
        let messages = vec![
            Message::new(Role::User, "Hi"),
            Message::new(Role::Assistant, "Hello!"),
            Message::new(Role::System, "be terse"),
        ];
        let body = gemini_request_body(DEFAULT_INSTRUCTIONS, &messages);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        let sys = body["system_instruction"]["parts"][0]["text"].as_str().unwrap();
        assert!(sys.starts_with(DEFAULT_INSTRUCTIONS));
        assert!(sys.ends_with("be terse"));
    }

    #[test]
    fn sse_block_scanning_extracts_payload() {
        let block = b"event: message\ndata: {\"x\":1}\n\n";
        assert_eq!(find_double_newline(block), Some(block.len() - 2));
        assert_eq!(extract_data_line(block).as_deref(), Some("{\"x\":1}"));
    }

    #[test]
    fn openai_delta_parsing() {
        let line = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_openai_delta(line).as_deref(), Some("Hel"));
        assert_eq!(parse_openai_delta(r#"{"choices":[{"delta":{}}]}"#), None);
        assert_eq!(parse_openai_delta("not json"), None);
    }

    #[test]
    fn gemini_delta_parsing() {
        let line = r#"{"candidates":[{"content":{"parts":[{"text":"Hel"},{"text":"lo"}]}}]}"#;
        assert_eq!(parse_gemini_delta(line).as_deref(), Some("Hello"));
        assert_eq!(parse_gemini_delta(r#"{"candidates":[]}"#), None);
    }
}
