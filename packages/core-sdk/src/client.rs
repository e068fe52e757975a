use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use anyhow::{anyhow, Result};
use async_stream::try_stream;
use futures_util::Stream;
use tokio_util::sync::CancellationToken;

use crate::llm::find_double_newline;
use crate::models::ChatRequest;

/**
 * \brief 聊天订阅客户端：把请求体发往服务端并消费 SSE 增量。
 *
 * 同一客户端同时只保留一路订阅；发起新订阅会取消上一路。
 */
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    active: Mutex<Option<CancellationToken>>,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        ChatClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            active: Mutex::new(None),
        }
    }

    /**
     * \brief 发起一次聊天订阅：POST {base}/api/chat，返回文本增量流。
     *
     * 服务端的 error 事件以 Err 项浮出，错误文本原样保留。
     */
    pub async fn stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let token = CancellationToken::new();
        {
            let mut guard = self.active.lock().expect("lock active subscription");
            if let Some(prev) = guard.replace(token.clone()) {
                prev.cancel();
            }
        }

        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let resp = self.http.post(url).json(request).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("request failed: {} -> {}", status, text));
        }

        let mut bytes = resp.bytes_stream();
        let tk = token.clone();
        let inner = try_stream! {
            use futures_util::StreamExt;
            let mut decoder = SseDecoder::new();
            loop {
                let chunk = tokio::select! {
                    _ = tk.cancelled() => None,
                    chunk = bytes.next() => chunk,
                };
                let chunk = match chunk {
                    Some(chunk) => chunk?,
                    None => break,
                };
                for frame in decoder.push(&chunk) {
                    match frame {
                        SseFrame::Delta(text) => yield text,
                        SseFrame::Error(text) => Err(anyhow!("{}", text))?,
                    }
                }
            }
        };

        Ok(ChatStream {
            token,
            inner: Box::pin(inner),
        })
    }
}

/**
 * \brief 一路进行中的聊天订阅；被丢弃或显式取消时停止消费。
 */
pub struct ChatStream {
    token: CancellationToken,
    inner: Pin<Box<dyn Stream<Item = Result<String>> + Send>>,
}

impl ChatStream {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Stream for ChatStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/**
 * \brief 解出的单个 SSE 事件。
 */
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseFrame {
    /** \brief 无名事件：一段助手文本增量 */
    Delta(String),
    /** \brief error 事件：服务端转发的 Provider 失败文本 */
    Error(String),
}

/**
 * \brief 增量式 SSE 解码器：按空行切块，data 多行以换行拼接。
 */
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        SseDecoder { buf: Vec::new() }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = find_double_newline(&self.buf) {
            let block = self.buf.drain(..pos + 2).collect::<Vec<u8>>();
            if let Some(frame) = parse_block(&block) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn parse_block(block: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(block);
    let mut event_name: Option<String> = None;
    let mut data_lines: Vec<String> = Vec::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            // SSE 约定：冒号后至多剥掉一个空格，其余空白属于内容
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }
    if data_lines.is_empty() {
        // 纯注释块（keep-alive）或空块
        return None;
    }
    let data = data_lines.join("\n");
    match event_name.as_deref() {
        None | Some("message") => Some(SseFrame::Delta(data)),
        Some("error") => Some(SseFrame::Error(data)),
        Some(_) => None,
    }
}
