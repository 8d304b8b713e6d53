use std::{
    collections::HashMap,
    pin::Pin,
    sync::RwLock,
};

use anyhow::{anyhow, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::Stream;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use tracing::debug;

use crate::models::{Completion, Delta, Message, ModelDescriptor};

/** \brief 上游增量流。 */
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<Delta>> + Send>>;

/**
 * \brief 模型网关：同一模型表上的流式与非流式调用。
 */
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /**
     * \brief 打开流式请求；返回前已确认上游接受了请求。
     */
    async fn stream_chat(&self, model: &ModelDescriptor, messages: &[Message])
        -> Result<DeltaStream>;

    /**
     * \brief 非流式调用，返回完整回复。
     */
    async fn chat_once(&self, model: &ModelDescriptor, messages: &[Message]) -> Result<Completion>;
}

/**
 * \brief 按上游基地址缓存的 HTTP 客户端池，首次使用时惰性构建。
 */
#[derive(Debug, Default)]
pub struct ClientPool {
    clients: RwLock<HashMap<String, reqwest::Client>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, base_url: &str) -> Result<reqwest::Client> {
        let key = base_url.trim_end_matches('/');
        {
            let guard = self
                .clients
                .read()
                .map_err(|_| anyhow!("client pool lock poisoned"))?;
            if let Some(client) = guard.get(key) {
                return Ok(client.clone());
            }
        }
        let mut guard = self
            .clients
            .write()
            .map_err(|_| anyhow!("client pool lock poisoned"))?;
        if let Some(client) = guard.get(key) {
            return Ok(client.clone());
        }
        debug!(base = key, "building upstream client");
        let client = reqwest::Client::builder().build()?;
        guard.insert(key.to_string(), client.clone());
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/**
 * \brief OpenAI 兼容协议的 HTTP 网关。
 */
pub struct HttpGateway {
    api_key: String,
    pool: ClientPool,
}

impl HttpGateway {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            pool: ClientPool::new(),
        }
    }

    async fn post_completions(
        &self,
        model: &ModelDescriptor,
        messages: &[Message],
        stream: bool,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));
        let client = self.pool.get(&model.base_url)?;
        let body = json!({
            "model": model.id,
            "messages": messages,
            "stream": stream
        });

        let resp = client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("request failed: {} -> {}", status, text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ModelGateway for HttpGateway {
    async fn stream_chat(
        &self,
        model: &ModelDescriptor,
        messages: &[Message],
    ) -> Result<DeltaStream> {
        let resp = self.post_completions(model, messages, true).await?;
        let mut stream = resp.bytes_stream();
        let mut buf = Vec::<u8>::new();

        let out = try_stream! {
            use futures_util::StreamExt;
            let mut done = false;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                buf.extend_from_slice(&chunk);
                while let Some((pos, sep)) = find_block_end(&buf) {
                    let block = buf.drain(..pos + sep).collect::<Vec<u8>>();
                    match parse_frame(&block) {
                        Frame::Delta(delta) => yield delta,
                        Frame::Done => {
                            done = true;
                            break;
                        }
                        Frame::Error(message) => {
                            Err::<(), _>(anyhow!("upstream stream error: {}", message))?;
                        }
                        Frame::Skip => {}
                    }
                }
                if done {
                    break;
                }
            }
            if !done && !buf.is_empty() {
                match parse_frame(&buf) {
                    Frame::Delta(delta) => yield delta,
                    Frame::Error(message) => {
                        Err::<(), _>(anyhow!("upstream stream error: {}", message))?;
                    }
                    Frame::Done | Frame::Skip => {}
                }
            }
        };

        Ok(Box::pin(out))
    }

    async fn chat_once(&self, model: &ModelDescriptor, messages: &[Message]) -> Result<Completion> {
        let resp = self.post_completions(model, messages, false).await?;
        let v: Value = resp.json().await?;
        Ok(extract_completion(&v))
    }
}

/**
 * \brief 定位一个 SSE 块的结束位置，返回 (起点, 分隔符长度)。
 */
fn find_block_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/**
 * \brief 上游 SSE 块的解析结果。
 */
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Delta(Delta),
    Done,
    /** \brief `event: error` 块，或带顶层 `error` 字段的数据。 */
    Error(String),
    Skip,
}

fn parse_frame(block: &[u8]) -> Frame {
    let text = String::from_utf8_lossy(block);
    let mut event = None;
    let mut data = None;
    for line in text.lines() {
        let line = line.trim_start();
        if let Some(name) = line.strip_prefix("event:") {
            event = Some(name.trim().to_string());
        } else if let Some(payload) = line.strip_prefix("data:") {
            if data.is_none() {
                data = Some(payload.trim().to_string());
            }
        }
    }

    let is_error_event = event.as_deref() == Some("error");
    let Some(data) = data else {
        return if is_error_event {
            Frame::Error("upstream reported an error".to_string())
        } else {
            Frame::Skip
        };
    };
    if data == "[DONE]" {
        return Frame::Done;
    }

    let value: Option<Value> = serde_json::from_str(&data).ok();
    if let Some(err) = value.as_ref().and_then(|v| v.get("error")).filter(|e| !e.is_null()) {
        return Frame::Error(error_message(err));
    }
    if is_error_event {
        return Frame::Error(value.as_ref().map(error_message).unwrap_or(data));
    }
    match value.as_ref().and_then(parse_delta) {
        Some(delta) => Frame::Delta(delta),
        None => Frame::Skip,
    }
}

/** \brief 兼容 `{"message": ...}`、字符串与其他 JSON 形态的错误体。 */
fn error_message(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string())
            .unwrap_or_else(|| err.to_string()),
        other => other.to_string(),
    }
}

fn parse_delta(v: &Value) -> Option<Delta> {
    let delta = v.get("choices")?.get(0)?.get("delta")?;
    let pick = |key: &str| {
        delta
            .get(key)
            .and_then(|c| c.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };
    let out = Delta {
        content: pick("content"),
        reasoning: pick("reasoning_content"),
    };
    if out.content.is_none() && out.reasoning.is_none() {
        None
    } else {
        Some(out)
    }
}

fn extract_completion(v: &Value) -> Completion {
    let message = v
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"));
    let field = |key: &str| {
        message
            .and_then(|m| m.get(key))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
    };
    Completion {
        content: field("content").unwrap_or_default(),
        reasoning: field("reasoning_content").filter(|s| !s.is_empty()),
    }
}

/**
 * \brief 测试用的脚本化网关：记录收到的消息并按脚本回放增量。
 */

/**
 * \brief 测试用的本地上游：在 127.0.0.1 随机端口提供 `/v1/chat/completions`。
 */
