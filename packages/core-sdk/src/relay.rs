//! 流式对话中继：把上游增量转发给客户端，同时累积完整回复并回写会话。

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    config::AppConfig,
    error::ApiError,
    llm::{DeltaStream, ModelGateway},
    models::{Completion, Message, ModelDescriptor, RelayEvent, Role},
    store::{ConversationStore, StoreResult},
};

/** \brief 中继通道容量；上游读取与客户端写入交替推进，不整体缓冲。 */
const RELAY_CHANNEL_CAPACITY: usize = 16;

/**
 * \brief 一次中继调用的输入。
 */
#[derive(Debug, Clone, Default)]
pub struct RelayRequest {
    /** \brief 用户消息；空串或仅含空白字符均视为缺失，以 400 拒绝。 */
    pub message: String,
    pub model: Option<String>,
    pub chat_id: Option<i64>,
    pub use_history: bool,
}

impl RelayRequest {
    /** \brief 仅当同时开启历史且给出会话 ID 时才读写会话。 */
    fn history_chat(&self) -> Option<i64> {
        if self.use_history {
            self.chat_id
        } else {
            None
        }
    }
}

/**
 * \brief 解析后的单轮请求：模型、上游消息列表与回写目标。
 */
#[derive(Debug, Clone)]
struct PreparedTurn {
    model: ModelDescriptor,
    messages: Vec<Message>,
    user_message: String,
    persist_to: Option<i64>,
    caller: Option<i64>,
}

#[derive(Clone)]
pub struct Relay {
    config: Arc<AppConfig>,
    store: ConversationStore,
    gateway: Arc<dyn ModelGateway>,
}

impl Relay {
    pub fn new(
        config: Arc<AppConfig>,
        store: ConversationStore,
        gateway: Arc<dyn ModelGateway>,
    ) -> Self {
        Self {
            config,
            store,
            gateway,
        }
    }

    /**
     * \brief 流式中继。
     * \details 校验、历史加载与上游建连都在返回前完成，失败即以 `ApiError` 返回，
     *          此时尚未发送任何流式响应头。成功后返回事件接收端，后台任务负责转发与回写。
     */
    pub async fn stream(
        &self,
        req: RelayRequest,
        caller: Option<i64>,
    ) -> Result<mpsc::Receiver<RelayEvent>, ApiError> {
        let turn = self.prepare(&req, caller).await?;
        let upstream = self
            .gateway
            .stream_chat(&turn.model, &turn.messages)
            .await
            .map_err(|e| {
                error!(model = %turn.model.id, chat_id = ?turn.persist_to, "upstream open failed: {}", e);
                ApiError::Upstream(e.to_string())
            })?;

        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let store = self.store.clone();
        tokio::spawn(pump(upstream, tx, turn, store));
        Ok(rx)
    }

    /**
     * \brief 非流式中继：等待完整回复后一次性返回。
     */
    pub async fn complete(
        &self,
        req: RelayRequest,
        caller: Option<i64>,
    ) -> Result<Completion, ApiError> {
        let turn = self.prepare(&req, caller).await?;
        let completion = self
            .gateway
            .chat_once(&turn.model, &turn.messages)
            .await
            .map_err(|e| {
                error!(model = %turn.model.id, chat_id = ?turn.persist_to, "upstream call failed: {}", e);
                ApiError::Upstream(e.to_string())
            })?;

        let reasoning = if turn.model.has_reasoning {
            completion.reasoning.filter(|r| !r.is_empty())
        } else {
            None
        };
        let completion = Completion {
            content: completion.content,
            reasoning,
        };
        persist_if_requested(&self.store, &turn, &completion).await;
        Ok(completion)
    }

    async fn prepare(&self, req: &RelayRequest, caller: Option<i64>) -> Result<PreparedTurn, ApiError> {
        if req.message.trim().is_empty() {
            return Err(ApiError::Validation("消息不能为空".to_string()));
        }

        let model = self.config.resolve_model(req.model.as_deref()).clone();
        if let Some(requested) = req.model.as_deref() {
            if requested != model.id {
                debug!(requested, fallback = %model.id, "unknown model id, using default");
            }
        }

        let mut messages = vec![Message::user(req.message.clone())];
        if let Some(chat_id) = req.history_chat() {
            match self.store.list_messages(chat_id, caller).await {
                Ok(history) if !history.is_empty() => {
                    messages = history.into_iter().map(Message::from).collect();
                    messages.push(Message::user(req.message.clone()));
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(chat_id, model = %model.id, "history load failed, continuing single-turn: {}", err);
                }
            }
        }

        Ok(PreparedTurn {
            model,
            messages,
            user_message: req.message.clone(),
            persist_to: req.history_chat(),
            caller,
        })
    }
}

/**
 * \brief 上游读取与客户端写入一一交替；客户端断开时立即停止并释放上游连接。
 */
async fn pump(
    mut upstream: DeltaStream,
    tx: mpsc::Sender<RelayEvent>,
    turn: PreparedTurn,
    store: ConversationStore,
) {
    let mut content = String::new();
    let mut reasoning = String::new();

    loop {
        let item = tokio::select! {
            _ = tx.closed() => {
                info!(chat_id = ?turn.persist_to, model = %turn.model.id, "client disconnected, dropping upstream");
                return;
            }
            item = upstream.next() => item,
        };

        let delta = match item {
            None => break,
            Some(Ok(delta)) => delta,
            Some(Err(err)) => {
                error!(chat_id = ?turn.persist_to, model = %turn.model.id, "upstream stream error: {}", err);
                let _ = tx.send(RelayEvent::Error(err.to_string())).await;
                return;
            }
        };

        if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
            content.push_str(&text);
            if tx.send(RelayEvent::Content(text)).await.is_err() {
                info!(chat_id = ?turn.persist_to, "client disconnected mid-stream");
                return;
            }
        }
        if turn.model.has_reasoning {
            if let Some(text) = delta.reasoning.filter(|t| !t.is_empty()) {
                reasoning.push_str(&text);
                if tx.send(RelayEvent::Reasoning(text)).await.is_err() {
                    info!(chat_id = ?turn.persist_to, "client disconnected mid-stream");
                    return;
                }
            }
        }
    }

    let completion = Completion {
        content,
        reasoning: (!reasoning.is_empty()).then_some(reasoning),
    };
    persist_if_requested(&store, &turn, &completion).await;
    let _ = tx.send(RelayEvent::Done).await;
}

/**
 * \brief 回写用户消息与助手回复；失败只记录日志，不影响已返回给客户端的结果。
 */
async fn persist_if_requested(store: &ConversationStore, turn: &PreparedTurn, completion: &Completion) {
    let Some(chat_id) = turn.persist_to else {
        return;
    };
    if completion.content.is_empty() {
        return;
    }
    match persist_turn(store, chat_id, turn, completion).await {
        Ok(()) => debug!(chat_id, model = %turn.model.id, "turn persisted"),
        Err(err) => error!(chat_id, model = %turn.model.id, "persist turn failed: {}", err),
    }
}

async fn persist_turn(
    store: &ConversationStore,
    chat_id: i64,
    turn: &PreparedTurn,
    completion: &Completion,
) -> StoreResult<()> {
    store
        .append_message(chat_id, Role::User, &turn.user_message, None, turn.caller)
        .await?;
    store
        .append_message(
            chat_id,
            Role::Assistant,
            &completion.content,
            completion.reasoning.as_deref(),
            turn.caller,
        )
        .await?;
    Ok(())
}
