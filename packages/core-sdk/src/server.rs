use std::{convert::Infallible, sync::Arc};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, Method},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    auth::{OptionalUser, RequiredUser},
    config::AppConfig,
    db,
    error::{ApiError, RelayRejection},
    llm::ModelGateway,
    models::Role,
    relay::{Relay, RelayRequest},
    store::ConversationStore,
};

/**
 * \brief 路由共享状态。
 */
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: ConversationStore,
    pub relay: Relay,
}

impl AppState {
    pub fn new(config: AppConfig, store: ConversationStore, gateway: Arc<dyn ModelGateway>) -> Self {
        let config = Arc::new(config);
        let relay = Relay::new(config.clone(), store.clone(), gateway);
        Self {
            config,
            store,
            relay,
        }
    }
}

/**
 * \brief 构建全部 HTTP 路由。
 */
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/api/status", get(status))
        .route("/chat", post(complete_chat))
        .route("/chat/models", get(list_models))
        .route("/chat/stream", get(stream_get).post(stream_post))
        .route("/chat/conversation", post(create_conversation))
        .route("/chat/conversations", get(list_conversations))
        .route(
            "/chat/conversation/{id}",
            get(get_conversation)
                .put(update_conversation)
                .delete(delete_conversation),
        )
        .route(
            "/chat/conversation/{id}/messages",
            get(get_conversation_messages),
        )
        .route(
            "/chat/conversation/{id}/message",
            post(add_conversation_message),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/**
 * \brief 启动 HTTP 服务。
 */
pub async fn run(state: AppState) -> Result<()> {
    let addr = state.config.addr.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn success<T: Serialize>(data: T, message: &str) -> Json<Value> {
    Json(json!({
        "success": true,
        "code": 200,
        "message": message,
        "data": data,
    }))
}

/**
 * \brief 宽松解析 JSON 请求体：空体视为默认值。
 */
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::Validation(format!("请求体格式错误: {}", e)))
}

async fn status() -> Json<Value> {
    success(
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": db::now_rfc3339(),
        }),
        "API 服务运行正常",
    )
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ModelInfoDto {
    id: String,
    name: String,
    has_reasoning: bool,
}

async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let models: Vec<ModelInfoDto> = state
        .config
        .models
        .iter()
        .map(|m| ModelInfoDto {
            id: m.id.clone(),
            name: m.name.clone(),
            has_reasoning: m.has_reasoning,
        })
        .collect();
    success(models, "获取模型列表成功")
}

#[derive(Deserialize, Debug, Default)]
struct StreamQuery {
    message: Option<String>,
    model: Option<String>,
    #[serde(rename = "chatId")]
    chat_id: Option<String>,
    #[serde(rename = "useHistory")]
    use_history: Option<String>,
}

/**
 * \brief POST 请求体；`chatId` 兼容数字与数字字符串，`useHistory` 仅接受布尔 true。
 */
#[derive(Deserialize, Debug, Default)]
struct RelayBody {
    message: Option<String>,
    model: Option<String>,
    #[serde(rename = "chatId")]
    chat_id: Option<Value>,
    #[serde(rename = "useHistory")]
    use_history: Option<Value>,
}

fn parse_chat_id(raw: Option<&str>) -> Result<Option<i64>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ApiError::Validation(format!("无效的对话 ID: {}", s))),
    }
}

impl TryFrom<StreamQuery> for RelayRequest {
    type Error = ApiError;

    fn try_from(q: StreamQuery) -> Result<Self, Self::Error> {
        Ok(RelayRequest {
            message: q.message.unwrap_or_default(),
            model: q.model,
            chat_id: parse_chat_id(q.chat_id.as_deref())?,
            use_history: q.use_history.as_deref() == Some("true"),
        })
    }
}

impl TryFrom<RelayBody> for RelayRequest {
    type Error = ApiError;

    fn try_from(body: RelayBody) -> Result<Self, Self::Error> {
        let chat_id = match body.chat_id {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(
                n.as_i64()
                    .ok_or_else(|| ApiError::Validation(format!("无效的对话 ID: {}", n)))?,
            ),
            Some(Value::String(s)) => parse_chat_id(Some(&s))?,
            Some(other) => return Err(ApiError::Validation(format!("无效的对话 ID: {}", other))),
        };
        Ok(RelayRequest {
            message: body.message.unwrap_or_default(),
            model: body.model,
            chat_id,
            use_history: body.use_history == Some(Value::Bool(true)),
        })
    }
}

/**
 * \brief 流式聊天：GET /chat/stream?message=...&model=...&chatId=...&useHistory=true
 */
async fn stream_get(
    State(state): State<AppState>,
    user: OptionalUser,
    Query(q): Query<StreamQuery>,
) -> Response {
    match RelayRequest::try_from(q) {
        Ok(req) => relay_sse(&state, req, user).await,
        Err(err) => RelayRejection(err).into_response(),
    }
}

/**
 * \brief 流式聊天：POST /chat/stream，参数同 GET，置于 JSON 请求体。
 */
async fn stream_post(State(state): State<AppState>, user: OptionalUser, body: Bytes) -> Response {
    match parse_body::<RelayBody>(&body).and_then(RelayRequest::try_from) {
        Ok(req) => relay_sse(&state, req, user).await,
        Err(err) => RelayRejection(err).into_response(),
    }
}

async fn relay_sse(state: &AppState, req: RelayRequest, user: OptionalUser) -> Response {
    match state.relay.stream(req, user.id()).await {
        Ok(rx) => {
            let events = ReceiverStream::new(rx)
                .map(|event| Ok::<_, Infallible>(Event::default().data(event.to_sse_data())));
            Sse::new(events)
                .keep_alive(KeepAlive::new())
                .into_response()
        }
        Err(err) => RelayRejection(err).into_response(),
    }
}

/**
 * \brief 非流式聊天：POST /chat
 */
async fn complete_chat(
    State(state): State<AppState>,
    user: OptionalUser,
    body: Bytes,
) -> Result<Json<Value>, RelayRejection> {
    let req = parse_body::<RelayBody>(&body).and_then(RelayRequest::try_from)?;
    let completion = state.relay.complete(req, user.id()).await?;
    Ok(Json(json!({
        "success": true,
        "code": 200,
        "content": completion.content,
        "reasoning": completion.reasoning,
    })))
}

#[derive(Deserialize, Debug, Default)]
struct CreateChatRequest {
    #[serde(rename = "modelId")]
    model_id: Option<String>,
}

/**
 * \brief 创建会话；未知模型 ID 归一为默认模型。
 */
async fn create_conversation(
    State(state): State<AppState>,
    user: OptionalUser,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload: CreateChatRequest = parse_body(&body)?;
    let model = state.config.resolve_model(payload.model_id.as_deref());
    let chat = state.store.create_chat(user.id(), &model.id).await?;
    info!(chat_id = chat.id, user_id = ?user.id(), model = %chat.model_id, "chat created");
    Ok(success(chat, "对话创建成功"))
}

async fn list_conversations(
    State(state): State<AppState>,
    RequiredUser(user): RequiredUser,
) -> Result<Json<Value>, ApiError> {
    let chats = state.store.list_user_chats(user.id).await?;
    Ok(success(chats, "获取对话列表成功"))
}

async fn get_conversation(
    State(state): State<AppState>,
    user: OptionalUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let chat = state.store.get_chat(id, user.id()).await?;
    Ok(success(chat, "获取对话成功"))
}

#[derive(Deserialize, Debug, Default)]
struct UpdateTitleRequest {
    title: Option<String>,
}

async fn update_conversation(
    State(state): State<AppState>,
    user: OptionalUser,
    Path(id): Path<i64>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload: UpdateTitleRequest = parse_body(&body)?;
    let title = payload
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Validation("标题不能为空".to_string()))?;
    let chat = state.store.update_title(id, title, user.id()).await?;
    Ok(success(chat, "对话标题更新成功"))
}

async fn delete_conversation(
    State(state): State<AppState>,
    user: OptionalUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    state.store.delete_chat(id, user.id()).await?;
    info!(chat_id = id, user_id = ?user.id(), "chat deleted");
    Ok(success(Value::Null, "对话删除成功"))
}

async fn get_conversation_messages(
    State(state): State<AppState>,
    user: OptionalUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let messages = state.store.list_messages(id, user.id()).await?;
    Ok(success(messages, "获取对话消息成功"))
}

#[derive(Deserialize, Debug, Default)]
struct AddMessageRequest {
    role: Option<String>,
    content: Option<String>,
    reasoning: Option<String>,
}

async fn add_conversation_message(
    State(state): State<AppState>,
    user: OptionalUser,
    Path(id): Path<i64>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload: AddMessageRequest = parse_body(&body)?;
    let (role, content) = match (payload.role.as_deref(), payload.content.as_deref()) {
        (Some(role), Some(content)) if !role.is_empty() && !content.is_empty() => (role, content),
        _ => return Err(ApiError::Validation("角色和内容不能为空".to_string())),
    };
    let role: Role = role
        .parse()
        .map_err(|e: anyhow::Error| ApiError::Validation(e.to_string()))?;
    let message = state
        .store
        .append_message(id, role, content, payload.reasoning.as_deref(), user.id())
        .await?;
    Ok(success(message, "消息添加成功"))
}
