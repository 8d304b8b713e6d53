use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::{
    db,
    models::{ChatRecord, ChatWithMessages, Role, StoredMessage},
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /** \brief 会话不存在，或属于其他用户。 */
    #[error("chat {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/**
 * \brief 归属判定：会话无主或调用者匿名时放行，否则要求两者一致。
 * \details 保留原有的宽松授权语义：知道 ID 的匿名调用者可以访问任意会话。
 */
pub fn owner_allows(owner: Option<i64>, caller: Option<i64>) -> bool {
    match (owner, caller) {
        (Some(owner), Some(caller)) => owner == caller,
        _ => true,
    }
}

/**
 * \brief 会话存储句柄，可在请求之间克隆共享。
 */
#[derive(Clone)]
pub struct ConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    /**
     * \brief 打开数据库文件并执行迁移。
     */
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = db::open_db(path)?;
        db::migrate(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = db::open_in_memory()?;
        db::migrate(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /**
     * \brief 在阻塞线程池上执行同步数据库操作，期间独占连接。
     * \details `retry_on_locked` 的退避睡眠不会占用异步工作线程。
     */
    async fn with_conn<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || op(&conn))
            .await
            .map_err(|e| StoreError::Database(anyhow::anyhow!("store task failed: {}", e)))?
    }

    pub async fn create_chat(&self, owner: Option<i64>, model_id: &str) -> StoreResult<ChatRecord> {
        let model_id = model_id.to_string();
        self.with_conn(move |conn| Ok(db::create_chat(conn, owner, &model_id)?))
            .await
    }

    pub async fn get_chat(&self, chat_id: i64, caller: Option<i64>) -> StoreResult<ChatWithMessages> {
        self.with_conn(move |conn| {
            let chat = visible_chat(conn, chat_id, caller)?;
            let messages = db::load_messages(conn, chat_id)?;
            Ok(ChatWithMessages { chat, messages })
        })
        .await
    }

    /**
     * \brief 列出用户的会话，每个会话仅携带首条消息。
     */
    pub async fn list_user_chats(&self, user_id: i64) -> StoreResult<Vec<ChatWithMessages>> {
        self.with_conn(move |conn| {
            let chats = db::list_chats_for_user(conn, user_id)?;
            let mut out = Vec::with_capacity(chats.len());
            for chat in chats {
                let messages = db::first_message(conn, chat.id)?.into_iter().collect();
                out.push(ChatWithMessages { chat, messages });
            }
            Ok(out)
        })
        .await
    }

    pub async fn update_title(
        &self,
        chat_id: i64,
        title: &str,
        caller: Option<i64>,
    ) -> StoreResult<ChatRecord> {
        let title = title.to_string();
        self.with_conn(move |conn| {
            visible_chat(conn, chat_id, caller)?;
            db::update_chat_title(conn, chat_id, &title)?;
            db::get_chat(conn, chat_id)?.ok_or(StoreError::NotFound(chat_id))
        })
        .await
    }

    pub async fn delete_chat(&self, chat_id: i64, caller: Option<i64>) -> StoreResult<()> {
        self.with_conn(move |conn| {
            visible_chat(conn, chat_id, caller)?;
            Ok(db::delete_chat(conn, chat_id)?)
        })
        .await
    }

    pub async fn list_messages(
        &self,
        chat_id: i64,
        caller: Option<i64>,
    ) -> StoreResult<Vec<StoredMessage>> {
        self.with_conn(move |conn| {
            visible_chat(conn, chat_id, caller)?;
            Ok(db::load_messages(conn, chat_id)?)
        })
        .await
    }

    pub async fn append_message(
        &self,
        chat_id: i64,
        role: Role,
        content: &str,
        reasoning: Option<&str>,
        caller: Option<i64>,
    ) -> StoreResult<StoredMessage> {
        let content = content.to_string();
        let reasoning = reasoning.map(str::to_string);
        self.with_conn(move |conn| {
            visible_chat(conn, chat_id, caller)?;
            Ok(db::insert_message(
                conn,
                chat_id,
                role,
                &content,
                reasoning.as_deref(),
            )?)
        })
        .await
    }
}

fn visible_chat(conn: &Connection, chat_id: i64, caller: Option<i64>) -> StoreResult<ChatRecord> {
    match db::get_chat(conn, chat_id)? {
        Some(chat) if owner_allows(chat.user_id, caller) => Ok(chat),
        _ => Err(StoreError::NotFound(chat_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_rules() {
        assert!(owner_allows(None, None));
        assert!(owner_allows(None, Some(3)));
        assert!(owner_allows(Some(3), None));
        assert!(owner_allows(Some(3), Some(3)));
        assert!(!owner_allows(Some(3), Some(4)));
    }

    #[tokio::test]
    async fn foreign_owner_sees_not_found() {
        let store = ConversationStore::in_memory().expect("store");
        let chat = store.create_chat(Some(1), "deepseek-r1").await.expect("create");

        let err = store.list_messages(chat.id, Some(2)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == chat.id));
        let err = store
            .append_message(chat.id, Role::User, "hi", None, Some(2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        store
            .append_message(chat.id, Role::User, "hi", None, Some(1))
            .await
            .expect("owner append");
    }

    #[tokio::test]
    async fn anonymous_chat_open_to_everyone() {
        let store = ConversationStore::in_memory().expect("store");
        let chat = store.create_chat(None, "deepseek-r1").await.expect("create");
        let renamed = store
            .update_title(chat.id, "库存盘点", Some(9))
            .await
            .expect("rename");
        assert_eq!(renamed.title, "库存盘点");
        store.delete_chat(chat.id, Some(5)).await.expect("delete");
        assert!(matches!(
            store.get_chat(chat.id, None).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_user_chats_carries_first_message_preview() {
        let store = ConversationStore::in_memory().expect("store");
        let chat = store.create_chat(Some(1), "deepseek-r1").await.expect("create");
        store
            .append_message(chat.id, Role::User, "first", None, Some(1))
            .await
            .expect("append 1");
        store
            .append_message(chat.id, Role::Assistant, "second", None, Some(1))
            .await
            .expect("append 2");
        store.create_chat(Some(1), "deepseek-r1").await.expect("create empty");

        let chats = store.list_user_chats(1).await.expect("list");
        assert_eq!(chats.len(), 2);
        let with_preview = chats.iter().find(|c| c.chat.id == chat.id).expect("chat");
        assert_eq!(with_preview.messages.len(), 1);
        assert_eq!(with_preview.messages[0].content, "first");
        assert_eq!(with_preview.chat.title, "first");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_get_distinct_orders() {
        let store = ConversationStore::in_memory().expect("store");
        let chat = store.create_chat(None, "deepseek-r1").await.expect("create");

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .append_message(chat.id, Role::User, &format!("m{}", i), None, None)
                    .await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("append");
        }

        let orders: Vec<i64> = store
            .list_messages(chat.id, None)
            .await
            .expect("list")
            .iter()
            .map(|m| m.order)
            .collect();
        assert_eq!(orders, (0..16).collect::<Vec<i64>>());
    }
}
