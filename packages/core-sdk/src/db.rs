use anyhow::{bail, Result};
use rusqlite::{
    params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
    Connection, ErrorCode, OptionalExtension, Row,
};
use std::{thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::models::{ChatRecord, Role, StoredMessage};

/** \brief 新会话的默认标题。 */
pub const DEFAULT_CHAT_TITLE: &str = "新对话";

const TITLE_MAX_CHARS: usize = 20;

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: anyhow::Error| FromSqlError::Other(e.into()))
    }
}

/**
 * \brief 打开数据库文件并开启外键约束。
 */
pub fn open_db(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

/**
 * \brief 打开内存数据库，供测试与一次性 CLI 会话使用。
 */
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建会话与消息表。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS chats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL DEFAULT '新对话',
            user_id INTEGER,
            model_id TEXT NOT NULL DEFAULT 'deepseek-r1',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chat_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
            content TEXT NOT NULL,
            reasoning TEXT,
            "order" INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_chat_messages_order
            ON chat_messages (chat_id, "order");
        CREATE INDEX IF NOT EXISTS idx_chats_user ON chats (user_id);
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 当前 UTC 时间的 RFC 3339 文本。
 */
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

/**
 * \brief 由首条用户消息生成标题：超过 20 个字符时截断并追加省略号。
 */
pub fn derive_title(content: &str) -> String {
    if content.chars().count() > TITLE_MAX_CHARS {
        let head: String = content.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}...", head)
    } else {
        content.to_string()
    }
}

fn map_chat(row: &Row<'_>) -> rusqlite::Result<ChatRecord> {
    Ok(ChatRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        user_id: row.get(2)?,
        model_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        reasoning: row.get(4)?,
        order: row.get(5)?,
        created_at: row.get(6)?,
    })
}

const CHAT_COLUMNS: &str = "id, title, user_id, model_id, created_at, updated_at";
const MESSAGE_COLUMNS: &str = r#"id, chat_id, role, content, reasoning, "order", created_at"#;

/**
 * \brief 创建会话。
 */
pub fn create_chat(conn: &Connection, user_id: Option<i64>, model_id: &str) -> Result<ChatRecord> {
    let now = now_rfc3339();
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO chats (title, user_id, model_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![DEFAULT_CHAT_TITLE, user_id, model_id, now],
        )
    })?;
    Ok(ChatRecord {
        id: conn.last_insert_rowid(),
        title: DEFAULT_CHAT_TITLE.to_string(),
        user_id,
        model_id: model_id.to_string(),
        created_at: now.clone(),
        updated_at: now,
    })
}

/**
 * \brief 按 ID 获取会话。
 */
pub fn get_chat(conn: &Connection, chat_id: i64) -> Result<Option<ChatRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM chats WHERE id=?1", CHAT_COLUMNS),
        params![chat_id],
        map_chat,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 列出用户的会话，最新的在前。
 */
pub fn list_chats_for_user(conn: &Connection, user_id: i64) -> Result<Vec<ChatRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM chats WHERE user_id=?1 ORDER BY created_at DESC, id DESC",
        CHAT_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![user_id], map_chat)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 更新会话标题。
 */
pub fn update_chat_title(conn: &Connection, chat_id: i64, title: &str) -> Result<()> {
    let now = now_rfc3339();
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE chats SET title=?1, updated_at=?2 WHERE id=?3",
            params![title, now, chat_id],
        )
    })?;
    if rows == 0 {
        bail!("chat id {} not found", chat_id);
    }
    Ok(())
}

/**
 * \brief 删除指定会话及其消息。
 */
pub fn delete_chat(conn: &Connection, chat_id: i64) -> Result<()> {
    retry_on_locked(|| {
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM chat_messages WHERE chat_id=?1",
            params![chat_id],
        )?;
        tx.execute("DELETE FROM chats WHERE id=?1", params![chat_id])?;
        tx.commit()
    })?;
    Ok(())
}

/**
 * \brief 读取会话的全部消息，按 `order` 升序。
 */
pub fn load_messages(conn: &Connection, chat_id: i64) -> Result<Vec<StoredMessage>> {
    let mut stmt = conn.prepare(&format!(
        r#"SELECT {} FROM chat_messages WHERE chat_id=?1 ORDER BY "order" ASC"#,
        MESSAGE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![chat_id], map_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 读取会话首条消息，用作列表预览。
 */
pub fn first_message(conn: &Connection, chat_id: i64) -> Result<Option<StoredMessage>> {
    conn.query_row(
        &format!(
            r#"SELECT {} FROM chat_messages WHERE chat_id=?1 ORDER BY "order" ASC LIMIT 1"#,
            MESSAGE_COLUMNS
        ),
        params![chat_id],
        map_message,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 追加一条消息。
 * \details 顺序号取当前最大值加一（空会话为 0），删除后不复用；
 *          顺序号为 0 的用户消息会同时改写会话标题。
 */
pub fn insert_message(
    conn: &Connection,
    chat_id: i64,
    role: Role,
    content: &str,
    reasoning: Option<&str>,
) -> Result<StoredMessage> {
    let now = now_rfc3339();
    retry_on_locked(|| {
        let tx = conn.unchecked_transaction()?;
        let order: i64 = tx.query_row(
            r#"SELECT COALESCE(MAX("order") + 1, 0) FROM chat_messages WHERE chat_id=?1"#,
            params![chat_id],
            |row| row.get(0),
        )?;
        tx.execute(
            r#"INSERT INTO chat_messages (chat_id, role, content, reasoning, "order", created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![chat_id, role, content, reasoning, order, now],
        )?;
        let id = tx.last_insert_rowid();
        if order == 0 && role == Role::User {
            tx.execute(
                "UPDATE chats SET title=?1, updated_at=?2 WHERE id=?3",
                params![derive_title(content), now, chat_id],
            )?;
        } else {
            tx.execute(
                "UPDATE chats SET updated_at=?1 WHERE id=?2",
                params![now, chat_id],
            )?;
        }
        tx.commit()?;
        Ok(StoredMessage {
            id,
            chat_id,
            role,
            content: content.to_string(),
            reasoning: reasoning.map(str::to_string),
            order,
            created_at: now.clone(),
        })
    })
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并线性退避，最多尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        let conn = open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    #[test]
    fn test_create_chat_defaults() {
        let conn = mem_conn();
        let chat = create_chat(&conn, None, "deepseek-r1").expect("create chat");
        assert_eq!(chat.title, DEFAULT_CHAT_TITLE);
        assert_eq!(chat.user_id, None);

        let loaded = get_chat(&conn, chat.id).expect("get chat").expect("exists");
        assert_eq!(loaded, chat);
    }

    #[test]
    fn test_orders_follow_insertion() {
        let conn = mem_conn();
        let chat = create_chat(&conn, Some(7), "deepseek-r1").expect("create chat");
        let a = insert_message(&conn, chat.id, Role::User, "hi", None).expect("insert 1");
        let b = insert_message(&conn, chat.id, Role::Assistant, "hello", Some("think"))
            .expect("insert 2");
        let c = insert_message(&conn, chat.id, Role::User, "again", None).expect("insert 3");
        assert_eq!((a.order, b.order, c.order), (0, 1, 2));

        let msgs = load_messages(&conn, chat.id).expect("load msgs");
        let contents: Vec<_> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "hello", "again"]);
        assert_eq!(msgs[1].reasoning.as_deref(), Some("think"));
        assert_eq!(msgs[1].role, Role::Assistant);
    }

    #[test]
    fn test_first_user_message_sets_title() {
        let conn = mem_conn();
        let chat = create_chat(&conn, None, "deepseek-r1").expect("create chat");
        insert_message(&conn, chat.id, Role::User, "short", None).expect("insert");
        assert_eq!(get_chat(&conn, chat.id).unwrap().unwrap().title, "short");

        insert_message(&conn, chat.id, Role::User, "second message", None).expect("insert");
        assert_eq!(get_chat(&conn, chat.id).unwrap().unwrap().title, "short");
    }

    #[test]
    fn test_first_assistant_message_keeps_title() {
        let conn = mem_conn();
        let chat = create_chat(&conn, None, "deepseek-r1").expect("create chat");
        insert_message(&conn, chat.id, Role::Assistant, "greeting", None).expect("insert");
        assert_eq!(
            get_chat(&conn, chat.id).unwrap().unwrap().title,
            DEFAULT_CHAT_TITLE
        );
    }

    #[test]
    fn test_derive_title_truncates_by_chars() {
        assert_eq!(derive_title("hello"), "hello");
        assert_eq!(derive_title(&"a".repeat(20)), "a".repeat(20));
        assert_eq!(
            derive_title("abcdefghijklmnopqrstuvwxyz"),
            "abcdefghijklmnopqrst..."
        );
        let cjk = "仓库管理系统需要一个能够流式输出的聊天中继服务";
        assert_eq!(derive_title(cjk), format!("{}...", cjk.chars().take(20).collect::<String>()));
    }

    #[test]
    fn test_orders_not_reused_after_deletion() {
        let conn = mem_conn();
        let chat = create_chat(&conn, None, "deepseek-r1").expect("create chat");
        insert_message(&conn, chat.id, Role::User, "one", None).expect("insert 1");
        let second = insert_message(&conn, chat.id, Role::Assistant, "two", None).expect("insert 2");
        conn.execute("DELETE FROM chat_messages WHERE \"order\"=0", [])
            .expect("delete first");
        let third = insert_message(&conn, chat.id, Role::User, "three", None).expect("insert 3");
        assert!(third.order > second.order);
    }

    #[test]
    fn test_delete_chat_cascades() {
        let conn = mem_conn();
        let chat = create_chat(&conn, None, "deepseek-r1").expect("create chat");
        insert_message(&conn, chat.id, Role::User, "hi", None).expect("insert");
        delete_chat(&conn, chat.id).expect("delete chat");
        assert!(get_chat(&conn, chat.id).unwrap().is_none());
        assert!(load_messages(&conn, chat.id).unwrap().is_empty());
    }

    #[test]
    fn test_delete_chat_keeps_other_chats() {
        let conn = mem_conn();
        let doomed = create_chat(&conn, None, "deepseek-r1").expect("create doomed");
        let kept = create_chat(&conn, None, "deepseek-r1").expect("create kept");
        insert_message(&conn, doomed.id, Role::User, "a", None).expect("insert a");
        insert_message(&conn, kept.id, Role::User, "b", None).expect("insert b");
        delete_chat(&conn, doomed.id).expect("delete chat");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM chat_messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(load_messages(&conn, kept.id).unwrap()[0].content, "b");
    }

    #[test]
    fn test_delete_chat_rolls_back_when_chat_delete_fails() {
        let conn = mem_conn();
        let chat = create_chat(&conn, None, "deepseek-r1").expect("create chat");
        insert_message(&conn, chat.id, Role::User, "hi", None).expect("insert");
        conn.execute_batch(
            "CREATE TRIGGER block_chat_delete BEFORE DELETE ON chats
             BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
        )
        .unwrap();
        assert!(delete_chat(&conn, chat.id).is_err());
        assert_eq!(load_messages(&conn, chat.id).unwrap().len(), 1);
    }

    #[test]
    fn test_insert_into_missing_chat_fails() {
        let conn = mem_conn();
        let result = insert_message(&conn, 404, Role::User, "hi", None);
        assert!(result.is_err());
    }

    #[test]
    fn test_list_chats_for_user_scopes_and_orders() {
        let conn = mem_conn();
        let older = create_chat(&conn, Some(1), "deepseek-r1").expect("create 1");
        let _other = create_chat(&conn, Some(2), "deepseek-r1").expect("create 2");
        let newer = create_chat(&conn, Some(1), "deepseek-r1").expect("create 3");
        let chats = list_chats_for_user(&conn, 1).expect("list");
        let ids: Vec<_> = chats.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[test]
    fn test_update_missing_chat_title_fails() {
        let conn = mem_conn();
        assert!(update_chat_title(&conn, 99, "title").is_err());
    }
}
