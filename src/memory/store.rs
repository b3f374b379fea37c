//! 线程存储抽象层
//!
//! 定义统一的线程 / 消息历史接口，支持内存和 SQLite 两种实现。
//! 线程在首次交互时创建，只通过追加消息变更，不会与其它线程合并。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::AgentError;
use crate::memory::sqlite::SqliteDb;
use crate::memory::{Message, Role, Todo};

/// 一个持久的对话 / 运行身份
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub thread_id: String,
    pub title: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub todos: Vec<Todo>,
}

/// 线程列表项（不含消息）
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub thread_id: String,
    pub title: String,
    pub model: String,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

/// 线程存储接口
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 获取或创建线程（已存在时原样返回）
    async fn create_thread(&self, thread_id: &str, title: &str, model: &str)
        -> Result<Thread, AgentError>;

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, AgentError>;

    /// 追加消息；线程不存在时返回 Validation 错误
    async fn append_message(&self, thread_id: &str, message: Message) -> Result<(), AgentError>;

    /// 按最近更新排序
    async fn list_threads(&self, limit: usize) -> Result<Vec<ThreadSummary>, AgentError>;

    /// 返回是否确有删除
    async fn delete_thread(&self, thread_id: &str) -> Result<bool, AgentError>;

    async fn set_todos(&self, thread_id: &str, todos: Vec<Todo>) -> Result<(), AgentError>;
}

fn missing_thread(thread_id: &str) -> AgentError {
    AgentError::validation(format!("thread '{thread_id}' does not exist"))
}

/// 内存实现
#[derive(Default)]
pub struct MemoryStateStore {
    threads: RwLock<HashMap<String, Thread>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_thread(
        &self,
        thread_id: &str,
        title: &str,
        model: &str,
    ) -> Result<Thread, AgentError> {
        let mut threads = self.threads.write().await;
        let thread = threads.entry(thread_id.to_string()).or_insert_with(|| {
            let now = Utc::now();
            Thread {
                thread_id: thread_id.to_string(),
                title: title.to_string(),
                model: model.to_string(),
                created_at: now,
                updated_at: now,
                messages: Vec::new(),
                todos: Vec::new(),
            }
        });
        Ok(thread.clone())
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, AgentError> {
        Ok(self.threads.read().await.get(thread_id).cloned())
    }

    async fn append_message(&self, thread_id: &str, message: Message) -> Result<(), AgentError> {
        let mut threads = self.threads.write().await;
        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| missing_thread(thread_id))?;
        thread.updated_at = Utc::now();
        thread.messages.push(message);
        Ok(())
    }

    async fn list_threads(&self, limit: usize) -> Result<Vec<ThreadSummary>, AgentError> {
        let threads = self.threads.read().await;
        let mut list: Vec<ThreadSummary> = threads
            .values()
            .map(|t| ThreadSummary {
                thread_id: t.thread_id.clone(),
                title: t.title.clone(),
                model: t.model.clone(),
                updated_at: t.updated_at,
                message_count: t.messages.len(),
            })
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        list.truncate(limit);
        Ok(list)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool, AgentError> {
        Ok(self.threads.write().await.remove(thread_id).is_some())
    }

    async fn set_todos(&self, thread_id: &str, todos: Vec<Todo>) -> Result<(), AgentError> {
        let mut threads = self.threads.write().await;
        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| missing_thread(thread_id))?;
        thread.todos = todos;
        thread.updated_at = Utc::now();
        Ok(())
    }
}

/// SQLite 实现
#[derive(Clone)]
pub struct SqliteStateStore {
    db: SqliteDb,
}

impl SqliteStateStore {
    pub fn new(db: SqliteDb) -> Self {
        Self { db }
    }

    fn parse_time(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }

    fn load_thread(&self, thread_id: &str) -> Result<Option<Thread>, AgentError> {
        let conn = self.db.lock()?;
        let head = conn
            .query_row(
                "SELECT title, model, todos, created_at, updated_at FROM threads WHERE thread_id = ?1",
                params![thread_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((title, model, todos, created_at, updated_at)) = head else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, role, content, tool_calls, tool_call_id, timestamp
             FROM messages WHERE thread_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![thread_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut messages = Vec::new();
        for row in rows {
            let (id, role, content, tool_calls, tool_call_id, timestamp) = row?;
            messages.push(Message {
                id,
                role: Role::parse(&role),
                content,
                tool_calls: serde_json::from_str(&tool_calls)?,
                tool_call_id,
                timestamp: Self::parse_time(&timestamp),
            });
        }

        Ok(Some(Thread {
            thread_id: thread_id.to_string(),
            title,
            model,
            created_at: Self::parse_time(&created_at),
            updated_at: Self::parse_time(&updated_at),
            messages,
            todos: serde_json::from_str(&todos)?,
        }))
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn create_thread(
        &self,
        thread_id: &str,
        title: &str,
        model: &str,
    ) -> Result<Thread, AgentError> {
        {
            let conn = self.db.lock()?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT OR IGNORE INTO threads (thread_id, title, model, todos, created_at, updated_at)
                 VALUES (?1, ?2, ?3, '[]', ?4, ?4)",
                params![thread_id, title, model, now],
            )?;
        }
        self.load_thread(thread_id)?
            .ok_or_else(|| AgentError::persistence("thread vanished after insert"))
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, AgentError> {
        self.load_thread(thread_id)
    }

    async fn append_message(&self, thread_id: &str, message: Message) -> Result<(), AgentError> {
        let conn = self.db.lock()?;
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE threads SET updated_at = ?1 WHERE thread_id = ?2",
            params![now, thread_id],
        )?;
        if updated == 0 {
            return Err(missing_thread(thread_id));
        }
        conn.execute(
            "INSERT INTO messages (thread_id, id, role, content, tool_calls, tool_call_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                thread_id,
                message.id,
                message.role.as_str(),
                message.content,
                serde_json::to_string(&message.tool_calls)?,
                message.tool_call_id,
                message.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn list_threads(&self, limit: usize) -> Result<Vec<ThreadSummary>, AgentError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT t.thread_id, t.title, t.model, t.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.thread_id = t.thread_id)
             FROM threads t ORDER BY t.updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut list = Vec::new();
        for row in rows {
            let (thread_id, title, model, updated_at, count) = row?;
            list.push(ThreadSummary {
                thread_id,
                title,
                model,
                updated_at: Self::parse_time(&updated_at),
                message_count: count as usize,
            });
        }
        Ok(list)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool, AgentError> {
        let conn = self.db.lock()?;
        conn.execute("DELETE FROM messages WHERE thread_id = ?1", params![thread_id])?;
        let removed = conn.execute("DELETE FROM threads WHERE thread_id = ?1", params![thread_id])?;
        Ok(removed > 0)
    }

    async fn set_todos(&self, thread_id: &str, todos: Vec<Todo>) -> Result<(), AgentError> {
        let conn = self.db.lock()?;
        let updated = conn.execute(
            "UPDATE threads SET todos = ?1, updated_at = ?2 WHERE thread_id = ?3",
            params![serde_json::to_string(&todos)?, Utc::now().to_rfc3339(), thread_id],
        )?;
        if updated == 0 {
            return Err(missing_thread(thread_id));
        }
        Ok(())
    }
}
