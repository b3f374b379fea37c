//! 检查点与写日志
//!
//! 后端只提供原语（插入、读取最新、列表、批量写、读写日志、删写日志），
//! 协议层约束全部在 `CheckpointSaver` 中实现：
//! - put 幂等且每个线程全序：相同检查点重放为空操作，步号倒退被拒绝
//! - put_writes 在写入列表为空时不调用后端（后端批量写收到 0 条视为错误）
//! - 检查点提交后删除该步的写日志行，稳态下写日志为空
//! - 同一线程的写入由每线程异步锁串行化；锁表只保留弱引用，无人持有的条目随后被清掉

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::AgentError;
use crate::graph::{ApprovalRequest, ExecutionState};
use crate::memory::sqlite::SqliteDb;

/// 运行状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// 运行中；next_node 为下一个要执行的节点
    Running,
    /// 在中断点暂停，等待审批决策
    AwaitingApproval,
    Completed,
}

/// 某一步之后的状态快照
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub thread_id: String,
    pub step_id: u64,
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub next_node: Option<String>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<ApprovalRequest>,
}

/// 写日志条目：某一步内某个任务已完成但尚未并入检查点的写入
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWrite {
    pub task_id: String,
    pub channel: String,
    pub value: serde_json::Value,
}

/// 持久化原语
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    /// 插入（或覆盖同一 (thread, step) 的）检查点
    async fn insert(&self, checkpoint: &Checkpoint) -> Result<(), AgentError>;

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError>;

    /// 按步号倒序
    async fn list(&self, thread_id: &str, limit: usize) -> Result<Vec<Checkpoint>, AgentError>;

    /// 批量写入写日志；0 条属于调用方错误
    async fn bulk_write(
        &self,
        thread_id: &str,
        step_id: u64,
        writes: &[PendingWrite],
    ) -> Result<(), AgentError>;

    async fn pending_writes(&self, thread_id: &str, step_id: u64)
        -> Result<Vec<PendingWrite>, AgentError>;

    async fn clear_writes(&self, thread_id: &str, step_id: u64) -> Result<(), AgentError>;
}

fn empty_bulk_write() -> AgentError {
    AgentError::persistence("bulk write called with zero items")
}

/// 内存后端
#[derive(Default)]
pub struct MemoryCheckpointBackend {
    checkpoints: RwLock<HashMap<String, BTreeMap<u64, Checkpoint>>>,
    writes: RwLock<HashMap<(String, u64), BTreeMap<String, PendingWrite>>>,
}

impl MemoryCheckpointBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointBackend for MemoryCheckpointBackend {
    async fn insert(&self, checkpoint: &Checkpoint) -> Result<(), AgentError> {
        self.checkpoints
            .write()
            .await
            .entry(checkpoint.thread_id.clone())
            .or_default()
            .insert(checkpoint.step_id, checkpoint.clone());
        Ok(())
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        Ok(self
            .checkpoints
            .read()
            .await
            .get(thread_id)
            .and_then(|steps| steps.values().next_back().cloned()))
    }

    async fn list(&self, thread_id: &str, limit: usize) -> Result<Vec<Checkpoint>, AgentError> {
        Ok(self
            .checkpoints
            .read()
            .await
            .get(thread_id)
            .map(|steps| steps.values().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn bulk_write(
        &self,
        thread_id: &str,
        step_id: u64,
        writes: &[PendingWrite],
    ) -> Result<(), AgentError> {
        if writes.is_empty() {
            return Err(empty_bulk_write());
        }
        let mut guard = self.writes.write().await;
        let slot = guard.entry((thread_id.to_string(), step_id)).or_default();
        for w in writes {
            slot.insert(w.task_id.clone(), w.clone());
        }
        Ok(())
    }

    async fn pending_writes(
        &self,
        thread_id: &str,
        step_id: u64,
    ) -> Result<Vec<PendingWrite>, AgentError> {
        Ok(self
            .writes
            .read()
            .await
            .get(&(thread_id.to_string(), step_id))
            .map(|slot| slot.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_writes(&self, thread_id: &str, step_id: u64) -> Result<(), AgentError> {
        self.writes
            .write()
            .await
            .remove(&(thread_id.to_string(), step_id));
        Ok(())
    }
}

/// SQLite 后端：checkpoints / checkpoint_writes 两张表
pub struct SqliteCheckpointBackend {
    db: SqliteDb,
}

impl SqliteCheckpointBackend {
    pub fn new(db: SqliteDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CheckpointBackend for SqliteCheckpointBackend {
    async fn insert(&self, checkpoint: &Checkpoint) -> Result<(), AgentError> {
        let body = serde_json::to_string(checkpoint)?;
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO checkpoints (thread_id, step_id, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                checkpoint.thread_id,
                checkpoint.step_id as i64,
                body,
                checkpoint.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        let conn = self.db.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM checkpoints WHERE thread_id = ?1 ORDER BY step_id DESC LIMIT 1",
                params![thread_id],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(b) => Ok(Some(serde_json::from_str(&b)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, thread_id: &str, limit: usize) -> Result<Vec<Checkpoint>, AgentError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT body FROM checkpoints WHERE thread_id = ?1 ORDER BY step_id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![thread_id, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for body in rows {
            out.push(serde_json::from_str(&body?)?);
        }
        Ok(out)
    }

    async fn bulk_write(
        &self,
        thread_id: &str,
        step_id: u64,
        writes: &[PendingWrite],
    ) -> Result<(), AgentError> {
        if writes.is_empty() {
            return Err(empty_bulk_write());
        }
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        for w in writes {
            tx.execute(
                "INSERT OR REPLACE INTO checkpoint_writes (thread_id, step_id, task_id, channel, value)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    thread_id,
                    step_id as i64,
                    w.task_id,
                    w.channel,
                    serde_json::to_string(&w.value)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn pending_writes(
        &self,
        thread_id: &str,
        step_id: u64,
    ) -> Result<Vec<PendingWrite>, AgentError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, channel, value FROM checkpoint_writes
             WHERE thread_id = ?1 AND step_id = ?2 ORDER BY task_id",
        )?;
        let rows = stmt.query_map(params![thread_id, step_id as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (task_id, channel, value) = row?;
            out.push(PendingWrite {
                task_id,
                channel,
                value: serde_json::from_str(&value)?,
            });
        }
        Ok(out)
    }

    async fn clear_writes(&self, thread_id: &str, step_id: u64) -> Result<(), AgentError> {
        let conn = self.db.lock()?;
        conn.execute(
            "DELETE FROM checkpoint_writes WHERE thread_id = ?1 AND step_id = ?2",
            params![thread_id, step_id as i64],
        )?;
        Ok(())
    }
}

/// 检查点协议层
pub struct CheckpointSaver {
    backend: Arc<dyn CheckpointBackend>,
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl CheckpointSaver {
    pub fn new(backend: Arc<dyn CheckpointBackend>) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCheckpointBackend::new()))
    }

    fn thread_lock(&self, thread_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, AgentError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| AgentError::persistence("checkpoint lock table poisoned"))?;
        locks.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = locks.get(thread_id).and_then(Weak::upgrade) {
            return Ok(lock);
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(thread_id.to_string(), Arc::downgrade(&lock));
        Ok(lock)
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// 提交检查点并清理该步的写日志
    pub async fn put(&self, checkpoint: Checkpoint) -> Result<(), AgentError> {
        let lock = self.thread_lock(&checkpoint.thread_id)?;
        let _guard = lock.lock().await;

        if let Some(latest) = self.backend.latest(&checkpoint.thread_id).await? {
            if latest.step_id > checkpoint.step_id {
                return Err(AgentError::persistence(format!(
                    "checkpoint step {} for thread '{}' is older than committed step {}",
                    checkpoint.step_id, checkpoint.thread_id, latest.step_id
                )));
            }
            if latest.step_id == checkpoint.step_id {
                if latest == checkpoint {
                    tracing::debug!(
                        thread_id = %checkpoint.thread_id,
                        step = checkpoint.step_id,
                        "identical checkpoint replayed, skipping"
                    );
                    return Ok(());
                }
                return Err(AgentError::persistence(format!(
                    "conflicting checkpoint for thread '{}' at step {}",
                    checkpoint.thread_id, checkpoint.step_id
                )));
            }
        }

        self.backend.insert(&checkpoint).await?;
        self.backend
            .clear_writes(&checkpoint.thread_id, checkpoint.step_id)
            .await?;
        tracing::debug!(
            thread_id = %checkpoint.thread_id,
            step = checkpoint.step_id,
            status = ?checkpoint.status,
            "checkpoint committed"
        );
        Ok(())
    }

    /// 记录某步内已完成任务的写入；空列表直接返回，不触碰后端
    pub async fn put_writes(
        &self,
        thread_id: &str,
        step_id: u64,
        writes: Vec<PendingWrite>,
    ) -> Result<(), AgentError> {
        if writes.is_empty() {
            return Ok(());
        }
        let lock = self.thread_lock(thread_id)?;
        let _guard = lock.lock().await;
        self.backend.bulk_write(thread_id, step_id, &writes).await
    }

    pub async fn pending_writes(
        &self,
        thread_id: &str,
        step_id: u64,
    ) -> Result<Vec<PendingWrite>, AgentError> {
        self.backend.pending_writes(thread_id, step_id).await
    }

    /// 最新检查点；新线程返回 None
    pub async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        self.backend.latest(thread_id).await
    }

    /// 历史检查点，最新在前
    pub async fn list(&self, thread_id: &str, limit: usize) -> Result<Vec<Checkpoint>, AgentError> {
        self.backend.list(thread_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::memory::Message;

    /// 统计后端调用次数
    #[derive(Default)]
    struct CountingBackend {
        inner: MemoryCheckpointBackend,
        inserts: AtomicUsize,
        bulk_writes: AtomicUsize,
    }

    #[async_trait]
    impl CheckpointBackend for CountingBackend {
        async fn insert(&self, checkpoint: &Checkpoint) -> Result<(), AgentError> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            self.inner.insert(checkpoint).await
        }

        async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
            self.inner.latest(thread_id).await
        }

        async fn list(&self, thread_id: &str, limit: usize) -> Result<Vec<Checkpoint>, AgentError> {
            self.inner.list(thread_id, limit).await
        }

        async fn bulk_write(
            &self,
            thread_id: &str,
            step_id: u64,
            writes: &[PendingWrite],
        ) -> Result<(), AgentError> {
            self.bulk_writes.fetch_add(1, Ordering::SeqCst);
            self.inner.bulk_write(thread_id, step_id, writes).await
        }

        async fn pending_writes(
            &self,
            thread_id: &str,
            step_id: u64,
        ) -> Result<Vec<PendingWrite>, AgentError> {
            self.inner.pending_writes(thread_id, step_id).await
        }

        async fn clear_writes(&self, thread_id: &str, step_id: u64) -> Result<(), AgentError> {
            self.inner.clear_writes(thread_id, step_id).await
        }
    }

    fn checkpoint(thread: &str, step: u64) -> Checkpoint {
        Checkpoint {
            thread_id: thread.to_string(),
            step_id: step,
            state: ExecutionState::with_input(Message::user("check disk usage")),
            created_at: Utc::now(),
            next_node: Some("generate".to_string()),
            status: RunStatus::Running,
            pending_approval: None,
        }
    }

    fn write(task: &str) -> PendingWrite {
        PendingWrite {
            task_id: task.to_string(),
            channel: "tool_results".to_string(),
            value: serde_json::json!({"output": "ok"}),
        }
    }

    #[tokio::test]
    async fn test_empty_writes_never_reach_backend() {
        let backend = Arc::new(CountingBackend::default());
        let saver = CheckpointSaver::new(backend.clone());
        saver.put_writes("t1", 1, Vec::new()).await.unwrap();
        assert_eq!(backend.bulk_writes.load(Ordering::SeqCst), 0);

        saver.put_writes("t1", 1, vec![write("c1")]).await.unwrap();
        assert_eq!(backend.bulk_writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backend_rejects_zero_item_bulk_write() {
        let backend = MemoryCheckpointBackend::new();
        assert!(backend.bulk_write("t1", 1, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let backend = Arc::new(CountingBackend::default());
        let saver = CheckpointSaver::new(backend.clone());
        let cp = checkpoint("t1", 1);
        saver.put(cp.clone()).await.unwrap();
        saver.put(cp.clone()).await.unwrap();

        assert_eq!(backend.inserts.load(Ordering::SeqCst), 1);
        assert_eq!(saver.get("t1").await.unwrap(), Some(cp));
        assert_eq!(saver.list("t1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_table_does_not_grow_with_keys() {
        let saver = CheckpointSaver::in_memory();
        for i in 0..100 {
            let key = format!("t1/researcher:{i}");
            saver.put(checkpoint(&key, 1)).await.unwrap();
            saver.put_writes(&key, 2, vec![write("c1")]).await.unwrap();
        }
        assert!(saver.lock_entries() <= 1);

        // 仍在持有的锁被复用，不会为同一键再建一把
        let held = saver.thread_lock("t1").unwrap();
        let again = saver.thread_lock("t1").unwrap();
        assert!(Arc::ptr_eq(&held, &again));
    }

    #[tokio::test]
    async fn test_put_rejects_older_step() {
        let saver = CheckpointSaver::in_memory();
        saver.put(checkpoint("t1", 3)).await.unwrap();
        assert!(saver.put(checkpoint("t1", 2)).await.is_err());
        assert_eq!(saver.get("t1").await.unwrap().unwrap().step_id, 3);
    }

    #[tokio::test]
    async fn test_put_folds_write_log() {
        let saver = CheckpointSaver::in_memory();
        saver.put_writes("t1", 1, vec![write("c1"), write("c2")]).await.unwrap();
        assert_eq!(saver.pending_writes("t1", 1).await.unwrap().len(), 2);
        saver.put(checkpoint("t1", 1)).await.unwrap();
        assert!(saver.pending_writes("t1", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_newest_first_sqlite() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = SqliteDb::open(dir.path().join("hive.db")).unwrap();
        let saver = CheckpointSaver::new(Arc::new(SqliteCheckpointBackend::new(db)));
        for step in 1..=3 {
            saver.put(checkpoint("t1", step)).await.unwrap();
        }
        saver.put(checkpoint("t2", 1)).await.unwrap();

        let steps: Vec<u64> = saver
            .list("t1", 10)
            .await
            .unwrap()
            .iter()
            .map(|c| c.step_id)
            .collect();
        assert_eq!(steps, vec![3, 2, 1]);
        assert_eq!(saver.get("t2").await.unwrap().unwrap().step_id, 1);
        assert!(saver.get("missing").await.unwrap().is_none());

        saver.put_writes("t1", 4, vec![write("c1")]).await.unwrap();
        let pending = saver.pending_writes("t1", 4).await.unwrap();
        assert_eq!(pending, vec![write("c1")]);
    }
}
