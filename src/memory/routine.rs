//! 肌肉记忆：按目标指纹缓存已验证成功的动作序列（Routine）
//!
//! 存储在 SQLite `routines` 表，重启后仍可命中。upsert 为单条 INSERT .. ON CONFLICT 语句，
//! 并发写同一指纹时成功次数不会丢失。

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::StepTemplate;

/// 已缓存的例程：steps 为参数化模板（见 fingerprint::templatize）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    pub fingerprint: String,
    pub sample_goal: String,
    pub steps: Vec<StepTemplate>,
    pub success_count: u32,
    pub created_at: i64,
    pub last_used_at: i64,
}

/// 肌肉记忆接口
pub trait MuscleMemory: Send + Sync {
    /// 按指纹查找；命中时刷新 last_used_at
    fn lookup(&self, fingerprint: &str) -> Result<Option<Routine>, AgentError>;

    /// 成功运行后写入：首次插入 success_count = 1，之后递增并以最新步骤覆盖
    fn upsert(&self, fingerprint: &str, sample_goal: &str, steps: &[StepTemplate]) -> Result<(), AgentError>;

    /// 使例程失效；返回是否确实删除了记录
    fn invalidate(&self, fingerprint: &str) -> Result<bool, AgentError>;

    /// 按最近使用时间倒序列出
    fn list(&self) -> Result<Vec<Routine>, AgentError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS routines (
    fingerprint   TEXT PRIMARY KEY,
    sample_goal   TEXT NOT NULL,
    steps         TEXT NOT NULL,
    success_count INTEGER NOT NULL DEFAULT 1,
    created_at    INTEGER NOT NULL,
    last_used_at  INTEGER NOT NULL
);
";

/// SQLite 实现
pub struct SqliteRoutineStore {
    conn: Mutex<Connection>,
}

impl SqliteRoutineStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| AgentError::Storage(e.to_string()))?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, AgentError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AgentError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type RoutineRow = (String, String, String, i64, i64, i64);

fn row_to_routine(row: RoutineRow) -> Result<Routine, serde_json::Error> {
    let (fingerprint, sample_goal, steps, success_count, created_at, last_used_at) = row;
    Ok(Routine {
        fingerprint,
        sample_goal,
        steps: serde_json::from_str(&steps)?,
        success_count: success_count.max(0) as u32,
        created_at,
        last_used_at,
    })
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoutineRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

impl MuscleMemory for SqliteRoutineStore {
    fn lookup(&self, fingerprint: &str) -> Result<Option<Routine>, AgentError> {
        let conn = self.conn();
        let now = chrono::Utc::now().timestamp_millis();
        let touched = conn.execute(
            "UPDATE routines SET last_used_at = ?1 WHERE fingerprint = ?2",
            params![now, fingerprint],
        )?;
        if touched == 0 {
            return Ok(None);
        }
        let row = conn
            .query_row(
                "SELECT fingerprint, sample_goal, steps, success_count, created_at, last_used_at
                 FROM routines WHERE fingerprint = ?1",
                params![fingerprint],
                read_row,
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };
        match row_to_routine(row) {
            Ok(routine) => Ok(Some(routine)),
            Err(e) => {
                // 无法解析的步骤视为未命中并清理，下次由规划器重新生成
                tracing::warn!(fingerprint = %fingerprint, error = %e, "dropping unreadable routine");
                conn.execute("DELETE FROM routines WHERE fingerprint = ?1", params![fingerprint])?;
                Ok(None)
            }
        }
    }

    fn upsert(&self, fingerprint: &str, sample_goal: &str, steps: &[StepTemplate]) -> Result<(), AgentError> {
        let steps_json = serde_json::to_string(steps)?;
        let now = chrono::Utc::now().timestamp_millis();
        self.conn().execute(
            "INSERT INTO routines (fingerprint, sample_goal, steps, success_count, created_at, last_used_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?4)
             ON CONFLICT(fingerprint) DO UPDATE SET
                sample_goal = excluded.sample_goal,
                steps = excluded.steps,
                success_count = routines.success_count + 1,
                last_used_at = excluded.last_used_at",
            params![fingerprint, sample_goal, steps_json, now],
        )?;
        tracing::debug!(fingerprint = %fingerprint, steps = steps.len(), "routine stored");
        Ok(())
    }

    fn invalidate(&self, fingerprint: &str) -> Result<bool, AgentError> {
        let removed = self
            .conn()
            .execute("DELETE FROM routines WHERE fingerprint = ?1", params![fingerprint])?;
        if removed > 0 {
            tracing::info!(fingerprint = %fingerprint, "routine invalidated");
        }
        Ok(removed > 0)
    }

    fn list(&self) -> Result<Vec<Routine>, AgentError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT fingerprint, sample_goal, steps, success_count, created_at, last_used_at
             FROM routines ORDER BY last_used_at DESC",
        )?;
        let rows = stmt.query_map([], read_row)?;
        let mut out = Vec::new();
        for row in rows {
            match row_to_routine(row?) {
                Ok(r) => out.push(r),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable routine"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionCall;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn steps() -> Vec<StepTemplate> {
        vec![StepTemplate::from(ActionCall::OpenApp {
            app: "calculator".into(),
        })]
    }

    #[test]
    fn test_upsert_then_lookup_increments() {
        let store = SqliteRoutineStore::in_memory().unwrap();
        assert!(store.lookup("calculator open").unwrap().is_none());

        store.upsert("calculator open", "open calculator", &steps()).unwrap();
        store.upsert("calculator open", "open the calculator", &steps()).unwrap();
        let r = store.lookup("calculator open").unwrap().unwrap();
        assert_eq!(r.success_count, 2);
        assert_eq!(r.sample_goal, "open the calculator");
        assert_eq!(r.steps, steps());
    }

    #[test]
    fn test_invalidate() {
        let store = SqliteRoutineStore::in_memory().unwrap();
        store.upsert("k", "g", &steps()).unwrap();
        assert!(store.invalidate("k").unwrap());
        assert!(!store.invalidate("k").unwrap());
        assert!(store.lookup("k").unwrap().is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("orbit.db");
        {
            let store = SqliteRoutineStore::open(&path).unwrap();
            store.upsert("k", "g", &steps()).unwrap();
        }
        let store = SqliteRoutineStore::open(&path).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_upserts_count_all() {
        let store = Arc::new(SqliteRoutineStore::in_memory().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.upsert("k", "g", &steps()).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.lookup("k").unwrap().unwrap().success_count, 8);
    }
}
