//! 定时任务持久化（SQLite `scheduled_jobs` 表）
//!
//! load 时单行解析失败只跳过并记日志，不影响其余任务。

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::core::{AgentError, SessionId};
use crate::scheduler::{JobStatus, ScheduledJob, Trigger};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS scheduled_jobs (
    id            TEXT PRIMARY KEY,
    owner         TEXT NOT NULL,
    trigger       TEXT NOT NULL,
    goal          TEXT NOT NULL,
    status        TEXT NOT NULL,
    next_fire_at  INTEGER NOT NULL,
    created_at    INTEGER NOT NULL,
    last_fired_at INTEGER
);
";

pub struct JobStore {
    conn: Mutex<Connection>,
}

type JobRow = (String, String, String, String, String, i64, i64, Option<i64>);

fn decode(row: JobRow) -> Result<ScheduledJob, AgentError> {
    let (id, owner, trigger, goal, status, next_fire_at, created_at, last_fired_at) = row;
    let trigger: Trigger = serde_json::from_str(&trigger)
        .map_err(|e| AgentError::SchedulePersistence(format!("job {id}: bad trigger: {e}")))?;
    trigger
        .validate()
        .map_err(|e| AgentError::SchedulePersistence(format!("job {id}: {e}")))?;
    let status = JobStatus::parse(&status)
        .ok_or_else(|| AgentError::SchedulePersistence(format!("job {id}: bad status {status:?}")))?;
    Ok(ScheduledJob {
        id,
        owner: SessionId(owner),
        trigger,
        goal,
        status,
        next_fire_at,
        created_at,
        last_fired_at,
    })
}

impl JobStore {
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

    /// 插入或整体覆盖一条任务
    pub fn save(&self, job: &ScheduledJob) -> Result<(), AgentError> {
        let trigger = serde_json::to_string(&job.trigger)?;
        self.conn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .execute(
                "INSERT OR REPLACE INTO scheduled_jobs
                 (id, owner, trigger, goal, status, next_fire_at, created_at, last_fired_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    job.id,
                    job.owner.as_str(),
                    trigger,
                    job.goal,
                    job.status.as_str(),
                    job.next_fire_at,
                    job.created_at,
                    job.last_fired_at,
                ],
            )
            .map_err(|e| AgentError::SchedulePersistence(e.to_string()))?;
        Ok(())
    }

    /// 读取全部任务；损坏的行被跳过
    pub fn load(&self) -> Result<Vec<ScheduledJob>, AgentError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, owner, trigger, goal, status, next_fire_at, created_at, last_fired_at
             FROM scheduled_jobs",
        )?;
        let rows = stmt.query_map([], |row| -> rusqlite::Result<JobRow> {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        })?;

        let mut jobs = Vec::new();
        for row in rows {
            let decoded = row
                .map_err(|e| AgentError::SchedulePersistence(e.to_string()))
                .and_then(decode);
            match decoded {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable scheduled job"),
            }
        }
        Ok(jobs)
    }
}
