//! 运行轨迹：每个任务一份只追加的 JSONL 文件（`<trace_dir>/<task_id>.jsonl`）
//!
//! 同一 task_id 同时只允许一个写者；写入终止事件（task_done / task_failed / task_cancelled）后
//! 写者被消费，文件不再变更。外部工具通过 TraceLog::read 读取。

use std::collections::{HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 终止事件名：出现后该任务轨迹即被封存
pub const TERMINAL_EVENTS: &[&str] = &["task_done", "task_failed", "task_cancelled"];

/// 写者内存中保留的最近事件数（用于规划时的上下文）
const TAIL_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("trace io: {0}")]
    Io(#[from] std::io::Error),
    #[error("trace serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("trace for task {0} already has an active writer")]
    Busy(String),
    #[error("trace for task {0} is sealed")]
    Sealed(String),
}

/// 单条轨迹记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub ts: String,
    pub task_id: String,
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl TraceEvent {
    pub fn is_terminal(&self) -> bool {
        TERMINAL_EVENTS.contains(&self.event.as_str())
    }
}

/// 轨迹根目录与活跃写者登记
#[derive(Debug, Clone)]
pub struct TraceLog {
    root: PathBuf,
    active: Arc<Mutex<HashSet<String>>>,
}

impl TraceLog {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, TraceError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            active: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{task_id}.jsonl"))
    }

    /// 为任务打开写者；已有写者或轨迹已封存时报错
    pub fn open(&self, task_id: &str) -> Result<TraceWriter, TraceError> {
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if !active.insert(task_id.to_string()) {
                return Err(TraceError::Busy(task_id.to_string()));
            }
        }
        let path = self.path_for(task_id);
        let opened = self.open_file(task_id, &path);
        match opened {
            Ok(file) => Ok(TraceWriter {
                task_id: task_id.to_string(),
                file,
                tail: VecDeque::with_capacity(TAIL_CAPACITY),
                active: Arc::clone(&self.active),
            }),
            Err(e) => {
                self.release(task_id);
                Err(e)
            }
        }
    }

    fn open_file(&self, task_id: &str, path: &Path) -> Result<File, TraceError> {
        if path.exists() && self.read(task_id)?.last().is_some_and(TraceEvent::is_terminal) {
            return Err(TraceError::Sealed(task_id.to_string()));
        }
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }

    fn release(&self, task_id: &str) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
    }

    /// 读取任务全部轨迹；无法解析的行被跳过
    pub fn read(&self, task_id: &str) -> Result<Vec<TraceEvent>, TraceError> {
        let path = self.path_for(task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TraceEvent>(&line) {
                Ok(ev) => events.push(ev),
                Err(e) => tracing::warn!(task_id = %task_id, error = %e, "skipping malformed trace line"),
            }
        }
        Ok(events)
    }
}

/// 单个任务的轨迹写者；seal 后被消费
pub struct TraceWriter {
    task_id: String,
    file: File,
    tail: VecDeque<TraceEvent>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl TraceWriter {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// 追加一条非终止事件
    pub fn append(&mut self, event: &str, data: serde_json::Value) -> Result<(), TraceError> {
        let record = TraceEvent {
            ts: chrono::Utc::now().to_rfc3339(),
            task_id: self.task_id.clone(),
            event: event.to_string(),
            data,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        if self.tail.len() == TAIL_CAPACITY {
            self.tail.pop_front();
        }
        self.tail.push_back(record);
        Ok(())
    }

    /// 最近 n 条事件（时间顺序）
    pub fn tail(&self, n: usize) -> Vec<TraceEvent> {
        let skip = self.tail.len().saturating_sub(n);
        self.tail.iter().skip(skip).cloned().collect()
    }

    /// 写入终止事件并封存
    pub fn seal(mut self, event: &str, data: serde_json::Value) -> Result<(), TraceError> {
        debug_assert!(TERMINAL_EVENTS.contains(&event));
        self.append(event, data)?;
        self.file.flush()?;
        Ok(())
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_tail_and_seal() {
        let dir = TempDir::new().unwrap();
        let log = TraceLog::new(dir.path()).unwrap();
        let mut writer = log.open("task_1").unwrap();
        writer.append("task_created", serde_json::json!({"goal": "g"})).unwrap();
        writer.append("planning", serde_json::json!({})).unwrap();
        assert_eq!(writer.tail(1)[0].event, "planning");
        writer.seal("task_done", serde_json::json!({})).unwrap();

        let events = log.read("task_1").unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.last().unwrap().is_terminal());
        assert!(matches!(log.open("task_1"), Err(TraceError::Sealed(_))));
    }

    #[test]
    fn test_single_writer_per_task() {
        let dir = TempDir::new().unwrap();
        let log = TraceLog::new(dir.path()).unwrap();
        let writer = log.open("task_2").unwrap();
        assert!(matches!(log.open("task_2"), Err(TraceError::Busy(_))));
        drop(writer);
        assert!(log.open("task_2").is_ok());
    }
}
