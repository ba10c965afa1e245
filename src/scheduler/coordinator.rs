//! 调度协调器：单个 tokio 任务维护 (next_fire, job_id) 最小堆
//!
//! 到期时先持久化新的 next_fire（周期任务）或 Completed（一次性任务），再把目标提交给所属会话，
//! 因此同一时刻重复检查不会重复触发，崩溃重启也不会补发已记录的触发。
//! 堆中过期条目（任务已取消或 next_fire 已变化）直接丢弃。
//! 触发后的执行带有任务级取消令牌：cancel 同时中止仍在排队或执行中的那次运行。

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::{DailyCatchUp, SchedulerSection};
use crate::core::{AgentError, Goal, GoalOrigin, SessionId, TaskSubmitter};
use crate::scheduler::{JobId, JobNotification, JobStatus, JobStore, ScheduledJob, Trigger, HEARTBEAT_GOAL};

/// 存储写入失败后下一轮至少等待这么久
const FAILED_TICK_BACKOFF: Duration = Duration::from_secs(1);

/// 已提交、尚未出报告的触发
struct InFlight {
    owner: SessionId,
    token: CancellationToken,
    seq: u64,
    running: usize,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<JobId, ScheduledJob>,
    heap: BinaryHeap<Reverse<(i64, JobId)>>,
}

impl SchedulerState {
    fn insert(&mut self, job: ScheduledJob) {
        self.heap.push(Reverse((job.next_fire_at, job.id.clone())));
        self.jobs.insert(job.id.clone(), job);
    }
}

pub struct JobScheduler {
    store: JobStore,
    state: Mutex<SchedulerState>,
    submitter: Arc<dyn TaskSubmitter>,
    notifications: mpsc::UnboundedSender<JobNotification>,
    in_flight: Arc<std::sync::Mutex<HashMap<JobId, InFlight>>>,
    next_seq: AtomicU64,
    wake: Notify,
    offset: FixedOffset,
    catch_up: DailyCatchUp,
    max_idle: Duration,
}

impl JobScheduler {
    pub fn new(
        store: JobStore,
        submitter: Arc<dyn TaskSubmitter>,
        notifications: mpsc::UnboundedSender<JobNotification>,
        cfg: &SchedulerSection,
    ) -> Result<Self, AgentError> {
        let offset = FixedOffset::east_opt(cfg.utc_offset_minutes * 60).ok_or_else(|| {
            AgentError::Config(format!(
                "utc_offset_minutes {} out of range",
                cfg.utc_offset_minutes
            ))
        })?;
        Ok(Self {
            store,
            state: Mutex::new(SchedulerState::default()),
            submitter,
            notifications,
            in_flight: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
            wake: Notify::new(),
            offset,
            catch_up: cfg.daily_catch_up,
            max_idle: Duration::from_secs(cfg.max_idle_secs.max(1)),
        })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// 启动时从存储恢复：重新计算每个 Active 任务的 next_fire 并落盘；返回恢复的任务数
    pub async fn restore(&self, now: DateTime<Utc>) -> Result<usize, AgentError> {
        let now_ms = now.timestamp_millis();
        let mut restored = Vec::new();
        for mut job in self.store.load()?.into_iter().filter(ScheduledJob::is_active) {
            let overdue = job.next_fire_at <= now_ms;
            let next = match job.trigger {
                Trigger::OneOff { at } => at,
                Trigger::Heartbeat { .. } if overdue => job.trigger.next_after(now, self.offset)?,
                Trigger::Heartbeat { .. } => job.next_fire_at,
                Trigger::Daily { .. } if overdue && self.catch_up == DailyCatchUp::FireOnce => now_ms,
                Trigger::Daily { .. } => job.trigger.next_after(now, self.offset)?,
            };
            if next != job.next_fire_at {
                tracing::info!(job_id = %job.id, overdue, from = job.next_fire_at, to = next, "next fire recomputed");
                job.next_fire_at = next;
                self.store.save(&job)?;
            }
            restored.push(job);
        }

        let count = restored.len();
        let mut state = self.state.lock().await;
        for job in restored {
            state.insert(job);
        }
        drop(state);
        self.wake.notify_one();
        tracing::info!(jobs = count, "scheduler restored");
        Ok(count)
    }

    pub async fn schedule(&self, owner: SessionId, trigger: Trigger, goal: String) -> Result<JobId, AgentError> {
        self.schedule_at(owner, trigger, goal, Utc::now()).await
    }

    /// 同 schedule，但以给定时间为"现在"
    pub async fn schedule_at(
        &self,
        owner: SessionId,
        trigger: Trigger,
        goal: String,
        now: DateTime<Utc>,
    ) -> Result<JobId, AgentError> {
        self.put(ScheduledJob::new_id(), owner, trigger, goal, now).await
    }

    async fn put(
        &self,
        id: JobId,
        owner: SessionId,
        trigger: Trigger,
        goal: String,
        now: DateTime<Utc>,
    ) -> Result<JobId, AgentError> {
        trigger.validate()?;
        let next = trigger.first_fire(now, self.offset)?;
        let job = ScheduledJob::new(id.clone(), owner, trigger, goal, next);
        self.store.save(&job)?;
        tracing::info!(job_id = %id, owner = %job.owner, next_fire_at = next, "job scheduled");
        self.state.lock().await.insert(job);
        self.wake.notify_one();
        Ok(id)
    }

    /// 取消任务并中止它已触发、尚未结束的运行；返回是否确实取消了任务或运行
    pub async fn cancel(&self, job_id: &str) -> Result<bool, AgentError> {
        let aborted = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id)
            .map(|f| f.token.cancel())
            .is_some();
        if aborted {
            tracing::info!(job_id = %job_id, "in-flight run cancelled");
        }

        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get(job_id) else {
            return Ok(aborted);
        };
        let mut cancelled = job.clone();
        cancelled.status = JobStatus::Cancelled;
        self.store.save(&cancelled)?;
        state.jobs.remove(job_id);
        drop(state);
        self.wake.notify_one();
        tracing::info!(job_id = %job_id, "job cancelled");
        Ok(true)
    }

    /// Active 任务或仍在运行的触发的所属会话
    pub async fn owner_of(&self, job_id: &str) -> Option<SessionId> {
        if let Some(job) = self.state.lock().await.jobs.get(job_id) {
            return Some(job.owner.clone());
        }
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .map(|f| f.owner.clone())
    }

    pub async fn get(&self, job_id: &str) -> Option<ScheduledJob> {
        self.state.lock().await.jobs.get(job_id).cloned()
    }

    /// 会话的 Active 任务，按下一次触发时间排序
    pub async fn list(&self, owner: &SessionId) -> Vec<ScheduledJob> {
        let state = self.state.lock().await;
        let mut jobs: Vec<ScheduledJob> = state
            .jobs
            .values()
            .filter(|j| &j.owner == owner && j.is_active())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.next_fire_at);
        jobs
    }

    /// 每个会话至多一个心跳任务（id 为 hb_<owner>）；None 关闭
    pub async fn set_heartbeat(
        &self,
        owner: &SessionId,
        every_minutes: Option<u32>,
    ) -> Result<Option<JobId>, AgentError> {
        let id = ScheduledJob::heartbeat_id(owner);
        match every_minutes {
            None | Some(0) => {
                self.cancel(&id).await?;
                Ok(None)
            }
            Some(minutes) => {
                let id = self
                    .put(
                        id,
                        owner.clone(),
                        Trigger::Heartbeat {
                            every_minutes: minutes,
                        },
                        HEARTBEAT_GOAL.to_string(),
                        Utc::now(),
                    )
                    .await?;
                Ok(Some(id))
            }
        }
    }

    /// 触发所有到期任务；返回本次触发的任务 id
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, AgentError> {
        let now_ms = now.timestamp_millis();
        let mut fired = Vec::new();
        let mut state = self.state.lock().await;

        while let Some(Reverse((at, _))) = state.heap.peek() {
            if *at > now_ms {
                break;
            }
            let Some(Reverse((at, id))) = state.heap.pop() else {
                break;
            };
            let Some(job) = state.jobs.get(&id) else {
                continue;
            };
            if !job.is_active() || job.next_fire_at != at {
                continue;
            }

            let mut updated = job.clone();
            updated.last_fired_at = Some(now_ms);
            if updated.trigger.is_recurring() {
                updated.next_fire_at = updated.trigger.next_after(now, self.offset)?;
            } else {
                updated.status = JobStatus::Completed;
            }
            if let Err(e) = self.store.save(&updated) {
                // 未能落盘就不触发，等下一轮再试
                tracing::error!(job_id = %id, error = %e, "cannot persist firing, skipped");
                state.heap.push(Reverse((at, id)));
                return Err(e);
            }

            if updated.is_active() {
                state.insert(updated.clone());
            } else {
                state.jobs.remove(&id);
            }
            self.dispatch(&updated);
            fired.push(id);
        }
        Ok(fired)
    }

    fn dispatch(&self, job: &ScheduledJob) {
        tracing::info!(job_id = %job.id, owner = %job.owner, "job fired");
        let goal = Goal::new(
            job.goal.clone(),
            GoalOrigin::ScheduledJob {
                job_id: job.id.clone(),
            },
        );
        let (token, seq) = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            let entry = in_flight.entry(job.id.clone()).or_insert_with(|| InFlight {
                owner: job.owner.clone(),
                token: CancellationToken::new(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                running: 0,
            });
            entry.running += 1;
            (entry.token.clone(), entry.seq)
        };
        let reply = self.submitter.submit(&job.owner, goal, token);
        let notifications = self.notifications.clone();
        let in_flight = self.in_flight.clone();
        let job_id = job.id.clone();
        let owner = job.owner.clone();
        tokio::spawn(async move {
            let report = reply.await;
            {
                let mut in_flight = in_flight.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = in_flight.get_mut(&job_id).filter(|f| f.seq == seq) {
                    entry.running -= 1;
                    if entry.running == 0 {
                        in_flight.remove(&job_id);
                    }
                }
            }
            match report {
                Ok(report) => {
                    let _ = notifications.send(JobNotification {
                        job_id,
                        owner,
                        report,
                    });
                }
                Err(_) => tracing::warn!(job_id = %job_id, "job task dropped without a report"),
            }
        });
    }

    /// 距离最早到期任务的等待时间，不超过 max_idle
    async fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        let state = self.state.lock().await;
        match state.heap.peek() {
            Some(Reverse((at, _))) => {
                let wait = (*at - now.timestamp_millis()).max(0) as u64;
                Duration::from_millis(wait).min(self.max_idle)
            }
            None => self.max_idle,
        }
    }

    /// 协调循环：直到 shutdown 被取消
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!("scheduler started");
        loop {
            let now = Utc::now();
            let failed = match self.fire_due(now).await {
                Ok(_) => false,
                Err(e) => {
                    tracing::warn!(error = %e, "scheduler tick failed");
                    true
                }
            };
            let idle = tick_delay(self.idle_for(Utc::now()).await, failed);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(idle) => {}
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// 供列表展示的下一次触发时间
    pub fn format_next_fire(&self, job: &ScheduledJob) -> String {
        crate::scheduler::trigger::format_millis(job.next_fire_at, self.offset)
    }
}

/// 失败的一轮之后，到期条目仍留在堆顶，idle 会是 0；至少退避 FAILED_TICK_BACKOFF
fn tick_delay(idle: Duration, failed: bool) -> Duration {
    if failed {
        idle.max(FAILED_TICK_BACKOFF)
    } else {
        idle
    }
}
