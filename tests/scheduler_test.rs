//! 定时任务：触发、持久化、重启恢复

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use orbit::config::{DailyCatchUp, SchedulerSection};
use orbit::core::{Goal, GoalOrigin, SessionId, TaskReport, TaskSubmitter};
use orbit::scheduler::{
    JobNotification, JobScheduler, JobStatus, JobStore, ScheduledJob, Trigger, HEARTBEAT_GOAL,
};
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// 记录提交的目标，并立即回一个报告
#[derive(Default)]
struct RecordingSubmitter {
    goals: Mutex<Vec<(SessionId, Goal)>>,
}

impl RecordingSubmitter {
    fn count(&self) -> usize {
        self.goals.lock().unwrap().len()
    }
}

impl TaskSubmitter for RecordingSubmitter {
    fn submit(
        &self,
        session: &SessionId,
        goal: Goal,
        _cancel: CancellationToken,
    ) -> oneshot::Receiver<TaskReport> {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(TaskReport::cancelled_before_start(&goal));
        self.goals.lock().unwrap().push((session.clone(), goal));
        rx
    }
}

fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn millis(s: &str) -> i64 {
    utc(s).timestamp_millis()
}

struct Fixture {
    dir: TempDir,
    submitter: Arc<RecordingSubmitter>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            submitter: Arc::new(RecordingSubmitter::default()),
        }
    }

    fn db(&self) -> std::path::PathBuf {
        self.dir.path().join("orbit.db")
    }

    fn store(&self) -> JobStore {
        JobStore::open(self.db()).unwrap()
    }

    fn scheduler(
        &self,
        catch_up: DailyCatchUp,
    ) -> (JobScheduler, mpsc::UnboundedReceiver<JobNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cfg = SchedulerSection {
            utc_offset_minutes: 0,
            daily_catch_up: catch_up,
            max_idle_secs: 1,
        };
        let scheduler = JobScheduler::new(self.store(), self.submitter.clone(), tx, &cfg).unwrap();
        (scheduler, rx)
    }
}

fn alice() -> SessionId {
    SessionId::from("alice")
}

#[tokio::test]
async fn test_daily_fires_once_and_persists_next_day() {
    let fx = Fixture::new();
    let (scheduler, mut notes) = fx.scheduler(DailyCatchUp::Skip);

    let id = scheduler
        .schedule_at(
            alice(),
            Trigger::Daily { hour: 9, minute: 0 },
            "check the news".into(),
            utc("2026-03-01T08:00:00Z"),
        )
        .await
        .unwrap();
    assert_eq!(
        scheduler.get(&id).await.unwrap().next_fire_at,
        millis("2026-03-01T09:00:00Z")
    );

    assert!(scheduler
        .fire_due(utc("2026-03-01T08:59:59Z"))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        scheduler.fire_due(utc("2026-03-01T09:00:00Z")).await.unwrap(),
        vec![id.clone()]
    );
    // 同一分钟内再次检查不会重复触发
    assert!(scheduler
        .fire_due(utc("2026-03-01T09:00:30Z"))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(fx.submitter.count(), 1);

    let (owner, goal) = fx.submitter.goals.lock().unwrap()[0].clone();
    assert_eq!(owner, alice());
    assert_eq!(goal.text, "check the news");
    assert_eq!(goal.origin, GoalOrigin::ScheduledJob { job_id: id.clone() });

    let persisted = fx
        .store()
        .load()
        .unwrap()
        .into_iter()
        .find(|j| j.id == id)
        .unwrap();
    assert_eq!(persisted.next_fire_at, millis("2026-03-02T09:00:00Z"));
    assert_eq!(persisted.last_fired_at, Some(millis("2026-03-01T09:00:00Z")));
    assert_eq!(persisted.status, JobStatus::Active);

    let note = tokio::time::timeout(Duration::from_secs(2), notes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(note.job_id, id);
    assert_eq!(note.owner, alice());
}

#[tokio::test]
async fn test_restart_skips_missed_daily_slot_by_default() {
    let fx = Fixture::new();
    {
        let (scheduler, _notes) = fx.scheduler(DailyCatchUp::Skip);
        scheduler
            .schedule_at(
                alice(),
                Trigger::Daily { hour: 9, minute: 0 },
                "check the news".into(),
                utc("2026-03-01T08:00:00Z"),
            )
            .await
            .unwrap();
    }

    // 进程在 09:00 前停止，12:00 重启
    let (scheduler, _notes) = fx.scheduler(DailyCatchUp::Skip);
    let now = utc("2026-03-01T12:00:00Z");
    assert_eq!(scheduler.restore(now).await.unwrap(), 1);
    assert!(scheduler.fire_due(now).await.unwrap().is_empty());

    let jobs = scheduler.list(&alice()).await;
    assert_eq!(jobs[0].next_fire_at, millis("2026-03-02T09:00:00Z"));
    assert_eq!(fx.store().load().unwrap()[0].next_fire_at, millis("2026-03-02T09:00:00Z"));
}

#[tokio::test]
async fn test_restart_fires_missed_daily_once_when_configured() {
    let fx = Fixture::new();
    {
        let (scheduler, _notes) = fx.scheduler(DailyCatchUp::FireOnce);
        scheduler
            .schedule_at(
                alice(),
                Trigger::Daily { hour: 9, minute: 0 },
                "check the news".into(),
                utc("2026-02-27T08:00:00Z"),
            )
            .await
            .unwrap();
    }

    // 错过了好几天，也只补发一次
    let (scheduler, _notes) = fx.scheduler(DailyCatchUp::FireOnce);
    let now = utc("2026-03-01T12:00:00Z");
    scheduler.restore(now).await.unwrap();
    assert_eq!(scheduler.fire_due(now).await.unwrap().len(), 1);
    assert!(scheduler
        .fire_due(utc("2026-03-01T12:00:05Z"))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(fx.submitter.count(), 1);
    assert_eq!(
        scheduler.list(&alice()).await[0].next_fire_at,
        millis("2026-03-02T09:00:00Z")
    );
}

#[tokio::test]
async fn test_heartbeat_does_not_catch_up_after_downtime() {
    let fx = Fixture::new();
    let mut job = ScheduledJob::new(
        ScheduledJob::heartbeat_id(&alice()),
        alice(),
        Trigger::Heartbeat { every_minutes: 30 },
        HEARTBEAT_GOAL.to_string(),
        millis("2026-03-01T06:00:00Z"),
    );
    job.last_fired_at = Some(millis("2026-03-01T05:30:00Z"));
    fx.store().save(&job).unwrap();

    let (scheduler, _notes) = fx.scheduler(DailyCatchUp::FireOnce);
    let now = utc("2026-03-01T12:00:00Z");
    scheduler.restore(now).await.unwrap();
    assert!(scheduler.fire_due(now).await.unwrap().is_empty());
    assert_eq!(
        scheduler.get("hb_alice").await.unwrap().next_fire_at,
        millis("2026-03-01T12:30:00Z")
    );

    assert_eq!(
        scheduler.fire_due(utc("2026-03-01T12:30:00Z")).await.unwrap(),
        vec!["hb_alice".to_string()]
    );
    assert_eq!(fx.submitter.count(), 1);
}

#[tokio::test]
async fn test_one_off_completes_after_firing() {
    let fx = Fixture::new();
    let (scheduler, _notes) = fx.scheduler(DailyCatchUp::Skip);
    let now = utc("2026-03-01T08:00:00Z");
    let id = scheduler
        .schedule_at(alice(), Trigger::in_minutes(10, now), "stretch".into(), now)
        .await
        .unwrap();

    assert!(scheduler
        .fire_due(utc("2026-03-01T08:09:00Z"))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        scheduler.fire_due(utc("2026-03-01T08:10:00Z")).await.unwrap(),
        vec![id.clone()]
    );
    assert!(scheduler.get(&id).await.is_none());
    assert!(scheduler.list(&alice()).await.is_empty());
    assert!(scheduler
        .fire_due(utc("2026-03-02T08:10:00Z"))
        .await
        .unwrap()
        .is_empty());

    let stored = fx.store().load().unwrap();
    assert_eq!(stored[0].status, JobStatus::Completed);

    // 重启后不会再次触发
    let (restarted, _notes) = fx.scheduler(DailyCatchUp::Skip);
    assert_eq!(restarted.restore(utc("2026-03-01T09:00:00Z")).await.unwrap(), 0);
    assert_eq!(fx.submitter.count(), 1);
}

#[tokio::test]
async fn test_overdue_one_off_fires_promptly_after_restart() {
    let fx = Fixture::new();
    let job = ScheduledJob::new(
        "job_overdue".to_string(),
        alice(),
        Trigger::OneOff {
            at: millis("2026-03-01T08:00:00Z"),
        },
        "water the plants".into(),
        millis("2026-03-01T08:00:00Z"),
    );
    fx.store().save(&job).unwrap();

    let (scheduler, _notes) = fx.scheduler(DailyCatchUp::Skip);
    let now = utc("2026-03-01T12:00:00Z");
    scheduler.restore(now).await.unwrap();
    assert_eq!(
        scheduler.fire_due(now).await.unwrap(),
        vec!["job_overdue".to_string()]
    );
}

#[tokio::test]
async fn test_corrupt_rows_are_skipped_on_restore() {
    let fx = Fixture::new();
    {
        let (scheduler, _notes) = fx.scheduler(DailyCatchUp::Skip);
        scheduler
            .schedule_at(
                alice(),
                Trigger::Daily { hour: 9, minute: 0 },
                "check the news".into(),
                utc("2026-03-01T08:00:00Z"),
            )
            .await
            .unwrap();
    }
    let conn = rusqlite::Connection::open(fx.db()).unwrap();
    conn.execute(
        "INSERT INTO scheduled_jobs (id, owner, trigger, goal, status, next_fire_at, created_at)
         VALUES ('job_bad', 'alice', 'not json', 'x', 'active', 0, 0)",
        [],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO scheduled_jobs (id, owner, trigger, goal, status, next_fire_at, created_at)
         VALUES ('job_weird', 'alice', '{\"kind\":\"daily\",\"hour\":9,\"minute\":0}', 'x', 'exploded', 0, 0)",
        [],
    )
    .unwrap();
    drop(conn);

    let (scheduler, _notes) = fx.scheduler(DailyCatchUp::Skip);
    assert_eq!(
        scheduler.restore(utc("2026-03-01T08:30:00Z")).await.unwrap(),
        1
    );
    assert!(scheduler.get("job_bad").await.is_none());
    assert_eq!(scheduler.list(&alice()).await.len(), 1);
}

#[tokio::test]
async fn test_cancel_list_and_heartbeat_management() {
    let fx = Fixture::new();
    let (scheduler, _notes) = fx.scheduler(DailyCatchUp::Skip);
    let bob = SessionId::from("bob");

    let daily = scheduler
        .schedule(alice(), Trigger::Daily { hour: 7, minute: 30 }, "stand-up".into())
        .await
        .unwrap();
    scheduler
        .schedule(bob.clone(), Trigger::Daily { hour: 8, minute: 0 }, "coffee".into())
        .await
        .unwrap();

    assert_eq!(
        scheduler.set_heartbeat(&alice(), Some(30)).await.unwrap(),
        Some("hb_alice".to_string())
    );
    // 再次设置替换原有心跳
    scheduler.set_heartbeat(&alice(), Some(10)).await.unwrap();
    let jobs = scheduler.list(&alice()).await;
    assert_eq!(jobs.len(), 2);
    let hb = jobs.iter().find(|j| j.id == "hb_alice").unwrap();
    assert_eq!(hb.trigger, Trigger::Heartbeat { every_minutes: 10 });
    assert_eq!(hb.goal, HEARTBEAT_GOAL);

    assert_eq!(scheduler.set_heartbeat(&alice(), None).await.unwrap(), None);
    assert_eq!(scheduler.list(&alice()).await.len(), 1);

    assert!(scheduler.cancel(&daily).await.unwrap());
    assert!(!scheduler.cancel(&daily).await.unwrap());
    assert!(!scheduler.cancel("job_missing").await.unwrap());
    assert!(scheduler.list(&alice()).await.is_empty());
    assert_eq!(scheduler.list(&bob).await.len(), 1);

    let cancelled = fx
        .store()
        .load()
        .unwrap()
        .into_iter()
        .find(|j| j.id == daily)
        .unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_invalid_trigger_is_rejected() {
    let fx = Fixture::new();
    let (scheduler, _notes) = fx.scheduler(DailyCatchUp::Skip);
    assert!(scheduler
        .schedule(alice(), Trigger::Daily { hour: 25, minute: 0 }, "nope".into())
        .await
        .is_err());
    assert!(scheduler
        .schedule(alice(), Trigger::Heartbeat { every_minutes: 0 }, "nope".into())
        .await
        .is_err());
    assert!(fx.store().load().unwrap().is_empty());
}

#[tokio::test]
async fn test_run_loop_dispatches_due_jobs() {
    let fx = Fixture::new();
    let (scheduler, mut notes) = fx.scheduler(DailyCatchUp::Skip);
    let scheduler = Arc::new(scheduler);
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(scheduler.clone().run(shutdown.clone()));

    let id = scheduler
        .schedule(
            alice(),
            Trigger::OneOff {
                at: Utc::now().timestamp_millis() + 200,
            },
            "stretch".into(),
        )
        .await
        .unwrap();

    let note = tokio::time::timeout(Duration::from_secs(3), notes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(note.job_id, id);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .unwrap()
        .unwrap();
}
