//! 触发器与下一次触发时间计算
//!
//! 时间以毫秒时间戳（UTC）存储；Daily 按配置的固定 UTC 偏移解释墙上时间。

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// 在指定时刻触发一次（毫秒时间戳）
    OneOff { at: i64 },
    /// 每天 hour:minute（本地墙上时间）
    Daily { hour: u32, minute: u32 },
    /// 每 N 分钟
    Heartbeat { every_minutes: u32 },
}

impl Trigger {
    /// 从现在起 minutes 分钟后的一次性触发
    pub fn in_minutes(minutes: u32, now: DateTime<Utc>) -> Self {
        Trigger::OneOff {
            at: (now + Duration::minutes(i64::from(minutes))).timestamp_millis(),
        }
    }

    /// 解析 "HH:MM"
    pub fn daily_at(hhmm: &str) -> Result<Self, AgentError> {
        let (h, m) = hhmm
            .trim()
            .split_once(':')
            .ok_or_else(|| AgentError::InvalidTrigger(format!("expected HH:MM, got {hhmm:?}")))?;
        let hour = h
            .parse()
            .map_err(|_| AgentError::InvalidTrigger(format!("bad hour in {hhmm:?}")))?;
        let minute = m
            .parse()
            .map_err(|_| AgentError::InvalidTrigger(format!("bad minute in {hhmm:?}")))?;
        let trigger = Trigger::Daily { hour, minute };
        trigger.validate()?;
        Ok(trigger)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        match *self {
            Trigger::OneOff { .. } => Ok(()),
            Trigger::Daily { hour, minute } if hour < 24 && minute < 60 => Ok(()),
            Trigger::Daily { hour, minute } => Err(AgentError::InvalidTrigger(format!(
                "daily time {hour:02}:{minute:02} out of range"
            ))),
            Trigger::Heartbeat { every_minutes } if every_minutes >= 1 => Ok(()),
            Trigger::Heartbeat { .. } => Err(AgentError::InvalidTrigger(
                "heartbeat interval must be at least 1 minute".to_string(),
            )),
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Trigger::OneOff { .. })
    }

    /// 首次（或重新调度时的）触发时间
    pub fn first_fire(&self, now: DateTime<Utc>, offset: FixedOffset) -> Result<i64, AgentError> {
        match *self {
            Trigger::OneOff { at } => Ok(at),
            _ => self.next_after(now, offset),
        }
    }

    /// 周期任务在 now 之后的下一次触发时间；一次性任务没有下一次
    pub fn next_after(&self, now: DateTime<Utc>, offset: FixedOffset) -> Result<i64, AgentError> {
        match *self {
            Trigger::OneOff { at } => Err(AgentError::InvalidTrigger(format!(
                "one-off trigger at {at} does not recur"
            ))),
            Trigger::Daily { hour, minute } => next_daily(hour, minute, now, offset),
            Trigger::Heartbeat { every_minutes } => {
                Ok((now + Duration::minutes(i64::from(every_minutes))).timestamp_millis())
            }
        }
    }

    pub fn describe(&self, offset: FixedOffset) -> String {
        match *self {
            Trigger::OneOff { at } => format!("once at {}", format_millis(at, offset)),
            Trigger::Daily { hour, minute } => format!("daily at {hour:02}:{minute:02}"),
            Trigger::Heartbeat { every_minutes } => format!("every {every_minutes} min"),
        }
    }
}

/// 严格晚于 now 的下一个 hour:minute（按 offset 的墙上时间）
pub fn next_daily(
    hour: u32,
    minute: u32,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Result<i64, AgentError> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
        AgentError::InvalidTrigger(format!("daily time {hour:02}:{minute:02} out of range"))
    })?;
    let local_now = now.with_timezone(&offset).naive_local();
    let mut candidate = local_now.date().and_time(time);
    if candidate <= local_now {
        candidate += Duration::days(1);
    }
    offset
        .from_local_datetime(&candidate)
        .single()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .ok_or_else(|| AgentError::InvalidTrigger(format!("cannot place {candidate} in {offset}")))
}

/// 毫秒时间戳按 offset 格式化为 "YYYY-MM-DD HH:MM"
pub fn format_millis(millis: i64, offset: FixedOffset) -> String {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(dt) => dt.with_timezone(&offset).format("%Y-%m-%d %H:%M").to_string(),
        None => millis.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn ms(s: &str) -> i64 {
        utc(s).timestamp_millis()
    }

    #[test]
    fn test_next_daily_strictly_after_now() {
        let zero = FixedOffset::east_opt(0).unwrap();
        assert_eq!(
            next_daily(9, 0, utc("2026-03-01T08:00:00Z"), zero).unwrap(),
            ms("2026-03-01T09:00:00Z")
        );
        assert_eq!(
            next_daily(9, 0, utc("2026-03-01T09:00:00Z"), zero).unwrap(),
            ms("2026-03-02T09:00:00Z")
        );
        assert_eq!(
            next_daily(9, 0, utc("2026-03-01T09:00:30Z"), zero).unwrap(),
            ms("2026-03-02T09:00:00Z")
        );
    }

    #[test]
    fn test_next_daily_respects_offset() {
        // UTC+8：本地 09:00 即 UTC 01:00
        let cst = FixedOffset::east_opt(8 * 3600).unwrap();
        assert_eq!(
            next_daily(9, 0, utc("2026-03-01T00:30:00Z"), cst).unwrap(),
            ms("2026-03-01T01:00:00Z")
        );
        assert_eq!(
            next_daily(9, 0, utc("2026-03-01T02:00:00Z"), cst).unwrap(),
            ms("2026-03-02T01:00:00Z")
        );
    }

    #[test]
    fn test_validation_and_parsing() {
        assert!(Trigger::daily_at("09:30").is_ok());
        assert!(Trigger::daily_at("24:00").is_err());
        assert!(Trigger::daily_at("9.30").is_err());
        assert!(Trigger::Heartbeat { every_minutes: 0 }.validate().is_err());
        assert!(Trigger::OneOff { at: 0 }.validate().is_ok());
    }

    #[test]
    fn test_heartbeat_and_one_off() {
        let zero = FixedOffset::east_opt(0).unwrap();
        let now = utc("2026-03-01T08:00:00Z");
        let hb = Trigger::Heartbeat { every_minutes: 30 };
        assert_eq!(hb.next_after(now, zero).unwrap(), ms("2026-03-01T08:30:00Z"));
        let once = Trigger::in_minutes(5, now);
        assert_eq!(once.first_fire(now, zero).unwrap(), ms("2026-03-01T08:05:00Z"));
        assert!(!once.is_recurring());
        assert!(once.next_after(now, zero).is_err());
    }
}
