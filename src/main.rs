//! Orbit - 命令行传输层
//!
//! 入口：初始化日志、创建 Agent 运行时，逐行读取 stdin：普通文本作为目标提交，
//! 斜杠命令管理定时任务（/remind、/daily、/heartbeat、/jobs、/cancel）与停止（/stop）。

use std::path::PathBuf;

use anyhow::Context;
use orbit::core::{create_agent, AgentEvent, Command, Goal, SessionId};
use orbit::scheduler::Trigger;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "Commands:
  <goal>                      run a goal now
  /remind <minutes> <goal>    run a goal once, later
  /daily HH:MM <goal>         run a goal every day
  /heartbeat <minutes>|off    periodic check-in
  /jobs                       list scheduled jobs
  /cancel <job_id>            cancel a scheduled job
  /stop                       stop the running task
  /quit                       exit";

/// 解析一行输入；Ok(None) 表示无需发送命令（空行、帮助）
fn parse_line(line: &str, session: &SessionId) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(Command::Submit {
            session: session.clone(),
            goal: Goal::cli(line),
        }));
    }

    let mut parts = line.splitn(3, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).unwrap_or_default();
    let rest = parts.next().map(str::trim).unwrap_or_default();
    let session = session.clone();

    let cmd = match name {
        "/help" => return Ok(None),
        "/quit" | "/exit" => Command::Quit,
        "/stop" => Command::Stop { session },
        "/jobs" => Command::ListJobs { session },
        "/cancel" if !arg.is_empty() => Command::CancelJob {
            session,
            job_id: arg.to_string(),
        },
        "/cancel" => return Err("Usage: /cancel <job_id>".to_string()),
        "/remind" => {
            let minutes: u32 = arg
                .parse()
                .map_err(|_| "Usage: /remind <minutes> <what to do>".to_string())?;
            if rest.is_empty() {
                return Err("Usage: /remind <minutes> <what to do>".to_string());
            }
            Command::Schedule {
                session,
                trigger: Trigger::in_minutes(minutes.max(1), chrono::Utc::now()),
                goal: rest.to_string(),
            }
        }
        "/daily" => {
            if rest.is_empty() {
                return Err("Usage: /daily HH:MM <what to do>".to_string());
            }
            let trigger = Trigger::daily_at(arg).map_err(|e| e.to_string())?;
            Command::Schedule {
                session,
                trigger,
                goal: rest.to_string(),
            }
        }
        "/heartbeat" => match arg.to_lowercase().as_str() {
            "off" | "0" | "false" | "no" => Command::Heartbeat {
                session,
                every_minutes: None,
            },
            other => {
                let minutes: u32 = other.parse().map_err(|_| {
                    "Heartbeat must be minutes (e.g. /heartbeat 30) or 'off'".to_string()
                })?;
                Command::Heartbeat {
                    session,
                    every_minutes: Some(minutes),
                }
            }
        },
        other => return Err(format!("Unknown command {other}. Try /help")),
    };
    Ok(Some(cmd))
}

fn print_event(event: AgentEvent) {
    match event {
        AgentEvent::Reply { text, .. } => println!("{text}"),
        AgentEvent::TaskFinished { report, .. } => println!("{}", report.render()),
        AgentEvent::JobFinished(n) => println!("[job {}]\n{}", n.job_id, n.report.render()),
        AgentEvent::Chat(text) => println!("> {text}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orbit::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let handle = create_agent(config_path)
        .await
        .context("Failed to create agent")?;
    let commands = handle.commands;
    let mut events = handle.events;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(event);
        }
    });

    let session = SessionId::from("cli");
    println!("Orbit ready. Type a goal, or /help.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match parse_line(&line, &session) {
            Ok(Some(Command::Quit)) => {
                let _ = commands.send(Command::Quit);
                break;
            }
            Ok(Some(cmd)) => commands
                .send(cmd)
                .map_err(|_| anyhow::anyhow!("orchestrator stopped"))?,
            Ok(None) if line.trim() == "/help" => println!("{HELP}"),
            Ok(None) => {}
            Err(msg) => println!("{msg}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<Option<Command>, String> {
        parse_line(line, &SessionId::from("cli"))
    }

    #[test]
    fn test_plain_text_is_a_goal() {
        match parse("open calculator").unwrap() {
            Some(Command::Submit { goal, .. }) => assert_eq!(goal.text, "open calculator"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse("   ").unwrap().is_none());
    }

    #[test]
    fn test_schedule_commands() {
        match parse("/daily 09:00 check the news").unwrap() {
            Some(Command::Schedule { trigger, goal, .. }) => {
                assert_eq!(trigger, Trigger::Daily { hour: 9, minute: 0 });
                assert_eq!(goal, "check the news");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            parse("/remind 10 stretch").unwrap(),
            Some(Command::Schedule {
                trigger: Trigger::OneOff { .. },
                ..
            })
        ));
        assert!(parse("/daily 25:00 nope").is_err());
        assert!(parse("/remind soon stretch").is_err());
    }

    #[test]
    fn test_heartbeat_and_cancel() {
        assert!(matches!(
            parse("/heartbeat off").unwrap(),
            Some(Command::Heartbeat {
                every_minutes: None,
                ..
            })
        ));
        assert!(matches!(
            parse("/heartbeat 30").unwrap(),
            Some(Command::Heartbeat {
                every_minutes: Some(30),
                ..
            })
        ));
        assert!(parse("/cancel").is_err());
        assert!(matches!(
            parse("/cancel job_1").unwrap(),
            Some(Command::CancelJob { .. })
        ));
    }
}
