use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, sleep};
use tracing::info;

use spindle_core::config::{ENV_BACKOFF_BASE_MS, ENV_POLL_INTERVAL_MS};
use spindle_core::impls::{BroadcastEventPublisher, SqliteTaskStore};
use spindle_core::{
    EngineBuilder, EngineConfig, Handler, HandlerError, SpindleError, Task, TaskEvent,
    observability,
};

const ENV_SQLITE_DB: &str = "SPINDLE_SQLITE_DB";
const ENV_TASK_TABLE: &str = "SPINDLE_TASK_TABLE";
const ENV_DEMO_FAILURES: &str = "SPINDLE_DEMO_FAILURES";

#[derive(Debug, Serialize, Deserialize)]
struct SendEmail {
    to: String,
}

impl Task for SendEmail {
    const TYPE: &'static str = "send-email";
}

struct SendEmailHandler;

#[async_trait]
impl Handler<SendEmail> for SendEmailHandler {
    async fn handle(&self, task: SendEmail) -> Result<(), HandlerError> {
        info!(to = %task.to, "email sent");
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Flaky {
    name: String,
}

impl Task for Flaky {
    const TYPE: &'static str = "flaky";
}

struct FlakyHandler {
    remaining_failures: AtomicU32,
}

impl FlakyHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Handler<Flaky> for FlakyHandler {
    async fn handle(&self, task: Flaky) -> Result<(), HandlerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::new(format!("intentional failure (left={left})")));
        }
        info!(name = %task.name, "flaky task finally succeeded");
        Ok(())
    }
}

/// デモ向けに短い poll / back-off を既定値にする（環境変数があればそちらが優先）
fn demo_config(mut vars: HashMap<String, String>) -> Result<EngineConfig, SpindleError> {
    vars.entry(ENV_POLL_INTERVAL_MS.to_string())
        .or_insert_with(|| "200".to_string());
    vars.entry(ENV_BACKOFF_BASE_MS.to_string())
        .or_insert_with(|| "1000".to_string());
    EngineConfig::from_env_map(&vars)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    observability::init();

    let vars: HashMap<String, String> = std::env::vars().collect();
    let db_path = vars
        .get(ENV_SQLITE_DB)
        .cloned()
        .unwrap_or_else(|| "spindle.db".to_string());
    let table = vars
        .get(ENV_TASK_TABLE)
        .cloned()
        .unwrap_or_else(|| "tasks".to_string());
    let failures: u32 = match vars.get(ENV_DEMO_FAILURES) {
        Some(raw) => raw
            .parse()
            .map_err(|e| SpindleError::Config(format!("{ENV_DEMO_FAILURES}={raw}: {e}")))?,
        None => 2,
    };
    let config = demo_config(vars)?;

    // (A) store と engine を用意
    let store = Arc::new(SqliteTaskStore::open(&db_path, &table)?);
    let events = Arc::new(BroadcastEventPublisher::default());
    let mut completed = events.subscribe();
    let engine = EngineBuilder::new(store)
        .config(config)
        .event_publisher(events)
        .register::<SendEmail, _>(SendEmailHandler)?
        .register::<Flaky, _>(FlakyHandler::new(failures))?
        .expect_tasks(&[SendEmail::TYPE, Flaky::TYPE])
        .build()?;
    info!(db = %db_path, table = %table, "engine ready");

    // (B) 完了イベントを表示
    let listener = tokio::spawn(async move {
        while let Ok(event) = completed.recv().await {
            let TaskEvent::Completed {
                task_id,
                task_type,
                attempts,
                ..
            } = event;
            println!("completed: {task_type} {task_id} (failed attempts: {attempts})");
        }
    });

    // (C) タスク投入
    let publisher = engine.publisher();
    publisher
        .publish_task(&SendEmail {
            to: "a@b.com".into(),
        })
        .await?;
    publisher
        .publish_task(&Flaky {
            name: "spindle".into(),
        })
        .await?;

    // (D) キューが空になるか Ctrl-C まで回す
    let scheduler = engine.start();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
            _ = sleep(Duration::from_millis(250)) => {
                let counts = engine.store().counts_by_status().await?;
                if counts.is_drained() {
                    break;
                }
            }
        }
    }

    // (E) graceful shutdown: 実行中のタスクを待ってから止める
    scheduler.shutdown_and_join().await;
    listener.abort();

    let counts = engine.store().counts_by_status().await?;
    println!(
        "final counts: pending={} running={} done={} dead={}",
        counts.pending, counts.running, counts.done, counts.dead
    );
    Ok(())
}
