use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use sendflow::api;
use sendflow::assign::{AssignmentRepo, AssignmentScheduler};
use sendflow::config;
use sendflow::db;
use sendflow::procedures::PgProcedures;
use sendflow::queue::{GraphApiClient, QueueProcessor, QueueRepo};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sendflow::init_tracing();
    let cfg = config::Config::from_env()?;

    let queue_interval = Duration::from_millis(cfg.queue_interval_ms.max(100));
    let assign_interval = Duration::from_millis(cfg.assign_interval_ms.max(100));
    let api_addr = cfg.admin_addr.clone();

    info!(
        worker_id = %cfg.worker_id,
        batch_size = cfg.queue_batch_size,
        max_retries = cfg.max_retries,
        backoff_secs = ?cfg.backoff_secs,
        queue_interval_ms = cfg.queue_interval_ms,
        assign_interval_ms = cfg.assign_interval_ms,
        api = api_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        "sendflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let queue_repo = QueueRepo::new(pool.clone());
    let assignment_repo = AssignmentRepo::new(pool.clone());
    let delivery = GraphApiClient::new(
        cfg.provider_base_url.clone(),
        Duration::from_secs(cfg.provider_timeout_secs),
    )?;

    let processor = QueueProcessor::new(
        Arc::new(queue_repo.clone()),
        Arc::new(PgProcedures::new(pool.clone())),
        Arc::new(delivery),
        cfg.processor_config(),
    );
    let scheduler = AssignmentScheduler::new(
        Arc::new(assignment_repo.clone()),
        cfg.scheduler_config(),
    );

    // ---- API task ----
    let app = api::router(api::ApiState {
        queue: queue_repo,
        assignments: assignment_repo,
        processor: processor.clone(),
        scheduler: scheduler.clone(),
    });

    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(%addr, "admin api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Queue processor task ----
    let queue_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(queue_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if let Err(e) = processor.run_once().await {
                warn!(error = %e, "queue run failed");
            }
        }
        #[allow(unreachable_code)]
        Ok::<(), anyhow::Error>(())
    });

    // ---- Assignment scheduler task ----
    let assign_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(assign_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if let Err(e) = scheduler.run_once(None).await {
                warn!(error = %e, "assignment run failed");
            }
        }
        #[allow(unreachable_code)]
        Ok::<(), anyhow::Error>(())
    });

    tokio::select! {
        res = api_handle => res??,
        res = queue_handle => res??,
        res = assign_handle => res??,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    Ok(())
}
