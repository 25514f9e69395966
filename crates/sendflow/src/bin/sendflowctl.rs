use std::env;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use sendflow::assign::{AssignmentRepo, AssignmentScheduler};
use sendflow::config::Config;
use sendflow::db;
use sendflow::procedures::PgProcedures;
use sendflow::queue::{GraphApiClient, NewQueueItem, QueueProcessor, QueueRepo};

const DEMO_SEGMENT: &str = "default";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!(
            "sendflowctl <command>\n\
             Commands:\n\
             - reset\n\
             - seed <n>\n\
             - run-queue\n\
             - run-assign [segment]\n\
             - status\n\
             - clear-capacity\n\
             \n\
             Uses DATABASE_URL (and the SENDFLOW_* settings).\n"
        );
        std::process::exit(2);
    }

    sendflow::init_tracing();
    let cfg = Config::from_env()?;
    let pool = db::make_pool(&cfg.database_url).await?;
    db::run_migrations(&pool).await?;

    match args[1].as_str() {
        "reset" => reset(&pool).await?,
        "seed" => {
            let n: i64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10);
            seed(&pool, n).await?;
        }
        "run-queue" => {
            let delivery = GraphApiClient::new(
                cfg.provider_base_url.clone(),
                Duration::from_secs(cfg.provider_timeout_secs),
            )?;
            let processor = QueueProcessor::new(
                Arc::new(QueueRepo::new(pool.clone())),
                Arc::new(PgProcedures::new(pool.clone())),
                Arc::new(delivery),
                cfg.processor_config(),
            );
            let summary = processor.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        "run-assign" => {
            let segment = args.get(2).map(String::as_str);
            let scheduler = AssignmentScheduler::new(
                Arc::new(AssignmentRepo::new(pool.clone())),
                cfg.scheduler_config(),
            );
            let summary = scheduler.run_once(segment).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        "status" => show_status(&pool).await?,
        "clear-capacity" => {
            let n = QueueRepo::new(pool.clone()).clear_capacity_flags().await?;
            println!("cleared capacity flag on {n} channel(s)");
        }
        other => {
            eprintln!("Unknown command: {other}");
            std::process::exit(2);
        }
    }

    Ok(())
}

async fn reset(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        TRUNCATE TABLE
            assignment_log,
            messages,
            conversations,
            agent_profiles,
            send_outcomes,
            message_queue,
            send_batches,
            channels,
            templates
        RESTART IDENTITY CASCADE
        "#,
    )
    .execute(pool)
    .await?;

    println!("reset OK");
    Ok(())
}

/// One batch of `n` queued recipients plus `n` unassigned conversations and
/// two agents to hand them to.
async fn seed(pool: &PgPool, n: i64) -> anyhow::Result<()> {
    let template_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO templates (name, language, components)
        VALUES ('order_update', 'en', $1)
        RETURNING id
        "#,
    )
    .bind(json!([
        { "type": "BODY", "text": "Hi {{1}}, your order is on its way.",
          "example": { "body_text": [["Sam"]] } }
    ]))
    .fetch_one(pool)
    .await?;

    let channel_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO channels (phone_number_id, access_token, segment)
        VALUES ('demo-phone-number-id', 'demo-token', $1)
        RETURNING id
        "#,
    )
    .bind(DEMO_SEGMENT)
    .fetch_one(pool)
    .await?;

    let batch_id: Uuid = sqlx::query_scalar(
        "INSERT INTO send_batches (template_id, channel_id) VALUES ($1, $2) RETURNING id",
    )
    .bind(template_id)
    .bind(channel_id)
    .fetch_one(pool)
    .await?;

    let repo = QueueRepo::new(pool.clone());
    for i in 0..n {
        let recipient = format!("+1555{:07}", i);
        let id = repo
            .enqueue(NewQueueItem {
                batch_id,
                recipient: recipient.clone(),
                variables: json!([format!("Customer {i}")]),
                media_ref: None,
                next_attempt_at: Utc::now(),
            })
            .await?;
        println!("+ queued {recipient} id={id}");
    }

    for _ in 0..2 {
        let agent_id: Uuid = sqlx::query_scalar(
            "INSERT INTO agent_profiles (segment) VALUES ($1) RETURNING id",
        )
        .bind(DEMO_SEGMENT)
        .fetch_one(pool)
        .await?;
        println!("+ agent id={agent_id}");
    }

    for i in 0..n {
        sqlx::query("INSERT INTO conversations (recipient, channel_id, segment) VALUES ($1, $2, $3)")
            .bind(format!("+1666{:07}", i))
            .bind(channel_id)
            .bind(DEMO_SEGMENT)
            .execute(pool)
            .await?;
    }
    println!("+ {n} unassigned conversation(s) in segment {DEMO_SEGMENT}");

    Ok(())
}

async fn show_status(pool: &PgPool) -> anyhow::Result<()> {
    let queue = QueueRepo::new(pool.clone());
    let assignments = AssignmentRepo::new(pool.clone());

    for (status, count) in queue.depth_by_status().await? {
        println!("queue {status:<13} {count}");
    }
    let flagged = queue.rate_limited_channels().await?;
    println!("rate-limited channels: {}", flagged.len());
    for id in flagged {
        println!("  - {id}");
    }
    println!(
        "unassigned conversations: {}",
        assignments.unassigned_count().await?
    );
    Ok(())
}
