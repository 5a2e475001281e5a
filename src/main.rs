//! Demo entrypoint: runs the engine against a scripted in-process server and
//! logs every display snapshot until Ctrl+C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use draw_sync::config::SyncConfig;
use draw_sync::dto::channel::{EVENT_COMPLETE, EVENT_FIELD_UPDATE, EVENT_LATEST_ALL};
use draw_sync::services::connection::ConnectionManager;
use draw_sync::services::loopback::{self, LoopbackServer};
use draw_sync::services::sync_service::SyncEngine;
use draw_sync::state::entity::{DrawTemplate, FieldSpec, TemplateEntry};

const TOPIC: &str = "xsmn";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(SyncConfig::load());
    let (transport, server) = loopback::pair();
    let manager = ConnectionManager::new(Arc::new(transport), config.clone());

    tokio::spawn(run_scripted_server(server));

    let handle = SyncEngine::start(manager, TOPIC, demo_template(), config, None);
    let mut snapshots = handle.snapshots();

    let printer = tokio::spawn(async move {
        while let Ok(snapshot) = snapshots.recv().await {
            for entity in &snapshot.entities {
                let line: Vec<String> = entity
                    .fields
                    .iter()
                    .map(|field| format!("{}={}", field.name, field.value))
                    .collect();
                info!(
                    entity = %entity.entity_key,
                    complete = entity.is_complete,
                    status = ?snapshot.status,
                    "{}",
                    line.join(" ")
                );
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    info!("shutting down");
    handle.shutdown().await;
    printer.abort();

    Ok(())
}

/// The day's expected entities with the shared tier roster.
fn demo_template() -> DrawTemplate {
    DrawTemplate::new(
        vec![
            FieldSpec::new("tier8", 2),
            FieldSpec::new("tier7", 3),
            FieldSpec::new("tier6", 4),
            FieldSpec::new("special", 6),
        ],
        vec![
            TemplateEntry::new("tphcm", "2026-08-24"),
            TemplateEntry::new("dongthap", "2026-08-24"),
            TemplateEntry::new("camau", "2026-08-24"),
        ],
    )
}

/// Accept the engine's connection and feed it a staggered reveal sequence.
async fn run_scripted_server(mut server: LoopbackServer) {
    let Some(mut session) = server.accept().await else {
        return;
    };
    // Snapshot request sent on connect.
    let _ = session.recv().await;

    session.push(EVENT_LATEST_ALL, json!({"tphcm": {"tier8": "35"}}));

    let script = [
        ("tphcm", "tier7", "982"),
        ("dongthap", "tier8", "07"),
        ("tphcm", "tier6", "4411"),
        ("camau", "tier8", "51"),
        ("dongthap", "tier7", "340"),
        ("tphcm", "special", "198227"),
    ];
    for (i, (entity, field, value)) in script.into_iter().enumerate() {
        sleep(Duration::from_secs(2)).await;
        session.push(
            EVENT_FIELD_UPDATE,
            json!({
                "entityKey": entity,
                "fieldName": field,
                "value": value,
                "timestamp": 1_000 + i as i64,
            }),
        );
    }

    sleep(Duration::from_secs(2)).await;
    session.push(
        EVENT_COMPLETE,
        json!({
            "tphcm": {
                "tier8": "35", "tier7": "982", "tier6": "4411",
                "special": "198227", "isComplete": true
            }
        }),
    );

    // Keep the session open so the channel stays connected.
    while session.recv().await.is_some() {}
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
