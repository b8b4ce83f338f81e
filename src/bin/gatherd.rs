//! Post service with resilient detail aggregation.
//!
//! Serves posts from an in-memory store and assembles post details from the downstream
//! services named in the configuration file.

use clap::Parser;
use ninelives_gather::server::{router, Resource};
use ninelives_gather::{CreateConsistency, GatherConfig, InMemoryStore, SideEffect};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "gatherd")]
#[command(about = "Post service with resilient detail aggregation", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, default_value = "gather.toml")]
    config: PathBuf,

    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Seconds between redelivery sweeps when consistency is `retry_later`.
    #[arg(long, default_value_t = 30)]
    redeliver_every: u64,
}

#[derive(Debug, Clone, Serialize)]
struct Post {
    id: u64,
    title: String,
    summary: String,
}

#[derive(Debug, Deserialize)]
struct PostDraft {
    title: String,
    #[serde(default)]
    summary: String,
    /// Sent to the details service, not stored with the post.
    #[serde(default)]
    body: String,
}

impl Resource for Post {
    type Draft = PostDraft;
    const NAME: &'static str = "posts";

    fn validate(draft: &PostDraft) -> Vec<String> {
        let mut errors = Vec::new();
        if draft.title.trim().is_empty() {
            errors.push("title must not be blank".to_string());
        }
        if draft.title.chars().count() > 200 {
            errors.push("title must be at most 200 characters".to_string());
        }
        if draft.summary.chars().count() > 1000 {
            errors.push("summary must be at most 1000 characters".to_string());
        }
        errors
    }

    fn materialize(id: u64, draft: PostDraft) -> Self {
        Post { id, title: draft.title, summary: draft.summary }
    }

    fn side_effect(draft: &PostDraft) -> Option<SideEffect<Self, Value>> {
        if draft.body.is_empty() {
            return None;
        }
        let body = draft.body.clone();
        Some(SideEffect::new("details", move |id, _: &Post| json!({ "post_id": id, "body": body })))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ninelives_gather=info,gatherd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = GatherConfig::load(&cli.config)?;
    let resolver = Arc::new(config.resolver());
    let aggregator = Arc::new(config.aggregator::<Post, _>(Arc::new(InMemoryStore::<Post>::new()), resolver)?);
    tracing::info!(
        dependencies = ?aggregator.dependency_names().collect::<Vec<_>>(),
        deadline = ?aggregator.deadline(),
        "aggregator ready"
    );

    if aggregator.consistency() == CreateConsistency::RetryLater {
        let aggregator = aggregator.clone();
        let period = Duration::from_secs(cli.redeliver_every.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if aggregator.pending() == 0 {
                    continue;
                }
                match aggregator.redeliver_pending().await {
                    Ok(outcomes) => tracing::info!(
                        attempted = outcomes.len(),
                        still_pending = aggregator.pending(),
                        "redelivery sweep"
                    ),
                    Err(e) => tracing::error!(error = %e, "redelivery sweep failed"),
                }
            }
        });
    }

    let listener = TcpListener::bind(cli.listen).await?;
    tracing::info!(addr = %cli.listen, "listening");
    axum::serve(listener, router(aggregator))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
