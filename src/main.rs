use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;

use lead_router::campaigns::CampaignScheduler;
use lead_router::config::RouterConfig;
use lead_router::leads::ClaimSweeper;
use lead_router::notify::{MessageSender, Outbound};
use lead_router::routes::{ApiState, api_routes};
use lead_router::routing::{AssignmentRotator, EligibilityResolver};
use lead_router::schedule::{self, ScheduledJob};
use lead_router::store::{Database, LibSqlBackend};

const USAGE: &str = "usage: lead-router [serve | sweep-claims | run-campaigns]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());
    if !matches!(command.as_str(), "serve" | "sweep-claims" | "run-campaigns") {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let config = RouterConfig::from_env().context("Invalid configuration")?;

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Collaborators ───────────────────────────────────────────────────
    let outbound = Outbound::from_env();
    let channels = outbound.active_channels();
    let sender: Arc<dyn MessageSender> = Arc::new(outbound);

    let resolver = EligibilityResolver::new(Arc::clone(&db), config.activity_window_days);
    let rotator = Arc::new(AssignmentRotator::new(
        Arc::clone(&db),
        resolver,
        config.claim_window,
    ));
    let sweeper = Arc::new(ClaimSweeper::new(
        Arc::clone(&db),
        Arc::clone(&rotator),
        Arc::clone(&sender),
        config.fallback_owner_email.clone(),
    ));
    let campaigns = Arc::new(CampaignScheduler::new(
        Arc::clone(&db),
        sender,
        config.scheduler_config(),
    ));

    // ── One-shot invocations ────────────────────────────────────────────
    match command.as_str() {
        "sweep-claims" => {
            let report = sweeper.sweep(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        "run-campaigns" => {
            let report = campaigns.tick(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        _ => {}
    }

    eprintln!("Lead Router v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   API: http://0.0.0.0:{}/api", config.http_port);
    eprintln!(
        "   Claim window: {} min, fallback owner: {}",
        config.claim_window.num_minutes(),
        config.fallback_owner_email.as_deref().unwrap_or("(unset)")
    );
    eprintln!(
        "   Channels: {}",
        if channels.is_empty() {
            "none".to_string()
        } else {
            channels.join(", ")
        }
    );
    eprintln!(
        "   Schedules: claims \"{}\", campaigns \"{}\"\n",
        config.claim_sweep_cron, config.campaign_cron
    );

    // ── Periodic jobs ───────────────────────────────────────────────────
    let _sweep_handle = schedule::spawn_cron_ticker(
        sweeper as Arc<dyn ScheduledJob>,
        schedule::parse_schedule("LEAD_ROUTER_CLAIM_SWEEP_CRON", &config.claim_sweep_cron)?,
    );
    let _campaign_handle = schedule::spawn_cron_ticker(
        campaigns as Arc<dyn ScheduledJob>,
        schedule::parse_schedule("LEAD_ROUTER_CAMPAIGN_CRON", &config.campaign_cron)?,
    );

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = api_routes(ApiState { db, rotator });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "API server started");
    axum::serve(listener, app).await?;

    Ok(())
}
