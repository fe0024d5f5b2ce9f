//! `sitescope` -- start a site audit and follow it to the end.
//!
//! ```text
//! sitescope <url> [standard|comprehensive]
//! ```
//!
//! Connects to the backend's event channel, starts the audit and logs
//! every progress change. When the channel cannot be established in time
//! the progress is simulated locally. Exits non-zero when the job fails.
//!
//! Configuration is read from the environment (and `.env`); see
//! `sitescope_client::ClientConfig::from_env` for the variables.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use sitescope_client::{AuditClient, AuditType, ClientConfig, JobPhase, StartAuditRequest};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long to wait for the event channel before falling back to
/// simulated progress.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sitescope=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let Some(url) = args.next() else {
        eprintln!("usage: sitescope <url> [standard|comprehensive]");
        return Ok(ExitCode::from(2));
    };
    let audit_type: AuditType = match args.next() {
        Some(raw) => raw.parse().map_err(anyhow::Error::msg)?,
        None => AuditType::default(),
    };

    let config = ClientConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(
        api_url = %config.api_url,
        ws_url = %config.ws_url,
        url = %url,
        ?audit_type,
        "Starting sitescope",
    );

    let client = AuditClient::new(config);
    client.connect();
    let state = client.wait_for_connection(CONNECT_TIMEOUT).await;
    tracing::info!(?state, "Event channel settled");

    let session = client
        .start_audit(&StartAuditRequest::new(url, audit_type))
        .await
        .context("Failed to start audit")?;

    let mut views = session.watch();
    let view = loop {
        let view = views.borrow_and_update().clone();
        tracing::info!(
            job_id = %view.job_id,
            phase = ?view.phase,
            overall_progress = view.progress.overall_progress,
            current_step = ?view.progress.current_step,
            "Audit progress",
        );
        if view.phase.is_terminal() || views.changed().await.is_err() {
            break view;
        }
    };

    client.shutdown();

    match view.phase {
        JobPhase::Completed => {
            let result = view.result.unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(ExitCode::SUCCESS)
        }
        _ => {
            tracing::error!(
                job_id = %view.job_id,
                phase = ?view.phase,
                error = view.error.as_deref().unwrap_or("unknown"),
                "Audit did not complete",
            );
            Ok(ExitCode::FAILURE)
        }
    }
}
