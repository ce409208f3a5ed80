use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use inbox_books::bookkeeping::MoneybirdClient;
use inbox_books::channels::{GmailAuth, GmailClient, OAuthClient};
use inbox_books::config::AppConfig;
use inbox_books::llm::create_extractor;
use inbox_books::pipeline::types::{Bookkeeper, ItemFetcher};
use inbox_books::pipeline::{Dispatcher, InvoicePipeline, Scheduler, SchedulerHandle};
use inbox_books::store::{LibSqlBackend, WatermarkStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; the environment may already be populated.
    let _ = dotenvy::dotenv();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📬 Inbox Books v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Label: {}", config.gmail.label);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Shutdown ─────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let trigger = SchedulerHandle::new();
    spawn_signal_handler(cancel.clone(), trigger.clone())?;

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Gmail ────────────────────────────────────────────────────────────
    let oauth = OAuthClient::from_file(&config.gmail.credentials_file)
        .context("failed to read Gmail credentials")?;
    let auth = Arc::new(GmailAuth::new(oauth, db.clone()));
    auth.authorize().await.context("Gmail authorization failed")?;
    let gmail = Arc::new(GmailClient::new(
        &config.gmail.api_base,
        &config.gmail.label,
        auth,
    ));

    // ── Moneybird ────────────────────────────────────────────────────────
    let moneybird = Arc::new(
        MoneybirdClient::new(
            &config.moneybird.base_url,
            &config.moneybird.administration_id,
            config.moneybird.token.clone(),
        )
        .context("failed to build Moneybird client")?,
    );
    let tax_rates = moneybird
        .load_tax_rates()
        .await
        .context("failed to load Moneybird tax rates")?;
    if tax_rates.is_empty() {
        anyhow::bail!("Moneybird returned no active purchase-invoice tax rates");
    }

    // ── Extraction ───────────────────────────────────────────────────────
    let extractor = create_extractor(&config.llm).context("failed to create extractor")?;

    // ── Preflight ────────────────────────────────────────────────────────
    gmail
        .fetch_since(Utc::now() - Duration::minutes(1))
        .await
        .context("Gmail preflight fetch failed")?;
    moneybird
        .search_parties("test")
        .await
        .context("Moneybird preflight contact search failed")?;
    tracing::info!("Preflight checks passed");

    // ── Scheduler ────────────────────────────────────────────────────────
    let initial = config.scheduler.start_from.unwrap_or_else(Utc::now);
    let watermark = WatermarkStore::load(db.clone(), initial)
        .await
        .context("failed to load watermark")?;

    let pipeline = Arc::new(InvoicePipeline::new(
        extractor,
        moneybird,
        Arc::new(tax_rates),
        &config.moneybird.country,
    ));
    let mut scheduler = Scheduler::new(
        gmail,
        pipeline,
        Dispatcher::new(config.scheduler.concurrency),
        watermark,
        config.scheduler.poll_interval,
    )
    .with_failure_log(db)
    .with_handle(&trigger);

    scheduler.run(cancel).await;

    tracing::info!("Shut down cleanly");
    Ok(())
}

/// Stderr logging, plus a daily-rolling file when `log_dir` is set.
/// The returned guard flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-books.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .init();
    guard
}

/// Ctrl+C and SIGTERM cancel the scheduler; SIGHUP triggers an immediate batch.
fn spawn_signal_handler(cancel: CancellationToken, handle: SchedulerHandle) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut hup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Ctrl+C received, shutting down...");
                        break;
                    }
                    _ = term.recv() => {
                        tracing::info!("SIGTERM received, shutting down...");
                        break;
                    }
                    _ = hup.recv() => {
                        tracing::info!("SIGHUP received, polling now");
                        handle.trigger_now();
                    }
                }
            }
            cancel.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        let _ = handle;
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl+C received, shutting down...");
            }
            cancel.cancel();
        });
    }

    Ok(())
}
