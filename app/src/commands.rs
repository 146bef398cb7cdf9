use crate::probe;
use crate::ConfigAction;
use anyhow::{anyhow, bail, Context, Result};
use certify::dgi::{DgiAuth, DgiClient};
use certify::mock::MockClient;
use certify::{CertificationClient, CertificationResult, CertifyError};
use config::AppConfig;
use emecef_core::{validation, InvoiceRequest};
use queue::{AuditSink, JsonlAuditSink, NetworkState, SyncOptions, SyncService};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Everything the operator commands need, wired once at startup.
pub struct App {
    pub config: AppConfig,
    pub service: SyncService,
    pub client: Arc<dyn CertificationClient>,
    pub network: Arc<NetworkState>,
    pub probe_client: Option<Arc<DgiClient>>,
}

impl App {
    pub fn build() -> Result<Self> {
        let cfg = config::load().unwrap_or_default();

        let audit: Arc<dyn AuditSink> = Arc::new(JsonlAuditSink::new(&cfg.storage.audit_log));
        let (client, probe_client) = create_certification_client(&cfg)?;
        // The queue assumes connectivity until a probe says otherwise; a
        // wrong guess only costs one skipped pass.
        let network = NetworkState::new(true);

        let options = SyncOptions {
            retry_ceiling: cfg.sync.retry_ceiling,
            base_retry_delay: Duration::from_millis(cfg.sync.base_retry_delay_ms),
            sync_interval: Duration::from_millis(cfg.sync.interval_ms),
            duplicate_window: Duration::from_millis(cfg.sync.duplicate_window_ms),
            max_pending: cfg.sync.max_pending,
        };
        let service = SyncService::open(
            &cfg.storage.queue_path,
            client.clone(),
            network.clone(),
            audit,
            options,
        )
        .context("Failed to open offline queue")?;

        Ok(Self {
            config: cfg,
            service,
            client,
            network,
            probe_client,
        })
    }

    /// One-shot connectivity check before a manual pass.
    async fn refresh_connectivity(&self) {
        if let Some(dgi) = &self.probe_client {
            self.network.set_connected(dgi.health().await);
        }
    }
}

fn create_certification_client(
    cfg: &AppConfig,
) -> Result<(Arc<dyn CertificationClient>, Option<Arc<DgiClient>>)> {
    match cfg.provider.kind.as_str() {
        "dgi" => {
            let timeout = Duration::from_millis(cfg.api.timeout_ms);

            let auth = if let Ok(key) = std::env::var("EMECEF_API_KEY")
                .or_else(|_| config::get_secret("dgi_api_key"))
            {
                tracing::info!("Using DGI client with API key auth");
                DgiAuth::ApiKey { key }
            } else {
                let refresh_token = std::env::var("EMECEF_REFRESH_TOKEN")
                    .or_else(|_| config::get_secret("dgi_refresh_token"))
                    .map_err(|_| {
                        anyhow!("DGI credentials not found in env or keychain")
                    })?;
                tracing::info!("Using DGI client with refresh token auth");
                DgiAuth::RefreshToken { refresh_token }
            };

            let client = DgiClient::new(
                cfg.api.base_url.clone(),
                cfg.api.terminal_id.clone(),
                auth,
                timeout,
            );
            let dyn_client: Arc<dyn CertificationClient> = client.clone();
            Ok((dyn_client, Some(client)))
        }
        _ => {
            tracing::info!("Using mock certification client");
            Ok((MockClient::new(), None))
        }
    }
}

pub async fn run(app: App) -> Result<()> {
    let probe_task = app
        .probe_client
        .as_ref()
        .map(|client| probe::spawn(client.clone(), app.network.clone()));

    app.service
        .start_autosync()
        .context("Failed to start autosync")?;
    println!(
        "agent running (terminal {}, {} pending) — Ctrl-C to stop",
        app.config.api.terminal_id,
        app.service.pending_count()
    );

    tokio::signal::ctrl_c().await?;
    println!("shutting down...");
    app.service.stop_autosync().await;
    if let Some(task) = probe_task {
        task.abort();
    }
    Ok(())
}

pub async fn submit(app: App, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let invoice: InvoiceRequest =
        serde_json::from_str(&raw).context("Invoice file is not valid JSON")?;

    if let Err(errors) = validation::validate(&invoice) {
        eprintln!("invoice failed validation:");
        for e in &errors {
            eprintln!("  - {e}");
        }
        bail!("invoice not submitted");
    }

    match app.client.submit(&invoice).await {
        Ok(CertificationResult::Certified {
            mecef_code,
            qr_data,
            ..
        }) => {
            println!("CERTIFIED  code={mecef_code}  qr={qr_data}");
        }
        Ok(CertificationResult::Queued) => {
            println!("accepted by the DGI, certification in progress server-side");
        }
        Ok(CertificationResult::Rejected { reasons }) => {
            eprintln!("REJECTED by the DGI:");
            for r in &reasons {
                eprintln!("  - {r}");
            }
            bail!("invoice rejected, not queued");
        }
        Err(CertifyError::ClientInvalid { status, message }) => {
            bail!("invoice refused ({status}): {message} — not queued");
        }
        Err(err) => {
            // Network-class failure: fall back to the offline queue. The two
            // outcomes below are different guarantees and must read as such.
            tracing::warn!(error = %err, "direct certification failed, queueing offline");
            match app.service.enqueue(invoice) {
                Ok(id) => {
                    println!("stored offline (id {id}); it will sync automatically");
                }
                Err(store_err) => {
                    bail!(
                        "invoice NOT saved — offline store failed ({store_err}); \
                         do not hand out this receipt as queued"
                    );
                }
            }
        }
    }
    Ok(())
}

pub fn list(app: App) -> Result<()> {
    let records = app.service.list();
    if records.is_empty() {
        println!("no pending invoices");
        return Ok(());
    }
    let ceiling = app.service.options().retry_ceiling;
    for r in &records {
        let state = if r.is_abandoned(ceiling) {
            "ABANDONED (manual retry required)"
        } else {
            "pending (retries automatically)"
        };
        println!(
            "{}  {}  issuer={}  total={}  attempts={}  {}",
            r.id,
            r.enqueued_at.to_rfc3339(),
            r.invoice.issuer_ifu,
            r.invoice.total,
            r.attempts,
            state
        );
        if let Some(err) = &r.last_error {
            println!("    last error: {err}");
        }
    }
    Ok(())
}

pub async fn sync(app: App) -> Result<()> {
    app.refresh_connectivity().await;
    match app.service.manual_sync().await? {
        Some(report) => print_report(&report),
        None => println!("a sync pass is already running"),
    }
    Ok(())
}

pub async fn retry_abandoned(app: App) -> Result<()> {
    app.refresh_connectivity().await;
    match app.service.retry_abandoned().await? {
        Some(report) => print_report(&report),
        None => println!("a sync pass is already running"),
    }
    Ok(())
}

fn print_report(report: &queue::SyncReport) {
    println!(
        "synced {} / failed {} / total {}",
        report.synced, report.failed, report.total
    );
    for failure in &report.errors {
        println!("  {}: {}", failure.id, failure.error);
    }
}

pub fn stats(app: App, reset: bool) -> Result<()> {
    if reset {
        app.service.reset_stats()?;
        println!("sync statistics reset");
        return Ok(());
    }
    let stats = app.service.stats();
    println!("total synced:  {}", stats.total_synced);
    println!("total failed:  {}", stats.total_failed);
    println!("avg pass time: {:.0} ms", stats.average_sync_ms);
    match stats.last_sync_time {
        Some(t) => println!("last sync:     {}", t.to_rfc3339()),
        None => println!("last sync:     never"),
    }
    println!(
        "queue:         {} pending, {} abandoned",
        app.service.pending_count(),
        app.service.abandoned_count()
    );
    Ok(())
}

pub fn clear(app: App) -> Result<()> {
    let count = app.service.pending_count();
    app.service.clear_all()?;
    println!("removed {count} pending invoices");
    Ok(())
}

pub fn configure(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let cfg = config::load().unwrap_or_default();
            println!("provider:    {}", cfg.provider.kind);
            println!("base url:    {}", cfg.api.base_url);
            println!("terminal id: {}", cfg.api.terminal_id);
            println!("sync every:  {} ms", cfg.sync.interval_ms);
            println!("retry limit: {}", cfg.sync.retry_ceiling);
        }
        ConfigAction::Set {
            provider,
            base_url,
            terminal_id,
        } => {
            let mut cfg = config::load().unwrap_or_default();
            if let Some(provider) = provider {
                if provider != "mock" && provider != "dgi" {
                    bail!("unknown provider '{provider}' (expected mock or dgi)");
                }
                cfg.provider.kind = provider;
            }
            if let Some(base_url) = base_url {
                cfg.api.base_url = base_url;
            }
            if let Some(terminal_id) = terminal_id {
                cfg.api.terminal_id = terminal_id;
            }
            config::store(&cfg)?;
            tracing::info!("Settings updated");
        }
    }
    Ok(())
}
