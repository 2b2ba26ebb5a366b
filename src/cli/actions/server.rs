use crate::{
    api,
    audit::{JsonLinesAuditSink, TracingAuditSink},
    challenge::LogDelivery,
    cli::telemetry,
    config::AuthConfig,
    credentials::NewUser,
    engine::AuthEngine,
    persistence::JsonFileUserRepository,
};
use anyhow::{anyhow, Context, Result};
use chrono::FixedOffset;
use std::{net::IpAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub users_file: PathBuf,
    pub audit_log: PathBuf,
    pub rp_origin: String,
    pub session_idle_seconds: u64,
    pub sweep_interval: u64,
    pub honeypot_paths: Option<Vec<String>>,
    pub utc_offset_hours: i32,
    pub escalate_on_anomaly: bool,
    pub trusted_proxies: Option<Vec<IpAddr>>,
    pub bootstrap_admin: Option<NewUser>,
}

impl Args {
    /// # Errors
    /// Returns an error if the UTC offset is out of range.
    pub fn auth_config(&self) -> Result<AuthConfig> {
        let offset = FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .ok_or_else(|| anyhow!("invalid UTC offset: {}h", self.utc_offset_hours))?;

        let mut config = AuthConfig::new()
            .with_relying_party_origin(&self.rp_origin)
            .with_session_idle_seconds(self.session_idle_seconds)
            .with_utc_offset(offset)
            .with_escalate_on_anomaly(self.escalate_on_anomaly);
        if let Some(paths) = &self.honeypot_paths {
            config = config.with_honeypot_paths(paths.clone());
        }
        if let Some(proxies) = &self.trusted_proxies {
            config = config.with_trusted_proxies(proxies.clone());
        }
        Ok(config)
    }
}

/// Build the engine from the on-disk user table and audit log.
///
/// # Errors
/// Returns an error if the audit log cannot be opened, the user table cannot
/// be loaded, or the bootstrap administrator is rejected.
pub fn build_engine(args: &Args) -> Result<AuthEngine> {
    let audit = JsonLinesAuditSink::open(&args.audit_log)
        .with_context(|| format!("could not open audit log {}", args.audit_log.display()))?;

    let engine = AuthEngine::builder(args.auth_config()?)
        .with_repository(Arc::new(JsonFileUserRepository::new(&args.users_file)))
        .with_delivery(Arc::new(LogDelivery))
        .with_audit_sink(Arc::new(audit))
        .with_audit_sink(Arc::new(TracingAuditSink))
        .build()
        .with_context(|| format!("could not load users from {}", args.users_file.display()))?;

    match &args.bootstrap_admin {
        Some(admin) => {
            if engine
                .bootstrap(admin)
                .context("bootstrap administrator rejected")?
            {
                info!(username = %admin.username, "bootstrap administrator created");
            }
        }
        None if engine.credentials().is_empty() => {
            info!("user table is empty and no bootstrap administrator was supplied");
        }
        None => {}
    }

    Ok(engine)
}

fn spawn_sweeper(engine: Arc<AuthEngine>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let report = engine.sweep();
            if report.total() > 0 {
                debug!(removed = report.total(), "sweeper pass");
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the engine cannot be built or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    debug!(
        port = args.port,
        users_file = %args.users_file.display(),
        audit_log = %args.audit_log.display(),
        rp_origin = %args.rp_origin,
        "starting"
    );

    let engine = Arc::new(build_engine(&args)?);

    let sweeper = (args.sweep_interval > 0)
        .then(|| spawn_sweeper(engine.clone(), Duration::from_secs(args.sweep_interval)));

    let result = api::serve(args.port, engine, shutdown_signal()).await;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    telemetry::shutdown_tracer();

    result
}
