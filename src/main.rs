use anyhow::{Result, bail};
use axum::Router;
use chrono::{TimeDelta, Utc};
use dedup_store::{
    config::{AppConfig, RunMode},
    handlers::AppState,
    models::Options,
    routes,
    services::{
        access::{AccessControl, AllowAll, Ctx, ReadOnly},
        data_adapter::{DataAdapter, FsDataAdapter},
        gc::{self, GcPolicy, Reconciler},
        handler::{Handler, RwHandler},
        idgen::SnowflakeIdSource,
        layers::{HandlerBuilder, TraceLayer},
        metadata_adapter::{MetadataAdapter, SqliteMetadataAdapter},
    },
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (cfg, mode) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting dedup-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Ensure the database directory exists ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let acl: Arc<dyn AccessControl> = if cfg.read_only {
        Arc::new(ReadOnly)
    } else {
        Arc::new(AllowAll)
    };

    let sqlite = SqliteMetadataAdapter::connect(&cfg.database_url, acl.clone()).await?;
    sqlite.migrate().await?;
    if mode == RunMode::Migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }
    let db = sqlite.db.clone();

    // --- Compose the handler ---
    let meta: Arc<dyn MetadataAdapter> = Arc::new(sqlite);
    let data: Arc<dyn DataAdapter> = Arc::new(FsDataAdapter::new(&cfg.storage_dir, acl));
    let ids = Arc::new(SnowflakeIdSource::new(cfg.node_id)?);
    let core: Arc<dyn Handler> = Arc::new(RwHandler::new(meta.clone(), data.clone(), ids));
    let handler = HandlerBuilder::new(core).layer(TraceLayer).build();
    handler.configure(Options {
        sync_writes: cfg.sync_writes,
    });

    let reconciler = Arc::new(Reconciler::new(
        meta,
        data,
        GcPolicy {
            grace: TimeDelta::seconds(cfg.gc_grace_secs),
        },
    ));

    // --- One-shot consistency check ---
    if mode == RunMode::GcCheck {
        let reports = reconciler.run_all(&Ctx::system(), Utc::now(), false).await?;
        let mut failures = 0usize;
        for report in &reports {
            tracing::info!("{}", serde_json::to_string(report)?);
            if let Err(err) = report.ensure_consistent() {
                tracing::error!("{}", err);
                failures += 1;
            }
        }
        handler.close().await;
        if failures > 0 {
            bail!("{} of {} buckets are inconsistent", failures, reports.len());
        }
        return Ok(());
    }

    let gc_task = (cfg.gc_interval_secs > 0).then(|| {
        // Read-only stores cannot remove anything, so their passes only report.
        gc::spawn_background(
            reconciler,
            Duration::from_secs(cfg.gc_interval_secs),
            !cfg.read_only,
        )
    });

    // --- Build router ---
    let state = AppState {
        handler: handler.clone(),
        db,
        storage_dir: cfg.storage_dir.clone().into(),
    };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    if let Some(task) = gc_task {
        task.abort();
    }
    handler.close().await;
    Ok(())
}
