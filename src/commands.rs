// src/commands.rs
//! Command handlers for the depotkeep CLI

use anyhow::{Context, Result};
use depotkeep::catalog::{
    Catalog, HttpCatalog, HttpManifestSource, ManifestSource, MinIntervalThrottle, ThrottledCatalog,
};
use depotkeep::config::Config;
use depotkeep::keys::{KeyTable, SqliteKeyTable, parse_key_table_json};
use depotkeep::{DlcAnalyzer, FilesystemStore, Ingestor, ReconcileDaemon, Reconciler, StoreClient, TitleId};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_store(config: &Config) -> Result<StoreClient> {
    let store = FilesystemStore::new(&config.store.root);
    Ok(StoreClient::new(Arc::new(store)).with_retry(config.retry_policy()?))
}

fn open_keys(config: &Config) -> Result<Arc<dyn KeyTable>> {
    let table = SqliteKeyTable::open(&config.keys.db_path)
        .with_context(|| format!("Failed to open key table {}", config.keys.db_path.display()))?;
    Ok(Arc::new(table))
}

fn open_catalog(config: &Config) -> Result<Option<Arc<dyn Catalog>>> {
    let Some(base_url) = &config.catalog.base_url else {
        return Ok(None);
    };
    let http = HttpCatalog::new(base_url)?;
    let throttle = MinIntervalThrottle::new(config.catalog_min_interval()?);
    Ok(Some(Arc::new(ThrottledCatalog::new(Arc::new(http), Arc::new(throttle)))))
}

fn require_catalog(config: &Config) -> Result<Arc<dyn Catalog>> {
    open_catalog(config)?.context("catalog.base_url must be configured for this command")
}

fn open_manifest_source(config: &Config) -> Result<Arc<dyn ManifestSource>> {
    let base_url = config
        .manifests
        .base_url
        .as_deref()
        .context("manifests.base_url must be configured for reconciliation")?;
    Ok(Arc::new(HttpManifestSource::new(base_url)?))
}

fn build_reconciler(config: &Config) -> Result<Reconciler> {
    Ok(Reconciler::new(
        open_store(config)?,
        require_catalog(config)?,
        open_manifest_source(config)?,
        open_keys(config)?,
    ))
}

fn parse_title(raw: &str) -> Result<TitleId> {
    TitleId::parse(raw).with_context(|| format!("Invalid title ID '{raw}'"))
}

pub async fn cmd_ingest(config: &Config, archive: &Path) -> Result<()> {
    info!("Ingesting {}", archive.display());
    let mut ingestor = Ingestor::new(open_store(config)?, open_keys(config)?);
    if let Some(catalog) = open_catalog(config)? {
        ingestor = ingestor.with_catalog(catalog);
    }

    let report = ingestor
        .ingest_file(archive)
        .await
        .with_context(|| format!("Failed to ingest {}", archive.display()))?;
    print_json(&report)
}

pub async fn cmd_reconcile(config: &Config, title: Option<&str>) -> Result<()> {
    let reconciler = build_reconciler(config)?;

    match title {
        Some(raw) => {
            let title_id = parse_title(raw)?;
            match reconciler
                .reconcile_with_budget(&title_id, config.on_demand_budget()?)
                .await?
            {
                Some(outcome) => print_json(&outcome),
                None => {
                    eprintln!("Reconciliation of title {title_id} did not finish within its budget");
                    Ok(())
                }
            }
        }
        None => {
            let report = reconciler.run_pass().await?;
            print_json(&report)
        }
    }
}

pub async fn cmd_analyze(config: &Config, title: &str) -> Result<()> {
    let title_id = parse_title(title)?;
    let analyzer = DlcAnalyzer::new(open_store(config)?, require_catalog(config)?);

    match analyzer
        .analyze_with_budget(&title_id, config.analysis_budget()?)
        .await?
    {
        Some(report) => print_json(&report),
        None => {
            eprintln!("DLC analysis of title {title_id} did not finish within its budget");
            Ok(())
        }
    }
}

pub async fn cmd_daemon(config: &Config) -> Result<()> {
    if !config.reconcile.enabled {
        anyhow::bail!("Scheduled reconciliation is disabled (reconcile.enabled = false)");
    }

    let daemon = ReconcileDaemon::new(build_reconciler(config)?, config.reconcile_interval()?);
    println!("{}", daemon.scheduler().status_line());
    let handle = daemon.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    let passes = handle.shutdown().await?;
    println!("Reconcile daemon stopped after {passes} pass(es)");
    Ok(())
}

pub fn cmd_keys_import(config: &Config, file: &Path) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let entries = parse_key_table_json(&data).with_context(|| format!("Invalid key table {}", file.display()))?;

    let table = open_keys(config)?;
    let written = table.put_many(&entries)?;
    println!("Imported {} key(s); key table now holds {}", written, table.len()?);
    Ok(())
}

pub fn cmd_keys_get(config: &Config, depot: &str) -> Result<()> {
    let table = open_keys(config)?;
    match table.get(depot.trim())? {
        Some(key) => {
            println!("{key}");
            Ok(())
        }
        None => anyhow::bail!("No key stored for depot {}", depot),
    }
}
