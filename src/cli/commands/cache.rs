//! Cache command - inspect and maintain the upload cache

use super::log_sweep;
use crate::activity::ActivityLog;
use crate::cache::{CacheEntry, CacheHandles, SweepReport};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::Config;
use crate::error::{CacheError, CacheResult};
use crate::ui::{self, format_bytes, UiContext};
use chrono::{Duration, Utc};
use console::style;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> CacheResult<()> {
    let ctx = UiContext::detect();

    match args.action {
        CacheAction::Stats { format } => match open_active(&ctx, config)? {
            Some(handles) => stats(&ctx, &handles, config, format),
            None => Ok(()),
        },
        CacheAction::List { format } => match open_active(&ctx, config)? {
            Some(handles) => list(&handles, format),
            None => Ok(()),
        },
        CacheAction::Gc { days, dry_run } => match open_active(&ctx, config)? {
            Some(handles) => gc(&ctx, &handles, config, days, dry_run).await,
            None => Ok(()),
        },
        CacheAction::Clear { yes } => clear(&ctx.with_auto_yes(yes), config).await,
        CacheAction::Path => {
            println!("{}", config.cache.database_path().display());
            Ok(())
        }
    }
}

fn open_active(ctx: &UiContext, config: &Config) -> CacheResult<Option<CacheHandles>> {
    let handles = CacheHandles::open_configured(&config.cache)?;
    match (&handles, config.cache.enabled) {
        (Some(_), _) => {}
        (None, false) => ui::step_warn_hint(
            ctx,
            "Upload cache is disabled",
            "Set cache.enabled = true to use it",
        ),
        (None, true) => ui::step_warn_hint(
            ctx,
            "Cache database is unreadable and being bypassed",
            "Run `attach-cache cache clear --yes` to reset it",
        ),
    }
    Ok(handles)
}

#[derive(Serialize)]
struct StatsJson {
    database: String,
    entries: u64,
    destinations: u64,
    total_bytes: u64,
    signatures: u64,
}

fn stats(
    ctx: &UiContext,
    handles: &CacheHandles,
    config: &Config,
    format: OutputFormat,
) -> CacheResult<()> {
    let stats = handles.store.stats()?;
    let signatures = handles.signatures.count()?;
    let database = config.cache.database_path();

    match format {
        OutputFormat::Json => {
            let json = StatsJson {
                database: database.display().to_string(),
                entries: stats.entries,
                destinations: stats.destinations,
                total_bytes: stats.total_bytes,
                signatures,
            };
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Plain => {
            println!("entries\t{}", stats.entries);
            println!("destinations\t{}", stats.destinations);
            println!("total_bytes\t{}", stats.total_bytes);
            println!("signatures\t{}", signatures);
        }
        OutputFormat::Table => {
            ui::section(ctx, "Upload cache");
            ui::key_value(ctx, "Database", &database.display().to_string());
            ui::key_value(ctx, "Entries", &stats.entries.to_string());
            ui::key_value(ctx, "Remote identifiers", &stats.destinations.to_string());
            ui::key_value(ctx, "Content size", &format_bytes(stats.total_bytes));
            ui::key_value(ctx, "Path signatures", &signatures.to_string());
            ui::key_value(
                ctx,
                "Retention",
                &retention_summary(config.cache.ttl_days, config.cache.max_total_mb),
            );
        }
    }
    Ok(())
}

fn retention_summary(ttl_days: u32, max_total_mb: u64) -> String {
    let age = match ttl_days {
        0 => "no age limit".to_string(),
        days => format!("{} days", days),
    };
    match max_total_mb {
        0 => age,
        mb => format!("{}, {} MB max", age, mb),
    }
}

fn list(handles: &CacheHandles, format: OutputFormat) -> CacheResult<()> {
    let entries = handles.store.list()?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{}", entry.digest);
            }
        }
        OutputFormat::Table => print_entry_table(&entries),
    }
    Ok(())
}

fn print_entry_table(entries: &[CacheEntry]) {
    if entries.is_empty() {
        println!("No cache entries.");
        return;
    }

    println!(
        "{:<20} {:<10} {:<44} {:<17}",
        "DIGEST", "SIZE", "DESTINATIONS", "LAST USED"
    );
    println!("{}", "-".repeat(92));

    for entry in entries {
        let destinations = entry
            .remote_ids
            .keys()
            .map(|d| d.as_str())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<20} {:<10} {:<44} {:<17}",
            entry.digest.short(),
            format_bytes(entry.size_bytes),
            destinations,
            entry.last_accessed_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!("Total: {} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
}

/// Remove expired entries, then enforce the size bound
async fn gc(
    ctx: &UiContext,
    handles: &CacheHandles,
    config: &Config,
    days_override: Option<u32>,
    dry_run: bool,
) -> CacheResult<()> {
    let days = days_override.unwrap_or(config.cache.ttl_days);
    let max_bytes = config.cache.max_total_mb.saturating_mul(1024 * 1024);
    if days == 0 && max_bytes == 0 {
        println!("Cache GC is disabled (ttl_days = 0, max_total_mb = 0)");
        return Ok(());
    }

    let retention = handles.retention();
    let now = Utc::now();

    if dry_run {
        if days == 0 {
            println!("Age eviction is disabled (ttl_days = 0); only the size bound applies.");
            return Ok(());
        }
        let max_age = Duration::days(i64::from(days));
        let planned = retention.plan_sweep(now, max_age)?;
        if planned.is_empty() {
            println!("No cache entries older than {} days.", days);
            return Ok(());
        }
        println!("Would remove {} entr(ies) older than {} days:", planned.len(), days);
        for entry in &planned {
            println!(
                "  {} {} ({} days old)",
                style("•").red(),
                entry.digest.short(),
                (now - entry.created_at).num_days()
            );
        }
        println!();
        println!("Dry run - nothing removed.");
        return Ok(());
    }

    let activity = ActivityLog::new(config);
    let mut reports: Vec<SweepReport> = Vec::new();
    if days > 0 {
        reports.push(retention.sweep(now, Duration::days(i64::from(days)), true)?);
    }
    if max_bytes > 0 {
        reports.push(retention.enforce_size_limit(max_bytes)?);
    }
    for report in &reports {
        log_sweep(&activity, report).await;
    }
    let removed: usize = reports.iter().map(|r| r.removed).sum();
    let freed_bytes: u64 = reports.iter().map(|r| r.freed_bytes).sum();
    let signatures_pruned: usize = reports.iter().map(|r| r.signatures_pruned).sum();

    if removed == 0 {
        ui::step_info(ctx, "Nothing to remove");
    } else {
        ui::step_ok_detail(
            ctx,
            &format!("Removed {} cache entr(ies)", removed),
            &format_bytes(freed_bytes),
        );
    }
    if signatures_pruned > 0 {
        ui::remark(
            ctx,
            &format!("Pruned {} signature(s) of deleted files", signatures_pruned),
        );
    }
    Ok(())
}

/// Forget everything, including an unreadable database
async fn clear(ctx: &UiContext, config: &Config) -> CacheResult<()> {
    let database = config.cache.database_path();
    let activity = ActivityLog::new(config);

    let handles = match CacheHandles::open_configured(&config.cache) {
        Ok(Some(handles)) => handles,
        Ok(None) if !config.cache.enabled => {
            println!("Upload cache is disabled; nothing to clear.");
            return Ok(());
        }
        Ok(None) | Err(CacheError::StoreCorruption { .. }) => {
            return remove_database(ctx, &database, &activity).await;
        }
        Err(e) => return Err(e),
    };

    let stats = handles.store.stats()?;
    if stats.entries == 0 && handles.signatures.count()? == 0 {
        println!("Upload cache is already empty.");
        return Ok(());
    }

    let question = format!("Forget {} cached upload(s)?", stats.entries);
    if !ui::confirm(ctx, &question, false).await? {
        println!("Aborted.");
        return Ok(());
    }

    let removed = handles.store.clear()?;
    let signatures = handles.signatures.clear()?;
    activity
        .log("cache.cleared", || {
            serde_json::json!({ "entries": removed, "signatures": signatures })
        })
        .await;

    ui::step_ok(ctx, &format!("Cleared {} cache entr(ies)", removed));
    Ok(())
}

/// Delete an unreadable database together with its WAL files
async fn remove_database(
    ctx: &UiContext,
    database: &Path,
    activity: &ActivityLog,
) -> CacheResult<()> {
    if !ui::confirm(ctx, "Cache database is unreadable. Delete it?", false).await? {
        println!("Aborted.");
        return Ok(());
    }

    for suffix in ["", "-wal", "-shm"] {
        let mut name = database.as_os_str().to_owned();
        name.push(suffix);
        match tokio::fs::remove_file(&name).await {
            Ok(()) => debug!("Removed {:?}", name),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CacheError::io(format!("removing {:?}", name), e));
            }
        }
    }

    activity
        .log("cache.cleared", || {
            serde_json::json!({ "database": database.display().to_string(), "corrupt": true })
        })
        .await;
    ui::step_ok_detail(ctx, "Removed cache database", &database.display().to_string());
    Ok(())
}
