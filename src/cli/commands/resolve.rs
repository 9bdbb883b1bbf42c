//! Resolve command - map files to remote identifiers

use super::CacheSession;
use crate::cli::args::{OutputFormat, ResolveArgs};
use crate::config::Config;
use crate::coordinator::Resolution;
use crate::error::{CacheError, CacheResult};
use crate::remote::DestinationKey;
use crate::ui::{self, format_bytes, UiContext};
use console::style;
use std::collections::BTreeSet;

/// Execute the resolve command
pub async fn execute(args: ResolveArgs, config: &Config) -> CacheResult<()> {
    let ctx = UiContext::detect();
    let destinations: BTreeSet<DestinationKey> =
        args.dest.iter().copied().map(DestinationKey::from).collect();

    let session = CacheSession::open(config, args.no_cache).await?;
    let coordinator = session.coordinator(config);

    let mut resolutions = Vec::with_capacity(args.paths.len());
    let mut failed = 0usize;
    for path in &args.paths {
        match coordinator.resolve_or_upload(path, &destinations).await {
            Ok(resolution) => resolutions.push(resolution),
            Err(e) => {
                failed += 1;
                ui::step_error_detail(&ctx, &path.display().to_string(), &e.to_string());
                if let Some(hint) = e.hint() {
                    ui::remark(&ctx, hint);
                }
            }
        }
    }

    match args.format {
        OutputFormat::Table => print_table(&resolutions),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resolutions)?),
        OutputFormat::Plain => print_plain(&resolutions),
    }

    session.close().await?;

    if failed > 0 {
        return Err(CacheError::User(format!(
            "{} of {} file(s) could not be resolved",
            failed,
            args.paths.len()
        )));
    }
    Ok(())
}

fn print_table(resolutions: &[Resolution]) {
    if resolutions.is_empty() {
        return;
    }

    println!(
        "{:<32} {:<18} {:<40} {:<10} {:<8}",
        "FILE", "DESTINATION", "REMOTE ID", "SIZE", "STATUS"
    );
    println!("{}", "-".repeat(110));

    for resolution in resolutions {
        let name = resolution
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| resolution.path.display().to_string());

        for (destination, id) in &resolution.remote_ids {
            let status = if resolution.was_uploaded(destination) {
                style("uploaded").yellow().to_string()
            } else {
                style("cached").green().to_string()
            };
            println!(
                "{:<32} {:<18} {:<40} {:<10} {:<8}",
                name,
                destination,
                id,
                format_bytes(resolution.size_bytes),
                status
            );
        }
    }
}

/// `<path>\t<destination>\t<remote id>`, one line per destination
fn print_plain(resolutions: &[Resolution]) {
    for resolution in resolutions {
        for (destination, id) in &resolution.remote_ids {
            println!("{}\t{}\t{}", resolution.path.display(), destination, id);
        }
    }
}
