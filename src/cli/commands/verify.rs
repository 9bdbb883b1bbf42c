//! Verify command - check a cached identifier against the remote

use super::CacheSession;
use crate::cli::args::VerifyArgs;
use crate::config::Config;
use crate::error::CacheResult;
use crate::remote::{DestinationKey, RemoteError, RemoteOutcome};
use crate::ui::{self, UiContext};

/// Execute the verify command
///
/// Resolves the file, then asks the remote whether the identifier still
/// exists. A missing identifier is forgotten and the file uploaded again.
pub async fn execute(args: VerifyArgs, config: &Config) -> CacheResult<()> {
    let ctx = UiContext::detect();
    let destination = DestinationKey::from(args.dest);

    let session = CacheSession::open(config, false).await?;
    let coordinator = session.coordinator(config);
    let remote = coordinator.uploader().clone();

    let id = coordinator
        .with_remote(&args.path, &destination, |id| {
            let remote = remote.clone();
            let destination = destination.clone();
            async move {
                if remote.exists(&destination, &id).await {
                    Ok::<_, RemoteError>(RemoteOutcome::Ok(id))
                } else {
                    Ok(RemoteOutcome::NotFound)
                }
            }
        })
        .await?;

    ui::step_ok_detail(
        &ctx,
        &format!("{} is present on {}", args.path.display(), destination),
        id.as_str(),
    );

    session.close().await
}
