//! Confirmation prompt with a non-interactive fallback

use super::context::UiContext;
use crate::error::{CacheError, CacheResult};

/// Ask a yes/no question
///
/// `--yes` answers true; without a terminal the default is returned.
pub async fn confirm(ctx: &UiContext, message: &str, default: bool) -> CacheResult<bool> {
    if ctx.auto_yes() {
        return Ok(true);
    }
    if !ctx.is_interactive() {
        return Ok(default);
    }

    let message = message.to_string();
    tokio::task::spawn_blocking(move || {
        cliclack::confirm(&message)
            .initial_value(default)
            .interact()
    })
    .await
    .map_err(|e| CacheError::Internal(format!("prompt task failed: {}", e)))?
    .map_err(|e| CacheError::io("reading confirmation", e))
}
