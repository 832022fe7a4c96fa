use crate::oauth_issuer::OAuthIssuer;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Background expiry sweep interval.
const TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Periodically hard-delete expired authorization codes and expired
/// non-revoked tokens. Revoked rows are kept as evidence and are never
/// swept.
pub fn spawn_token_retention_task(issuer: OAuthIssuer, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(TOKEN_SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    match issuer.cleanup_expired().await {
                        Ok(stats) if stats.total() > 0 => {
                            tracing::info!(
                                authorization_codes = stats.authorization_codes,
                                access_tokens = stats.access_tokens,
                                refresh_tokens = stats.refresh_tokens,
                                "token retention sweep deleted rows"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "token retention sweep failed");
                        }
                    }
                }
            }
        }
    });
}
