//! Provider HTTP calls with rate-limit handling.

use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tracing::warn;

use crate::auth::Provider;
use crate::error::SyncError;

const MAX_SERVER_RETRIES: u32 = 3;

/// Send a request with exponential backoff for rate limiting.
///
/// 429 honours `Retry-After`, 5xx is retried a few times, 401 means the
/// credential is gone. Anything else non-2xx becomes `SyncError::Provider`.
pub async fn call_with_backoff<F>(
    provider: Provider,
    channel_id: &str,
    max_retries: u32,
    mut builder_fn: F,
) -> Result<reqwest::Response>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut retries = 0;
    let mut server_retries = 0;
    let mut delay = Duration::from_secs(1);
    let name = provider.as_str();

    loop {
        let response = builder_fn()
            .send()
            .await
            .map_err(|e| SyncError::provider(name, None, e.to_string()))?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        if status.as_u16() == 429 {
            if retries >= max_retries {
                return Err(SyncError::provider(
                    name,
                    Some(429),
                    format!("rate limited after {} retries", retries),
                )
                .into());
            }

            let wait = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(delay);

            warn!("{}: rate limited, waiting {:?}", name, wait);
            sleep(wait).await;

            retries += 1;
            delay = std::cmp::min(delay * 2, Duration::from_secs(60));
            continue;
        }

        if status.is_server_error() && server_retries < MAX_SERVER_RETRIES {
            warn!("{}: server error {}, retrying...", name, status);
            sleep(delay).await;
            server_retries += 1;
            delay *= 2;
            continue;
        }

        if status.as_u16() == 401 {
            return Err(SyncError::AuthUnavailable {
                provider,
                channel_id: channel_id.to_string(),
            }
            .into());
        }

        let body = response.text().await.unwrap_or_default();
        let message = if status.as_u16() == 403 {
            format!("access forbidden, check permissions: {}", body)
        } else {
            body
        };
        return Err(SyncError::provider(name, Some(status.as_u16()), message).into());
    }
}
