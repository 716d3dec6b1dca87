//! Static credential rotation awaiter
//!
//! Some credential engines briefly report a rolled-over TTL around a rotation
//! boundary. A read taken inside the same rotation as the last sync can't be
//! trusted until the TTL is observably counting down again, or a new rotation
//! shows up.

use crate::backoff::ExponentialBackoff;
use crate::config::schema::{BackoffConfig, RotationConfig};
use crate::error::{CredsyncError, CredsyncResult};
use crate::source::{CredentialSource, SecretResponse};
use crate::task::StaticCredsMeta;
use tracing::{debug, info};

const ROTATION_MULTIPLIER: f64 = 1.5;

/// Wait out an in-progress rotation.
///
/// Returns the read as-is when there is nothing to await: no previous record,
/// a different rotation than last time, or a previous record without rotation
/// settings. Otherwise re-reads `path` until a new rotation appears or the TTL
/// is above `ttl_slack` and below the previously recorded TTL.
///
/// On exhausting the retry budget returns [`CredsyncError::RotationInProgress`]
/// and `initial` is left untouched.
pub async fn await_rotation(
    source: &dyn CredentialSource,
    path: &str,
    previous: Option<&StaticCredsMeta>,
    initial: &SecretResponse,
    config: &RotationConfig,
) -> CredsyncResult<(StaticCredsMeta, SecretResponse)> {
    let meta = static_meta(path, initial)?;

    let Some(prev) = previous.filter(|p| p.is_static() && p.last_rotation == meta.last_rotation)
    else {
        return Ok((meta, initial.clone()));
    };

    let mut backoff = ExponentialBackoff::new(&BackoffConfig {
        initial_interval: config.initial_interval,
        multiplier: ROTATION_MULTIPLIER,
        max_interval: config.max_interval,
        max_elapsed: Some(config.max_elapsed),
    });

    let mut meta = meta;
    let mut response = initial.clone();
    let mut attempts = 0u32;
    loop {
        if meta.last_rotation != prev.last_rotation {
            info!(
                path,
                attempts,
                last_rotation = meta.last_rotation,
                "Observed completed rotation"
            );
            return Ok((meta, response));
        }

        let too_close = meta.ttl() <= config.ttl_slack;
        let rolled_over = meta.ttl >= prev.ttl;
        if !too_close && !rolled_over {
            return Ok((meta, response));
        }

        let Some(delay) = backoff.next_backoff() else {
            debug!(path, attempts, ttl = meta.ttl, "Rotation retry budget exhausted");
            return Err(CredsyncError::RotationInProgress {
                path: path.to_string(),
            });
        };
        debug!(
            path,
            ttl = meta.ttl,
            previous_ttl = prev.ttl,
            delay_ms = delay.as_millis() as u64,
            "Rotation in progress, re-reading"
        );
        tokio::time::sleep(delay).await;

        attempts += 1;
        response = source.read(path).await?;
        meta = static_meta(path, &response)?;
    }
}

fn static_meta(path: &str, response: &SecretResponse) -> CredsyncResult<StaticCredsMeta> {
    StaticCredsMeta::from_data(&response.data).ok_or_else(|| {
        CredsyncError::source(path, "response carries no static credential metadata")
    })
}
