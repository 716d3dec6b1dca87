//! Cache-key command - show how a client identity is keyed

use crate::cli::args::CacheKeyArgs;
use crate::cli::output;
use crate::error::{CredsyncError, CredsyncResult};
use crate::source::ClientCacheKey;

/// Execute the cache-key command
pub async fn execute(args: CacheKeyArgs) -> CredsyncResult<()> {
    let key = compute(&args)?;

    output::key_value("key", &key.to_string());
    output::key_value("parent", &key.parent().to_string());
    output::key_value("method", key.method());
    output::key_value("config hash", key.config_hash());
    if let Some(ns) = key.namespace() {
        output::key_value("namespace", ns);
    }

    Ok(())
}

fn compute(args: &CacheKeyArgs) -> CredsyncResult<ClientCacheKey> {
    let auth_config: serde_json::Value = serde_json::from_str(&args.auth_config)
        .map_err(|e| CredsyncError::field("auth-config", e.to_string()))?;
    ClientCacheKey::compute(&args.method, &auth_config, args.namespace.as_deref())
}
