//! Explicit call-site caching.

use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::coordinator::{CacheCoordinator, SetOptions};
use super::keys::CacheKey;

/// Return the cached value for `key`, or run `compute`, cache its result
/// with `options` and return it.
///
/// Errors from `compute` are returned untouched and nothing is cached. A
/// failed cache write is logged; the computed value is still returned.
///
/// ```ignore
/// let totals = with_cache(&cache, &cache.key("vendor_totals"), options, || async {
///     source.vendor_totals().await
/// })
/// .await?;
/// ```
pub async fn with_cache<T, E, F, Fut>(
    cache: &CacheCoordinator,
    key: &CacheKey,
    options: SetOptions,
    compute: F,
) -> Result<T, E>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if let Some(hit) = cache.get::<T>(key).await {
        return Ok(hit);
    }

    let value = compute().await?;
    if let Err(err) = cache.set(key, &value, options).await {
        warn!(%key, error = %err, "with_cache: result not cached");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::cache::CacheConfig;

    #[tokio::test]
    async fn computes_once_then_serves_from_cache() {
        let cache = CacheCoordinator::local_only(CacheConfig::default());
        let key = cache.key("vendor_totals");
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: Result<u64, String> = with_cache(
                &cache,
                &key,
                SetOptions::new().ttl(Duration::from_secs(60)),
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                },
            )
            .await;
            assert_eq!(value, Ok(42));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache = CacheCoordinator::local_only(CacheConfig::default());
        let key = cache.key("flaky");

        let first: Result<u64, &str> =
            with_cache(&cache, &key, SetOptions::new(), || async { Err("down") }).await;
        assert_eq!(first, Err("down"));

        let second: Result<u64, &str> =
            with_cache(&cache, &key, SetOptions::new(), || async { Ok(7) }).await;
        assert_eq!(second, Ok(7));
    }
}
