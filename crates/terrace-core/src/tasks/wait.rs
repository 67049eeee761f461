//! Polling waits for eventually-consistent external state.

use super::Task;
use crate::error::{Result, TerraceError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Evaluate `predicate` every `interval` until it returns `Ok(true)`.
///
/// Predicate errors count as "not yet". Cancelling `cancel` ends the wait
/// without an error, including while a check is still in flight.
pub async fn poll_until<P, Fut>(
    description: &str,
    interval: Duration,
    cancel: &CancellationToken,
    mut predicate: P,
) -> Result<()>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let checked = tokio::select! {
            _ = cancel.cancelled() => None,
            res = predicate() => Some(res),
        };
        match checked {
            None => {
                info!(wait = description, "wait cancelled");
                return Ok(());
            }
            Some(Ok(true)) => {
                info!(wait = description, attempt, "condition met");
                return Ok(());
            }
            Some(Ok(false)) => debug!(wait = description, attempt, "not yet"),
            Some(Err(e)) => debug!(wait = description, attempt, error = %e, "check failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(wait = description, "wait cancelled");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Leaf task wrapping [`poll_until`].
pub fn wait_for<P, Fut>(
    name: impl Into<String>,
    interval: Duration,
    cancel: CancellationToken,
    predicate: P,
) -> Task
where
    P: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    let name = name.into();
    let description = name.clone();
    Task::leaf(name, move || async move {
        poll_until(&description, interval, &cancel, predicate).await
    })
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolves through the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| TerraceError::external("dns", format!("{host}: {e}")))?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// True once `host` resolves to at least every address in `expected`.
pub fn dns_propagated(
    resolver: Arc<dyn Resolver>,
    host: impl Into<String>,
    expected: Vec<IpAddr>,
) -> impl FnMut() -> BoxFuture<'static, Result<bool>> + Send + 'static {
    let host = host.into();
    move || {
        let resolver = resolver.clone();
        let host = host.clone();
        let expected = expected.clone();
        async move {
            let got: HashSet<IpAddr> = resolver.lookup(&host).await?.into_iter().collect();
            debug!(host = %host, resolved = ?got, "dns lookup");
            Ok(expected.iter().all(|ip| got.contains(ip)))
        }
        .boxed()
    }
}

/// True once `url` answers with anything but a server error.
pub fn https_reachable(
    client: reqwest::Client,
    url: impl Into<String>,
) -> impl FnMut() -> BoxFuture<'static, Result<bool>> + Send + 'static {
    let url = url.into();
    move || {
        let client = client.clone();
        let url = url.clone();
        async move {
            let resp = client
                .get(&url)
                .send()
                .await
                .map_err(|e| TerraceError::external("http", e))?;
            Ok(!resp.status().is_server_error())
        }
        .boxed()
    }
}
