//! Host resolution and socket connect.
//!
//! A host name may resolve to several addresses. By default they are tried
//! one after another; with multi-subnet failover every address is dialled
//! at once and the first socket to connect wins.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Why no socket could be opened.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The caller cancelled the attempt.
    #[error("connection attempt cancelled")]
    Cancelled,

    /// Name resolution failed.
    #[error("could not resolve {host}: {source}")]
    Resolve {
        /// Host being resolved.
        host: String,
        /// Resolver error.
        #[source]
        source: io::Error,
    },

    /// The host resolved to nothing.
    #[error("{0} resolved to no addresses")]
    NoAddresses(String),

    /// Every address refused or failed.
    #[error("could not connect to any address: {}", format_failures(.0))]
    AllFailed(Vec<(SocketAddr, io::Error)>),
}

fn format_failures(failures: &[(SocketAddr, io::Error)]) -> String {
    failures
        .iter()
        .map(|(addr, e)| format!("{addr} ({e})"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse an IP literal, with or without IPv6 brackets.
fn ip_literal(host: &str) -> Option<IpAddr> {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.parse().ok()
}

/// Resolve `host:port`. IP literals skip the lookup.
pub async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, ConnectError> {
    if let Some(ip) = ip_literal(host) {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| ConnectError::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ConnectError::NoAddresses(host.to_string()));
    }
    tracing::debug!(host, count = addrs.len(), "host resolved");
    Ok(addrs)
}

/// Try each address in order until one connects.
pub async fn connect_sequential(
    addrs: &[SocketAddr],
    cancel: &CancellationToken,
) -> Result<TcpStream, ConnectError> {
    let mut failures = Vec::new();
    for &addr in addrs {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
            result = TcpStream::connect(addr) => result,
        };
        match result {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect failed");
                failures.push((addr, e));
            }
        }
    }
    Err(ConnectError::AllFailed(failures))
}

/// Dial every address at once. The first success wins and the remaining
/// attempts are aborted.
pub async fn connect_parallel(
    addrs: &[SocketAddr],
    cancel: &CancellationToken,
) -> Result<TcpStream, ConnectError> {
    race(addrs, cancel, TcpStream::connect).await
}

async fn race<T, F, Fut>(addrs: &[SocketAddr], cancel: &CancellationToken, dial: F) -> Result<T, ConnectError>
where
    T: Send + 'static,
    F: Fn(SocketAddr) -> Fut,
    Fut: Future<Output = io::Result<T>> + Send + 'static,
{
    let mut attempts = JoinSet::new();
    let mut dialled = HashMap::with_capacity(addrs.len());
    for &addr in addrs {
        let attempt = dial(addr);
        let handle = attempts.spawn(async move { (addr, attempt.await) });
        dialled.insert(handle.id(), addr);
    }

    let mut failures = Vec::new();
    loop {
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                attempts.abort_all();
                return Err(ConnectError::Cancelled);
            }
            joined = attempts.join_next() => joined,
        };
        match joined {
            None => return Err(ConnectError::AllFailed(failures)),
            Some(Ok((addr, Ok(stream)))) => {
                tracing::debug!(%addr, "parallel connect won");
                attempts.abort_all();
                return Ok(stream);
            }
            Some(Ok((addr, Err(e)))) => {
                tracing::debug!(%addr, error = %e, "connect failed");
                failures.push((addr, e));
            }
            Some(Err(join_error)) => {
                tracing::debug!(error = %join_error, "connect task ended abnormally");
                if let Some(addr) = dialled.get(&join_error.id()) {
                    failures.push((*addr, io::Error::other(join_error)));
                }
            }
        }
    }
}

/// Resolve and connect with the chosen strategy.
pub async fn connect(
    host: &str,
    port: u16,
    multi_subnet_failover: bool,
    cancel: &CancellationToken,
) -> Result<TcpStream, ConnectError> {
    let addrs = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
        addrs = resolve(host, port) => addrs?,
    };
    let stream = if multi_subnet_failover {
        connect_parallel(&addrs, cancel).await?
    } else {
        connect_sequential(&addrs, cancel).await?
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "could not set TCP_NODELAY");
    }
    Ok(stream)
}
