//! Asynchronous DNS lookups used by trust evaluation.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

/// Resolves a hostname into IP addresses without blocking the caller.
pub trait DnsResolver: Send + Sync + std::fmt::Debug {
    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>>;
}

/// Resolver backed by the operating system (`getaddrinfo`).
///
/// Tokio runs the lookup on its blocking pool, so I/O tasks are never stalled.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl DnsResolver for SystemResolver {
    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        async move {
            let addrs = tokio::net::lookup_host((host, 0)).await?;
            Ok(addrs.map(|addr| addr.ip()).collect())
        }
        .boxed()
    }
}

/// Look up `host`, bounded by `timeout`.
///
/// Timeouts and empty answers are reported as errors, so callers can treat
/// every non-success the same way.
pub async fn lookup_with_timeout(
    resolver: &dyn DnsResolver,
    host: &str,
    timeout: Duration,
) -> io::Result<Vec<IpAddr>> {
    let addrs = match tokio::time::timeout(timeout, resolver.lookup(host)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("DNS lookup for '{}' timed out after {:?}", host, timeout),
            ))
        }
    };

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("DNS lookup for '{}' returned no addresses", host),
        ));
    }

    Ok(addrs.into_iter().map(|ip| ip.to_canonical()).collect())
}
