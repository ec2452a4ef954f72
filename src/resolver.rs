//! The resolver interface the plaintext stream consumes. The core does not implement DNS
//! resolution itself (§1, Non-goals) — it only consumes this trait.

use std::future::Future;
use std::pin::Pin;

use crate::address::{AddressList, Destination};
use crate::error::Result;

/// A boxed future, matching the crate-wide convention used anywhere a trait needs to return an
/// `async fn`-shaped result without depending on `async-trait` (see the Open Question in
/// SPEC_FULL.md §9 on trait object safety).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Resolves a [`Destination`] into an [`AddressList`].
pub trait Resolver: Send + Sync {
    fn resolve(&self, destination: &Destination) -> BoxFuture<'_, Result<AddressList>>;
}

/// The default resolver: delegates to the OS stub resolver via `tokio::net::lookup_host`. No
/// extra dependency, and sufficient for the common case.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioResolver;

impl Resolver for TokioResolver {
    fn resolve(&self, destination: &Destination) -> BoxFuture<'_, Result<AddressList>> {
        let host = destination.host.clone();
        let port = destination.port;
        Box::pin(async move {
            let addrs: Vec<_> = tokio::net::lookup_host((host.as_str(), port))
                .await?
                .collect();
            if addrs.is_empty() {
                return Err(crate::error::Error::no_dns_results(format!("{host}:{port}")));
            }
            Ok(AddressList::from_resolved(addrs))
        })
    }
}

/// A resolver backed by `hickory-resolver`, for callers who want resolution that does not
/// depend on the OS's own stub resolver configuration. Gated behind the `dns-resolver` feature,
/// mirroring the teacher's own optional `hickory-resolver` dependency split.
#[cfg(feature = "dns-resolver")]
pub struct HickoryResolver {
    inner: hickory_resolver::TokioResolver,
}

#[cfg(feature = "dns-resolver")]
impl HickoryResolver {
    pub fn from_system_conf() -> Result<Self> {
        let inner = hickory_resolver::TokioResolver::builder_tokio()
            .map_err(|e| crate::error::Error::internal(e.to_string()))?
            .build();
        Ok(Self { inner })
    }
}

#[cfg(feature = "dns-resolver")]
impl Resolver for HickoryResolver {
    fn resolve(&self, destination: &Destination) -> BoxFuture<'_, Result<AddressList>> {
        let host = destination.host.clone();
        let port = destination.port;
        Box::pin(async move {
            let lookup = self
                .inner
                .lookup_ip(host.as_str())
                .await
                .map_err(|e| crate::error::Error::internal(e.to_string()))?;
            let addrs: Vec<_> = lookup.iter().map(|ip| (ip, port).into()).collect();
            if addrs.is_empty() {
                return Err(crate::error::Error::no_dns_results(format!("{host}:{port}")));
            }
            Ok(AddressList::from_resolved(addrs))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn tokio_resolver_resolves_localhost() {
        let resolver = TokioResolver;
        let dest = Destination::new("localhost", 0);
        let list = resolver.resolve(&dest).await.expect("localhost resolves");
        assert!(!list.is_empty());
    }
}
