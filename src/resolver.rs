//! Hostname to IPv4 resolution with a process-lifetime cache

use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to resolve {host}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no IPv4 address found for {host}")]
    NoAddress { host: String },
}

/// Source of A records.
#[async_trait]
pub trait Lookup: Send + Sync {
    async fn lookup_ipv4(&self, host: &str) -> io::Result<Vec<Ipv4Addr>>;
}

/// Lookup through the operating system resolver
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

#[async_trait]
impl Lookup for SystemLookup {
    async fn lookup_ipv4(&self, host: &str) -> io::Result<Vec<Ipv4Addr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .collect())
    }
}

/// Memoizing resolver shared by all connections
pub struct AddressResolver {
    lookup: Arc<dyn Lookup>,
    cache: DashMap<String, Ipv4Addr>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl AddressResolver {
    pub fn new(lookup: Arc<dyn Lookup>) -> Self {
        let cache = DashMap::new();
        cache.insert("localhost".to_string(), Ipv4Addr::LOCALHOST);

        Self {
            lookup,
            cache,
            in_flight: DashMap::new(),
        }
    }

    /// Resolver backed by the system lookup
    pub fn system() -> Self {
        Self::new(Arc::new(SystemLookup))
    }

    pub fn cached(&self, host: &str) -> Option<Ipv4Addr> {
        self.cache.get(host).map(|entry| *entry.value())
    }

    /// Resolve `host`, consulting the cache first.
    ///
    /// Failures are not cached; the next call retries the lookup.
    pub async fn resolve(&self, host: &str) -> Result<Ipv4Addr, ResolveError> {
        if let Some(ip) = self.cached(host) {
            return Ok(ip);
        }

        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(ip);
        }

        let lock = self
            .in_flight
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let result = match self.cached(host) {
            Some(ip) => Ok(ip),
            None => self.lookup_uncached(host).await,
        };

        // Keep the entry while other callers still hold or wait on it
        self.in_flight
            .remove_if(host, |_, entry| Arc::strong_count(entry) <= 2);
        result
    }

    async fn lookup_uncached(&self, host: &str) -> Result<Ipv4Addr, ResolveError> {
        let addrs = self
            .lookup
            .lookup_ipv4(host)
            .await
            .map_err(|source| ResolveError::Lookup {
                host: host.to_string(),
                source,
            })?;

        let ip = addrs.first().copied().ok_or_else(|| ResolveError::NoAddress {
            host: host.to_string(),
        })?;

        debug!("Resolved {} to {}", host, ip);
        self.cache.insert(host.to_string(), ip);
        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct StubLookup {
        records: HashMap<String, Vec<Ipv4Addr>>,
        calls: AtomicUsize,
    }

    impl StubLookup {
        fn with(host: &str, ips: &[Ipv4Addr]) -> Self {
            let mut records = HashMap::new();
            records.insert(host.to_string(), ips.to_vec());
            Self {
                records,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Lookup for StubLookup {
        async fn lookup_ipv4(&self, host: &str) -> io::Result<Vec<Ipv4Addr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.records
                .get(host)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"))
        }
    }

    #[tokio::test]
    async fn test_resolve_caches_first_address() {
        let first = Ipv4Addr::new(203, 0, 113, 5);
        let lookup = Arc::new(StubLookup::with("example.test", &[first, Ipv4Addr::new(203, 0, 113, 6)]));
        let resolver = AddressResolver::new(lookup.clone());

        assert_eq!(resolver.resolve("example.test").await.unwrap(), first);
        assert_eq!(resolver.resolve("example.test").await.unwrap(), first);
        assert_eq!(resolver.cached("example.test"), Some(first));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_localhost_is_seeded() {
        let lookup = Arc::new(StubLookup::default());
        let resolver = AddressResolver::new(lookup.clone());

        assert_eq!(resolver.resolve("localhost").await.unwrap(), Ipv4Addr::LOCALHOST);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ip_literal_skips_lookup() {
        let lookup = Arc::new(StubLookup::default());
        let resolver = AddressResolver::new(lookup.clone());

        assert_eq!(
            resolver.resolve("192.0.2.7").await.unwrap(),
            Ipv4Addr::new(192, 0, 2, 7)
        );
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
        assert!(resolver.cached("192.0.2.7").is_none());
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let lookup = Arc::new(StubLookup::default());
        let resolver = AddressResolver::new(lookup.clone());

        let err = resolver.resolve("missing.test").await.unwrap_err();
        assert!(matches!(err, ResolveError::Lookup { .. }));
        assert!(err.to_string().contains("missing.test"));

        assert!(resolver.resolve("missing.test").await.is_err());
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
        assert!(resolver.cached("missing.test").is_none());
    }

    #[tokio::test]
    async fn test_empty_answer_is_an_error() {
        let lookup = Arc::new(StubLookup::with("empty.test", &[]));
        let resolver = AddressResolver::new(lookup);

        assert!(matches!(
            resolver.resolve("empty.test").await,
            Err(ResolveError::NoAddress { .. })
        ));
    }

    /// Fails its first lookup; tracks how many lookups overlap
    #[derive(Default)]
    struct FlakyLookup {
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    #[async_trait]
    impl Lookup for FlakyLookup {
        async fn lookup_ipv4(&self, _host: &str) -> io::Result<Vec<Ipv4Addr>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(100)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if call == 0 {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "temporary failure"));
            }
            Ok(vec![Ipv4Addr::new(198, 51, 100, 9)])
        }
    }

    #[tokio::test]
    async fn test_retry_after_failure_stays_serialized() {
        let lookup = Arc::new(FlakyLookup::default());
        let resolver = Arc::new(AddressResolver::new(lookup.clone()));

        let tasks: Vec<_> = [0u64, 20, 120]
            .into_iter()
            .map(|delay| {
                let resolver = resolver.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    resolver.resolve("flaky.test").await.is_ok()
                })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(results, vec![false, true, true]);
        assert_eq!(lookup.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
        assert!(resolver.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_lookup() {
        let ip = Ipv4Addr::new(198, 51, 100, 1);
        let lookup = Arc::new(StubLookup::with("shared.test", &[ip]));
        let resolver = Arc::new(AddressResolver::new(lookup.clone()));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve("shared.test").await.unwrap() })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), ip);
        }
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }
}
