//! Name resolution with positive caching
//!
//! The SOCKS frontend resolves CONNECT targets before dialing them through
//! the tunnel. Successful answers are cached with a TTL; failures are
//! never cached. Concurrent misses for the same host may issue concurrent
//! upstream lookups — the cache-hit path is the contract, deduplication is
//! not.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{Error, Result};

/// Upstream used when no DNS server is configured
pub const DEFAULT_DNS_SERVER: &str = "8.8.8.8:53";

/// Cache lifetime used when the configured TTL is zero
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

/// Per-lookup timeout against the upstream server
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest UDP answer we accept
const MAX_RESPONSE_SIZE: usize = 4096;

/// Upstream lookup backend. Production resolves over UDP; tests count
/// calls instead.
#[async_trait]
pub trait Lookup: Send + Sync {
    /// Resolve `host` to its addresses, A records before AAAA.
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// A positive cache entry
#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    address: IpAddr,
    expires_at: Instant,
}

/// Resolver with TTL-based positive caching in front of a lookup backend.
pub struct CachingResolver {
    lookup: Arc<dyn Lookup>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl CachingResolver {
    /// Create a resolver against `dns_server` (default 8.8.8.8:53) caching
    /// answers for `ttl` (zero selects the 600 s default).
    pub fn new(dns_server: Option<SocketAddr>, ttl: Duration) -> Self {
        let server = dns_server.unwrap_or_else(|| {
            DEFAULT_DNS_SERVER.parse().expect("default DNS server literal")
        });
        Self::with_lookup(Arc::new(UdpLookup::new(server)), ttl)
    }

    /// Create a resolver over an explicit lookup backend.
    pub fn with_lookup(lookup: Arc<dyn Lookup>, ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_CACHE_TTL } else { ttl };
        Self {
            lookup,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve `host`, serving from the cache while the entry is fresh.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let now = Instant::now();
        {
            let cache = self.cache.read().expect("resolver cache poisoned");
            if let Some(entry) = cache.get(host) {
                if now < entry.expires_at {
                    return Ok(entry.address);
                }
            }
        }

        let addresses = self.lookup.lookup(host).await?;
        let address = *addresses
            .first()
            .ok_or_else(|| Error::Resolve(format!("no addresses for {host}")))?;

        let entry = CacheEntry {
            address,
            expires_at: now + self.ttl,
        };
        self.cache
            .write()
            .expect("resolver cache poisoned")
            .insert(host.to_string(), entry);
        debug!(host, %address, "cached DNS answer");

        Ok(address)
    }

    /// Drop all cached entries.
    pub fn clear(&self) {
        self.cache.write().expect("resolver cache poisoned").clear();
    }

    /// Number of live cache entries (expired ones included until replaced).
    pub fn len(&self) -> usize {
        self.cache.read().expect("resolver cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Production lookup: A and AAAA queries over UDP.
pub struct UdpLookup {
    server: SocketAddr,
}

impl UdpLookup {
    pub fn new(server: SocketAddr) -> Self {
        Self { server }
    }

    async fn query(&self, host: &str, record_type: RecordType) -> Result<Vec<IpAddr>> {
        let name = Name::from_utf8(host)
            .map_err(|e| Error::Resolve(format!("invalid hostname {host}: {e}")))?;

        let mut message = Message::new();
        message
            .set_id(rand::random::<u16>())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name, record_type));
        let wire = message
            .to_vec()
            .map_err(|e| Error::Resolve(format!("failed to encode query: {e}")))?;

        let bind: SocketAddr = if self.server.is_ipv6() {
            "[::]:0".parse().expect("literal addr")
        } else {
            "0.0.0.0:0".parse().expect("literal addr")
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.server).await?;
        socket.send(&wire).await?;

        let mut buf = [0u8; MAX_RESPONSE_SIZE];
        loop {
            let n = socket.recv(&mut buf).await?;
            let response = Message::from_vec(&buf[..n])
                .map_err(|e| Error::Resolve(format!("failed to decode answer: {e}")))?;
            if response.id() != message.id() {
                continue;
            }

            let mut addresses = Vec::new();
            for record in response.answers() {
                match record.data() {
                    Some(RData::A(a)) => addresses.push(IpAddr::V4(a.0)),
                    Some(RData::AAAA(aaaa)) => addresses.push(IpAddr::V6(aaaa.0)),
                    _ => {}
                }
            }
            return Ok(addresses);
        }
    }
}

#[async_trait]
impl Lookup for UdpLookup {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        let exchange = async {
            let (v4, v6) = tokio::join!(
                self.query(host, RecordType::A),
                self.query(host, RecordType::AAAA)
            );
            match (v4, v6) {
                (Ok(mut a), Ok(aaaa)) => {
                    a.extend(aaaa);
                    Ok(a)
                }
                (Ok(a), Err(_)) => Ok(a),
                (Err(_), Ok(aaaa)) => Ok(aaaa),
                (Err(e), Err(_)) => Err(e),
            }
        };

        tokio::time::timeout(LOOKUP_TIMEOUT, exchange)
            .await
            .map_err(|_| Error::Resolve(format!("lookup for {host} timed out")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Lookup double that counts upstream calls.
    struct CountingLookup {
        calls: AtomicUsize,
        answers: Vec<IpAddr>,
    }

    impl CountingLookup {
        fn new(answers: Vec<IpAddr>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                answers,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Lookup for CountingLookup {
        async fn lookup(&self, _host: &str) -> Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answers.clone())
        }
    }

    #[tokio::test]
    async fn second_resolve_is_served_from_cache() {
        let lookup = CountingLookup::new(vec!["93.184.216.34".parse().unwrap()]);
        let resolver = CachingResolver::with_lookup(lookup.clone(), Duration::from_secs(600));

        let first = resolver.resolve("example.com").await.unwrap();
        let second = resolver.resolve("example.com").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(lookup.calls(), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_looked_up_again() {
        let lookup = CountingLookup::new(vec!["93.184.216.34".parse().unwrap()]);
        let resolver = CachingResolver::with_lookup(lookup.clone(), Duration::from_millis(10));

        resolver.resolve("example.com").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        resolver.resolve("example.com").await.unwrap();
        assert_eq!(lookup.calls(), 2);
    }

    #[tokio::test]
    async fn empty_answer_is_a_resolve_error() {
        let lookup = CountingLookup::new(Vec::new());
        let resolver = CachingResolver::with_lookup(lookup, Duration::from_secs(600));

        match resolver.resolve("missing.example").await {
            Err(Error::Resolve(msg)) => assert!(msg.contains("missing.example")),
            other => panic!("expected resolve error, got {other:?}"),
        }
        // Negative results are not cached.
        assert!(resolver.is_empty());
    }

    #[tokio::test]
    async fn ip_literals_bypass_the_backend() {
        let lookup = CountingLookup::new(Vec::new());
        let resolver = CachingResolver::with_lookup(lookup.clone(), Duration::from_secs(600));

        let ip = resolver.resolve("10.1.2.3").await.unwrap();
        assert_eq!(ip, "10.1.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(lookup.calls(), 0);
    }

    #[tokio::test]
    async fn clear_drops_entries() {
        let lookup = CountingLookup::new(vec!["2606:2800:220:1::1".parse().unwrap()]);
        let resolver = CachingResolver::with_lookup(lookup.clone(), Duration::from_secs(600));

        resolver.resolve("example.com").await.unwrap();
        assert_eq!(resolver.len(), 1);

        resolver.clear();
        assert!(resolver.is_empty());

        resolver.resolve("example.com").await.unwrap();
        assert_eq!(lookup.calls(), 2);
    }
}
