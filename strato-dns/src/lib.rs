//! Caching DNS resolution for tunnel-bound connections

mod error;
mod resolver;

pub use error::{Error, Result};
pub use resolver::{
    CachingResolver, Lookup, UdpLookup, DEFAULT_CACHE_TTL, DEFAULT_DNS_SERVER,
};
