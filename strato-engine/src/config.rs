//! Proxy configuration
//!
//! The configuration file is JSON: identity fields written at enrollment
//! plus SOCKS, tunnel, logging and registration sections. Durations accept
//! either human-readable strings ("30s", "5m") or integer nanoseconds and
//! always serialize back as strings.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure.
///
/// The identity fields (keys, endpoints, addresses, license, token) are
/// produced by enrollment and treated as opaque here; everything else has
/// defaults and can be edited freely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Base64-encoded SEC1 DER ECDSA private key
    #[serde(default)]
    pub private_key: String,
    /// IPv4 edge endpoint
    #[serde(default)]
    pub endpoint_v4: String,
    /// IPv6 edge endpoint
    #[serde(default)]
    pub endpoint_v6: String,
    /// PEM-encoded endpoint public key to pin the server against
    #[serde(default)]
    pub endpoint_pub_key: String,
    /// Account license, opaque
    #[serde(default)]
    pub license: String,
    /// Device identifier, opaque
    #[serde(default)]
    pub id: String,
    /// API access token, opaque
    #[serde(default)]
    pub access_token: String,
    /// IPv4 address assigned inside the tunnel
    #[serde(default)]
    pub ipv4: String,
    /// IPv6 address assigned inside the tunnel
    #[serde(default)]
    pub ipv6: String,

    #[serde(default)]
    pub socks: SocksConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
}

/// SOCKS5 frontend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocksConfig {
    #[serde(default = "defaults::bind_address")]
    pub bind_address: String,
    #[serde(default = "defaults::port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            bind_address: defaults::bind_address(),
            port: defaults::port(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Tunnel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "defaults::connect_port")]
    pub connect_port: u16,
    #[serde(default = "defaults::dns")]
    pub dns: Vec<String>,
    #[serde(default = "defaults::dns_timeout", with = "duration_serde")]
    pub dns_timeout: Duration,
    #[serde(default)]
    pub use_ipv6: bool,
    #[serde(default)]
    pub no_tunnel_ipv4: bool,
    #[serde(default)]
    pub no_tunnel_ipv6: bool,
    #[serde(default)]
    pub sni_address: String,
    #[serde(default = "defaults::keepalive_period", with = "duration_serde")]
    pub keepalive_period: Duration,
    #[serde(default = "defaults::mtu")]
    pub mtu: usize,
    #[serde(default = "defaults::initial_packet_size")]
    pub initial_packet_size: u16,
    #[serde(default = "defaults::reconnect_delay", with = "duration_serde")]
    pub reconnect_delay: Duration,
    #[serde(default = "defaults::connection_timeout", with = "duration_serde")]
    pub connection_timeout: Duration,
    #[serde(default = "defaults::idle_timeout", with = "duration_serde")]
    pub idle_timeout: Duration,
    #[serde(default)]
    pub per_client: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_port: defaults::connect_port(),
            dns: defaults::dns(),
            dns_timeout: defaults::dns_timeout(),
            use_ipv6: false,
            no_tunnel_ipv4: false,
            no_tunnel_ipv6: false,
            sni_address: String::new(),
            keepalive_period: defaults::keepalive_period(),
            mtu: defaults::mtu(),
            initial_packet_size: defaults::initial_packet_size(),
            reconnect_delay: defaults::reconnect_delay(),
            connection_timeout: defaults::connection_timeout(),
            idle_timeout: defaults::idle_timeout(),
            per_client: false,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Redirect formatted output to this file when set
    #[serde(default)]
    pub output_path: String,
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            output_path: String::new(),
            level: defaults::log_level(),
        }
    }
}

/// Enrollment metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationConfig {
    #[serde(default)]
    pub device_name: String,
}

mod defaults {
    use std::time::Duration;

    pub fn bind_address() -> String {
        "127.0.0.1".into()
    }
    pub fn port() -> u16 {
        1080
    }
    pub fn connect_port() -> u16 {
        443
    }
    pub fn dns() -> Vec<String> {
        vec!["1.1.1.1".into(), "8.8.8.8".into()]
    }
    pub fn dns_timeout() -> Duration {
        Duration::from_secs(2)
    }
    pub fn keepalive_period() -> Duration {
        Duration::from_secs(30)
    }
    pub fn mtu() -> usize {
        1280
    }
    pub fn initial_packet_size() -> u16 {
        1242
    }
    pub fn reconnect_delay() -> Duration {
        Duration::from_secs(1)
    }
    pub fn connection_timeout() -> Duration {
        Duration::from_secs(30)
    }
    pub fn idle_timeout() -> Duration {
        Duration::from_secs(300)
    }
    pub fn log_level() -> String {
        "info".into()
    }
}

/// Serde adapter accepting "30s"-style strings or integer nanoseconds and
/// writing strings back.
mod duration_serde {
    use serde::{de, Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> de::Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a duration string or integer nanoseconds")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Duration, E> {
                humantime::parse_duration(value).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<Duration, E> {
                Ok(Duration::from_nanos(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<Duration, E> {
                u64::try_from(value)
                    .map(Duration::from_nanos)
                    .map_err(|_| E::custom("negative duration"))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

impl Config {
    /// Load the configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to open config file: {e}")))?;
        Self::from_json(&content)
    }

    /// Parse the configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(content)?;
        // A file written before the SOCKS section existed gets the full
        // default section instead of an unusable empty one.
        if config.socks.bind_address.is_empty() && config.socks.port == 0 {
            config.socks = SocksConfig::default();
        }
        Ok(config)
    }

    /// Write the configuration to a prettified JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("failed to write config file: {e}")))?;
        Ok(())
    }

    /// Restore the SOCKS and tunnel sections to their defaults, preserving
    /// the identity fields and the enrolled SNI. Idempotent.
    pub fn reset_proxy_sections(&mut self) {
        let sni = std::mem::take(&mut self.tunnel.sni_address);
        self.socks = SocksConfig::default();
        self.tunnel = TunnelConfig::default();
        self.tunnel.sni_address = sni;
    }

    /// Effective connection and idle timeouts; zero values select the
    /// 30 s / 5 min defaults.
    pub fn timeout_settings(&self) -> (Duration, Duration) {
        let connection = if self.tunnel.connection_timeout.is_zero() {
            defaults::connection_timeout()
        } else {
            self.tunnel.connection_timeout
        };
        let idle = if self.tunnel.idle_timeout.is_zero() {
            defaults::idle_timeout()
        } else {
            self.tunnel.idle_timeout
        };
        (connection, idle)
    }

    /// Check that the identity fields needed to run the proxy are present.
    pub fn validate(&self) -> Result<()> {
        if self.private_key.is_empty() {
            return Err(Error::Config("private_key is required".into()));
        }
        if self.endpoint_pub_key.is_empty() {
            return Err(Error::Config("endpoint_pub_key is required".into()));
        }
        if self.tunnel.use_ipv6 {
            if self.endpoint_v6.is_empty() {
                return Err(Error::Config("endpoint_v6 is required with use_ipv6".into()));
            }
        } else if self.endpoint_v4.is_empty() {
            return Err(Error::Config("endpoint_v4 is required".into()));
        }
        if self.tunnel.no_tunnel_ipv4 && self.tunnel.no_tunnel_ipv6 {
            return Err(Error::Config(
                "at least one of IPv4/IPv6 must be enabled inside the tunnel".into(),
            ));
        }
        Ok(())
    }

    /// The enrolled identity material for TLS.
    pub fn identity(&self) -> Result<strato_masque::ClientIdentity> {
        Ok(strato_masque::ClientIdentity::from_config_keys(
            &self.private_key,
            &self.endpoint_pub_key,
        )?)
    }
}
