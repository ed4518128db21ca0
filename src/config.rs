//! Tunnel configuration

use crate::congestion::{CongestionAlgorithm, PathMode};
use crate::dns::qname::{max_payload_len_for_domain, normalize_domain};
use crate::dns::DomainMatcher;
use crate::governor::{
    FlowLimits, DEFAULT_CONNECTION_WINDOW, DEFAULT_CONN_RESERVE_BYTES,
    DEFAULT_STREAM_QUEUE_MAX_BYTES,
};
use crate::pinning::{CertPin, CertVerification};
use crate::poll::DEFAULT_IDLE_POLL_INTERVAL;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_DNS_PORT: u16 = 53;
pub const DEFAULT_SERVER_MTU: u32 = 900;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1200);
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
pub const DEFAULT_ALPN: &str = "picoquic_sample";

/// Reset seed size in bytes
pub const RESET_SEED_LEN: usize = 16;

pub const ENV_STREAM_WRITE_BUFFER_BYTES: &str = "DNSQUIC_STREAM_WRITE_BUFFER_BYTES";
pub const ENV_STREAM_QUEUE_MAX_BYTES: &str = "DNSQUIC_STREAM_QUEUE_MAX_BYTES";
pub const ENV_CONN_RESERVE_BYTES: &str = "DNSQUIC_CONN_RESERVE_BYTES";
pub const ENV_IDLE_TIMEOUT_SECS: &str = "DNSQUIC_IDLE_TIMEOUT_SECS";
pub const ENV_MAX_CONNECTIONS: &str = "DNSQUIC_MAX_CONNECTIONS";
pub const ENV_RESET_SEED_FILE: &str = "DNSQUIC_RESET_SEED_FILE";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("At least one domain is required")]
    NoDomains,

    #[error("Invalid domain {domain:?}: {reason}")]
    InvalidDomain { domain: String, reason: String },

    #[error("At least one resolver is required")]
    NoResolvers,

    #[error("Invalid {kind} address: {input}")]
    InvalidAddress { kind: &'static str, input: String },

    #[error("Duplicate resolver address {addr} (modes: {first} and {second})")]
    DuplicateResolver {
        addr: SocketAddr,
        first: PathMode,
        second: PathMode,
    },

    #[error("Invalid value for {name}: {value:?}")]
    InvalidKnob { name: &'static str, value: String },

    #[error("{0}")]
    Invalid(String),
}

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    Client,
    Server,
}

/// Complete tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub mode: TunnelMode,

    /// Tunnel domains; the client uses the first
    pub domains: Vec<String>,

    #[serde(default)]
    pub client: ClientSettings,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub flow: FlowSettings,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            mode: TunnelMode::Client,
            domains: Vec::new(),
            client: ClientSettings::default(),
            server: ServerSettings::default(),
            flow: FlowSettings::default(),
        }
    }
}

/// One resolver path as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverSpec {
    /// host[:port] or [v6]:port; port defaults to 53
    pub address: String,

    #[serde(default)]
    pub mode: PathMode,
}

/// A resolver with its address resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolver {
    pub addr: SocketAddr,
    pub mode: PathMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub resolvers: Vec<ResolverSpec>,

    /// Local UDP bind address
    pub bind: SocketAddr,

    /// Force one congestion controller on every path
    pub congestion_control: Option<CongestionAlgorithm>,

    #[serde(with = "humantime_serde")]
    pub idle_poll_interval: Duration,

    /// PEM file holding the pinned server certificate
    pub cert_pin: Option<PathBuf>,

    /// Skip certificate verification entirely
    pub insecure: bool,

    pub sni: Option<String>,

    pub alpn: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            resolvers: Vec::new(),
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            congestion_control: None,
            idle_poll_interval: DEFAULT_IDLE_POLL_INTERVAL,
            cert_pin: None,
            insecure: false,
            sni: None,
            alpn: DEFAULT_ALPN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen: SocketAddr,

    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,

    /// Zero disables idle collection
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    pub max_connections: usize,

    /// Hex seed for stateless reset tokens, created when missing
    pub reset_seed_file: Option<PathBuf>,

    pub mtu: u32,

    pub alpn: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DNS_PORT)),
            cert: None,
            key: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            reset_seed_file: None,
            mtu: DEFAULT_SERVER_MTU,
            alpn: DEFAULT_ALPN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    /// Connection-level receive window
    pub stream_write_buffer_bytes: u64,
    /// Per-stream queue cap in multi-stream mode
    pub stream_queue_max_bytes: usize,
    /// Single-stream consumption reserve, 0 disables
    pub conn_reserve_bytes: usize,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            stream_write_buffer_bytes: DEFAULT_CONNECTION_WINDOW,
            stream_queue_max_bytes: DEFAULT_STREAM_QUEUE_MAX_BYTES,
            conn_reserve_bytes: DEFAULT_CONN_RESERVE_BYTES,
        }
    }
}

impl FlowSettings {
    pub fn limits(&self) -> FlowLimits {
        FlowLimits {
            max_queue: self.stream_queue_max_bytes,
            reserve: self.conn_reserve_bytes,
            connection_window: self.stream_write_buffer_bytes,
        }
    }
}

fn parse_knob<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidKnob {
        name,
        value: value.to_string(),
    })
}

fn parse_positive<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + Default + PartialEq,
{
    let parsed: T = parse_knob(name, value)?;
    if parsed == T::default() {
        return Err(ConfigError::InvalidKnob {
            name,
            value: value.to_string(),
        });
    }
    Ok(parsed)
}

impl TunnelConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `DNSQUIC_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_STREAM_WRITE_BUFFER_BYTES) {
            self.flow.stream_write_buffer_bytes =
                parse_positive(ENV_STREAM_WRITE_BUFFER_BYTES, &value)?;
        }
        if let Some(value) = lookup(ENV_STREAM_QUEUE_MAX_BYTES) {
            self.flow.stream_queue_max_bytes = parse_positive(ENV_STREAM_QUEUE_MAX_BYTES, &value)?;
        }
        if let Some(value) = lookup(ENV_CONN_RESERVE_BYTES) {
            self.flow.conn_reserve_bytes = parse_knob(ENV_CONN_RESERVE_BYTES, &value)?;
        }
        if let Some(value) = lookup(ENV_IDLE_TIMEOUT_SECS) {
            let secs: u64 = parse_knob(ENV_IDLE_TIMEOUT_SECS, &value)?;
            self.server.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(value) = lookup(ENV_MAX_CONNECTIONS) {
            self.server.max_connections = parse_positive(ENV_MAX_CONNECTIONS, &value)?;
        }
        if let Some(value) = lookup(ENV_RESET_SEED_FILE) {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(ConfigError::InvalidKnob {
                    name: ENV_RESET_SEED_FILE,
                    value,
                });
            }
            self.server.reset_seed_file = Some(PathBuf::from(trimmed));
        }
        Ok(())
    }

    /// Normalized, validated domains
    pub fn normalized_domains(&self) -> Result<Vec<String>, ConfigError> {
        if self.domains.is_empty() {
            return Err(ConfigError::NoDomains);
        }
        self.domains.iter().map(|d| validate_domain(d)).collect()
    }

    pub fn domain_matcher(&self) -> Result<DomainMatcher, ConfigError> {
        let domains = self.normalized_domains()?;
        let matcher = DomainMatcher::new(domains);
        for (inner, outer) in matcher.overlapping() {
            log::warn!(
                "Domain {} is nested under {}; queries match the longest suffix",
                inner,
                outer
            );
        }
        Ok(matcher)
    }

    /// Resolve and deduplicate the configured resolvers
    pub fn resolvers(&self) -> Result<Vec<Resolver>, ConfigError> {
        if self.client.resolvers.is_empty() {
            return Err(ConfigError::NoResolvers);
        }
        let mut seen: HashMap<SocketAddr, PathMode> = HashMap::new();
        let mut resolved = Vec::with_capacity(self.client.resolvers.len());
        for spec in &self.client.resolvers {
            let addr = crate::dns::transport::normalize_dual_stack_addr(resolve_host_port(
                &spec.address,
                DEFAULT_DNS_PORT,
                "resolver",
            )?);
            if let Some(first) = seen.get(&addr) {
                return Err(ConfigError::DuplicateResolver {
                    addr,
                    first: *first,
                    second: spec.mode,
                });
            }
            seen.insert(addr, spec.mode);
            resolved.push(Resolver {
                addr,
                mode: spec.mode,
            });
        }
        Ok(resolved)
    }

    /// Largest QUIC packet the client can carry in one query
    pub fn client_mtu(&self) -> Result<u32, ConfigError> {
        let domains = self.normalized_domains()?;
        let max = max_payload_len_for_domain(&domains[0]).map_err(|e| {
            ConfigError::InvalidDomain {
                domain: domains[0].clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(max as u32)
    }

    /// How the client checks the server certificate
    pub fn cert_verification(&self) -> anyhow::Result<CertVerification> {
        match &self.client.cert_pin {
            Some(path) => Ok(CertVerification::Pinned(CertPin::from_file(path)?)),
            None => {
                if !self.client.insecure {
                    log::warn!("No cert_pin configured; the server certificate is not verified");
                }
                Ok(CertVerification::Insecure)
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.normalized_domains()?;
        if self.flow.stream_write_buffer_bytes == 0 || self.flow.stream_queue_max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "Flow-control windows must be non-zero".into(),
            ));
        }

        match self.mode {
            TunnelMode::Client => {
                self.resolvers()?;
                self.client_mtu()?;
                if self.client.insecure && self.client.cert_pin.is_some() {
                    return Err(ConfigError::Invalid(
                        "cert_pin and insecure are mutually exclusive".into(),
                    ));
                }
            }
            TunnelMode::Server => {
                if self.server.max_connections == 0 {
                    return Err(ConfigError::Invalid("max_connections must be > 0".into()));
                }
                if self.server.mtu == 0 {
                    return Err(ConfigError::Invalid("mtu must be > 0".into()));
                }
                if self.server.cert.is_some() != self.server.key.is_some() {
                    return Err(ConfigError::Invalid(
                        "cert and key must be configured together".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn validate_domain(domain: &str) -> Result<String, ConfigError> {
    let normalized = normalize_domain(domain.trim());
    let invalid = |reason: &str| ConfigError::InvalidDomain {
        domain: domain.to_string(),
        reason: reason.to_string(),
    };
    if normalized.is_empty() {
        return Err(invalid("empty"));
    }
    for label in normalized.split('.') {
        if label.is_empty() {
            return Err(invalid("empty label"));
        }
        if label.len() > crate::dns::MAX_DNS_LABEL_LEN {
            return Err(invalid("label longer than 63 bytes"));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(invalid("unsupported character"));
        }
    }
    match max_payload_len_for_domain(&normalized) {
        Ok(0) => Err(invalid("too long to carry any payload")),
        Ok(_) => Ok(normalized),
        Err(e) => Err(invalid(&e.to_string())),
    }
}

/// Parse `host`, `host:port`, `[v6]` or `[v6]:port` and resolve it
pub fn resolve_host_port(
    input: &str,
    default_port: u16,
    kind: &'static str,
) -> Result<SocketAddr, ConfigError> {
    let invalid = || ConfigError::InvalidAddress {
        kind,
        input: input.to_string(),
    };
    let input_trimmed = input.trim();

    let (host, port) = if let Some(rest) = input_trimmed.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(invalid)?;
        let host = &rest[..end];
        let remainder = &rest[end + 1..];
        let port = if remainder.is_empty() {
            default_port
        } else {
            let port_str = remainder.strip_prefix(':').ok_or_else(invalid)?;
            port_str.parse::<u16>().map_err(|_| invalid())?
        };
        if host.parse::<std::net::Ipv6Addr>().is_err() {
            return Err(invalid());
        }
        (host, port)
    } else if let Ok(ip) = input_trimmed.parse::<IpAddr>() {
        // Bare IPv6 without brackets
        return Ok(SocketAddr::new(ip, default_port));
    } else {
        match input_trimmed.split_once(':') {
            Some((host, port_str)) => {
                if port_str.is_empty() || !port_str.chars().all(|c| c.is_ascii_digit()) {
                    return Err(invalid());
                }
                (host, port_str.parse::<u16>().map_err(|_| invalid())?)
            }
            None => (input_trimmed, default_port),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)
}

/// Stateless reset seed, persisted as hex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetSeed {
    pub bytes: [u8; RESET_SEED_LEN],
    pub created: bool,
}

pub fn parse_hex_seed(input: &str) -> anyhow::Result<[u8; RESET_SEED_LEN]> {
    let trimmed = input.trim();
    if trimmed.len() != RESET_SEED_LEN * 2 {
        anyhow::bail!(
            "Reset seed must be {} hex chars (got {})",
            RESET_SEED_LEN * 2,
            trimmed.len()
        );
    }
    let mut seed = [0u8; RESET_SEED_LEN];
    hex::decode_to_slice(trimmed, &mut seed).context("Reset seed contains invalid hex")?;
    Ok(seed)
}

/// Load the seed at `path`, creating a random one when the file is missing
pub fn load_or_create_reset_seed(path: &Path) -> anyhow::Result<ResetSeed> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let bytes = parse_hex_seed(&contents)
                .with_context(|| format!("Invalid reset seed {}", path.display()))?;
            Ok(ResetSeed {
                bytes,
                created: false,
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create reset seed directory {}", parent.display())
                })?;
            }
            let bytes: [u8; RESET_SEED_LEN] = rand::random();
            match write_new_file(path, format!("{}\n", hex::encode(bytes)).as_bytes()) {
                Ok(()) => Ok(ResetSeed {
                    bytes,
                    created: true,
                }),
                // Lost a creation race; use the winner's seed
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let contents = std::fs::read_to_string(path)
                        .with_context(|| format!("Failed to read reset seed {}", path.display()))?;
                    Ok(ResetSeed {
                        bytes: parse_hex_seed(&contents)?,
                        created: false,
                    })
                }
                Err(e) => Err(e)
                    .with_context(|| format!("Failed to write reset seed {}", path.display())),
            }
        }
        Err(e) => {
            Err(e).with_context(|| format!("Failed to read reset seed {}", path.display()))
        }
    }
}

fn write_new_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}
