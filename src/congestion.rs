//! Per-path congestion control selection.
//!
//! Every resolver path carries a mode tag. Recursive paths run a
//! delay-aware cubic, authoritative paths run BBR, and an optional global
//! override replaces both. The server side runs without window or pacing
//! limits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Initial delay before re-probing a resolver path that failed to come up
pub const PATH_PROBE_INITIAL_DELAY: Duration = Duration::from_millis(250);

/// Ceiling for the path probe backoff
pub const PATH_PROBE_MAX_DELAY: Duration = Duration::from_secs(10);

/// Burst multiplier for authoritative paths
pub const AUTHORITATIVE_LOOP_MULTIPLIER: usize = 2;

/// How a resolver path reaches the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathMode {
    /// Not tagged; resolves to the connection default
    #[default]
    Unknown,
    Recursive,
    Authoritative,
}

impl PathMode {
    /// Wire value for the engine (0 unknown, 1 recursive, 2 authoritative)
    pub fn as_raw(self) -> i32 {
        match self {
            PathMode::Unknown => 0,
            PathMode::Recursive => 1,
            PathMode::Authoritative => 2,
        }
    }

    pub fn from_raw(value: i32) -> Self {
        match value {
            1 => PathMode::Recursive,
            2 => PathMode::Authoritative,
            _ => PathMode::Unknown,
        }
    }

    /// Explicit tag, else `default`, else recursive
    pub fn resolve(self, default: PathMode) -> PathMode {
        match (self, default) {
            (PathMode::Unknown, PathMode::Unknown) => PathMode::Recursive,
            (PathMode::Unknown, default) => default,
            (mode, _) => mode,
        }
    }

    /// Burst multiplier for the send/poll loops
    pub fn loop_multiplier(self) -> usize {
        match self {
            PathMode::Authoritative => AUTHORITATIVE_LOOP_MULTIPLIER,
            _ => 1,
        }
    }

    /// Authoritative paths acknowledge immediately
    pub fn disables_ack_delay(self) -> bool {
        self == PathMode::Authoritative
    }
}

impl fmt::Display for PathMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PathMode::Unknown => "unknown",
            PathMode::Recursive => "recursive",
            PathMode::Authoritative => "authoritative",
        };
        f.write_str(name)
    }
}

impl FromStr for PathMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "recursive" | "resolver" => Ok(PathMode::Recursive),
            "authoritative" | "auth" => Ok(PathMode::Authoritative),
            "unknown" | "" => Ok(PathMode::Unknown),
            other => Err(format!("Unknown path mode: {}", other)),
        }
    }
}

/// Congestion controllers the engine exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionAlgorithm {
    Bbr,
    /// Delay-aware cubic
    Dcubic,
    Cubic,
    Newreno,
    /// Unlimited window and pacing, server side only
    Unlimited,
}

impl CongestionAlgorithm {
    /// Engine-facing name
    pub fn name(self) -> &'static str {
        match self {
            CongestionAlgorithm::Bbr => "bbr",
            CongestionAlgorithm::Dcubic => "dcubic",
            CongestionAlgorithm::Cubic => "cubic",
            CongestionAlgorithm::Newreno => "newreno",
            CongestionAlgorithm::Unlimited => "unlimited",
        }
    }
}

impl fmt::Display for CongestionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CongestionAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bbr" => Ok(CongestionAlgorithm::Bbr),
            "dcubic" => Ok(CongestionAlgorithm::Dcubic),
            "cubic" => Ok(CongestionAlgorithm::Cubic),
            "newreno" | "reno" => Ok(CongestionAlgorithm::Newreno),
            "unlimited" => Ok(CongestionAlgorithm::Unlimited),
            other => Err(format!("Unknown congestion algorithm: {}", other)),
        }
    }
}

/// What a path should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathCongestion {
    pub mode: PathMode,
    pub algorithm: CongestionAlgorithm,
    pub disable_ack_delay: bool,
}

/// Picks the algorithm for each path
#[derive(Debug, Clone, Copy)]
pub struct CongestionSelector {
    default_mode: PathMode,
    override_algorithm: Option<CongestionAlgorithm>,
    server: bool,
}

impl CongestionSelector {
    pub fn client(default_mode: PathMode, override_algorithm: Option<CongestionAlgorithm>) -> Self {
        Self {
            default_mode,
            override_algorithm,
            server: false,
        }
    }

    pub fn server() -> Self {
        Self {
            default_mode: PathMode::Recursive,
            override_algorithm: None,
            server: true,
        }
    }

    pub fn default_mode(&self) -> PathMode {
        self.default_mode.resolve(PathMode::Recursive)
    }

    /// Algorithm for a new connection before any path is tagged
    pub fn connection_default(&self) -> CongestionAlgorithm {
        self.select(PathMode::Unknown).algorithm
    }

    pub fn select(&self, tag: PathMode) -> PathCongestion {
        let mode = tag.resolve(self.default_mode);
        let algorithm = if self.server {
            CongestionAlgorithm::Unlimited
        } else if let Some(forced) = self.override_algorithm {
            forced
        } else {
            match mode {
                PathMode::Authoritative => CongestionAlgorithm::Bbr,
                _ => CongestionAlgorithm::Dcubic,
            }
        };

        PathCongestion {
            mode,
            algorithm,
            disable_ack_delay: !self.server && mode.disables_ack_delay(),
        }
    }
}

/// Delay before the next probe after `attempts` failures
pub fn path_probe_backoff(attempts: u32) -> Duration {
    let shift = attempts.saturating_sub(1).min(6);
    let delay = PATH_PROBE_INITIAL_DELAY.saturating_mul(1u32 << shift);
    delay.min(PATH_PROBE_MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_resolves_to_default() {
        assert_eq!(
            PathMode::Unknown.resolve(PathMode::Authoritative),
            PathMode::Authoritative
        );
        assert_eq!(PathMode::Unknown.resolve(PathMode::Unknown), PathMode::Recursive);
        assert_eq!(
            PathMode::Recursive.resolve(PathMode::Authoritative),
            PathMode::Recursive
        );
    }

    #[test]
    fn test_mode_selects_algorithm() {
        let selector = CongestionSelector::client(PathMode::Recursive, None);
        let auth = selector.select(PathMode::Authoritative);
        assert_eq!(auth.algorithm, CongestionAlgorithm::Bbr);
        assert!(auth.disable_ack_delay);

        let rec = selector.select(PathMode::Unknown);
        assert_eq!(rec.mode, PathMode::Recursive);
        assert_eq!(rec.algorithm, CongestionAlgorithm::Dcubic);
        assert!(!rec.disable_ack_delay);
    }

    #[test]
    fn test_override_applies_to_every_path() {
        let selector =
            CongestionSelector::client(PathMode::Recursive, Some(CongestionAlgorithm::Cubic));
        assert_eq!(
            selector.select(PathMode::Authoritative).algorithm,
            CongestionAlgorithm::Cubic
        );
        assert_eq!(
            selector.select(PathMode::Recursive).algorithm,
            CongestionAlgorithm::Cubic
        );
        // Ack delay still follows the mode
        assert!(selector.select(PathMode::Authoritative).disable_ack_delay);
    }

    #[test]
    fn test_server_is_unlimited() {
        let selector = CongestionSelector::server();
        assert_eq!(
            selector.select(PathMode::Authoritative).algorithm,
            CongestionAlgorithm::Unlimited
        );
        assert_eq!(selector.connection_default(), CongestionAlgorithm::Unlimited);
    }

    #[test]
    fn test_probe_backoff() {
        assert_eq!(path_probe_backoff(1), Duration::from_millis(250));
        assert_eq!(path_probe_backoff(2), Duration::from_millis(500));
        assert_eq!(path_probe_backoff(4), Duration::from_secs(2));
        assert_eq!(path_probe_backoff(7), PATH_PROBE_MAX_DELAY);
        assert_eq!(path_probe_backoff(40), PATH_PROBE_MAX_DELAY);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("BBR".parse::<CongestionAlgorithm>().unwrap(), CongestionAlgorithm::Bbr);
        assert_eq!("auth".parse::<PathMode>().unwrap(), PathMode::Authoritative);
        assert!("quic".parse::<PathMode>().is_err());
    }
}
