//! Trusted identifiers and store key naming shared by the gate and detector.

use ipnet::IpNet;
use std::net::{IpAddr, Ipv6Addr};

const BLOCK_PREFIX: &str = "scan_detect_blocked_";
const COUNT_PREFIX: &str = "scan_detect_count_";

/// Store key for the block record of an identifier.
pub fn block_key(ip: &IpAddr) -> String {
    format!("{BLOCK_PREFIX}{ip}")
}

/// Check whether a store key holds a block record.
pub fn is_block_key(key: &str) -> bool {
    key.starts_with(BLOCK_PREFIX)
}

/// Store key for the attempt counter of an identifier.
pub fn count_key(ip: &IpAddr) -> String {
    format!("{COUNT_PREFIX}{ip}")
}

/// Trusted entry, a single address or a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustedEntry {
    Single(IpAddr),
    Network(IpNet),
}

impl TrustedEntry {
    /// Parse a single IP or CIDR string.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(ip) = s.parse::<IpAddr>() {
            Some(TrustedEntry::Single(canonical(ip)))
        } else if let Ok(net) = s.parse::<IpNet>() {
            Some(TrustedEntry::Network(net))
        } else {
            None
        }
    }

    /// Check if an IP address matches this entry.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            TrustedEntry::Single(trusted) => trusted == ip,
            TrustedEntry::Network(net) => net.contains(ip),
        }
    }
}

/// How a caller identifier is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    /// No identifier, or one that is not an IP address.
    Absent,
    /// Exempt from counting and blocking.
    Trusted(IpAddr),
    /// Subject to counting and blocking.
    Tracked(IpAddr),
}

/// Set of identifiers that are never counted, blocked or looked up.
#[derive(Debug, Clone)]
pub struct TrustedSet {
    entries: Vec<TrustedEntry>,
}

impl TrustedSet {
    pub fn new(entries: Vec<TrustedEntry>) -> Self {
        Self { entries }
    }

    /// Build from config strings, skipping entries that do not parse.
    pub fn from_strings<S: AsRef<str>>(entries: &[S]) -> Self {
        Self::new(
            entries
                .iter()
                .filter_map(|s| TrustedEntry::parse(s.as_ref()))
                .collect(),
        )
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.entries.iter().any(|entry| entry.contains(ip))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Normalize a raw identifier and decide how to treat it.
    pub fn classify(&self, identifier: Option<&str>) -> Subject {
        let Some(ip) = identifier.and_then(parse_identifier) else {
            return Subject::Absent;
        };

        if self.contains(&ip) {
            Subject::Trusted(ip)
        } else {
            Subject::Tracked(ip)
        }
    }
}

impl Default for TrustedSet {
    /// Loopback v4 and v6.
    fn default() -> Self {
        Self::new(vec![
            TrustedEntry::Single(IpAddr::from([127, 0, 0, 1])),
            TrustedEntry::Single(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        ])
    }
}

/// Parse an identifier into its canonical address form.
pub fn parse_identifier(identifier: &str) -> Option<IpAddr> {
    identifier.trim().parse::<IpAddr>().ok().map(canonical)
}

/// Fold IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to IPv4.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
