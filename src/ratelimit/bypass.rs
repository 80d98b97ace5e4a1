//! Bypass checks evaluated before any counting.
//!
//! Two independent paths admit a request without touching a store: a trusted
//! IP whitelist, and an operational emergency token presented in a header.

use ipnet::IpNet;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use tracing::warn;

use super::context::RateLimitContext;
use crate::error::{GatekeeperError, Result};

/// Which bypass admitted a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bypass {
    Whitelist,
    Emergency,
}

/// Trusted addresses and ranges.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    networks: Vec<IpNet>,
}

impl Whitelist {
    /// Parse entries; each is an address (`192.0.2.1`) or a CIDR range
    /// (`10.0.0.0/8`).
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let networks = entries
            .iter()
            .map(|entry| parse_entry(entry.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { networks })
    }

    /// Whether `ip` falls in a trusted entry. Unparseable input never matches.
    pub fn contains(&self, ip: &str) -> bool {
        match ip.trim().parse::<IpAddr>() {
            Ok(addr) => self.networks.iter().any(|net| net.contains(&addr)),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

fn parse_entry(entry: &str) -> Result<IpNet> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    entry
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| GatekeeperError::Config(format!("invalid address or CIDR entry: {}", entry)))
}

/// Emergency bypass secret, kept only as a digest.
#[derive(Clone, Default)]
pub struct EmergencyToken {
    digest: Option<[u8; 32]>,
}

impl std::fmt::Debug for EmergencyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmergencyToken")
            .field("configured", &self.digest.is_some())
            .finish()
    }
}

impl EmergencyToken {
    /// A blank or missing secret disables the bypass.
    pub fn new(secret: Option<&str>) -> Self {
        let digest = secret
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Sha256::digest(s.as_bytes()).into());
        Self { digest }
    }

    pub fn is_configured(&self) -> bool {
        self.digest.is_some()
    }

    /// Compare digests so the comparison time does not depend on how much of
    /// the secret a guess shares.
    pub fn matches(&self, presented: &str) -> bool {
        let Some(expected) = self.digest else {
            return false;
        };
        let presented: [u8; 32] = Sha256::digest(presented.trim().as_bytes()).into();
        expected
            .iter()
            .zip(presented.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Both bypass paths.
#[derive(Debug, Clone, Default)]
pub struct BypassPolicy {
    pub whitelist: Whitelist,
    pub emergency: EmergencyToken,
}

impl BypassPolicy {
    pub fn new(whitelist: Whitelist, emergency: EmergencyToken) -> Self {
        Self {
            whitelist,
            emergency,
        }
    }

    /// The bypass that applies to `context`, if any.
    pub fn evaluate(&self, context: &RateLimitContext) -> Option<Bypass> {
        if self.whitelist.contains(context.ip()) {
            return Some(Bypass::Whitelist);
        }
        if let Some(token) = context.bypass_token.as_deref() {
            if self.emergency.matches(token) {
                return Some(Bypass::Emergency);
            }
            warn!(ip = %context.ip(), endpoint = %context.endpoint, "Invalid emergency bypass token presented");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist_single_and_cidr() {
        let whitelist = Whitelist::parse(&["192.0.2.10", "10.0.0.0/8", "2001:db8::/32"]).unwrap();

        assert!(whitelist.contains("192.0.2.10"));
        assert!(!whitelist.contains("192.0.2.11"));
        assert!(whitelist.contains("10.200.3.4"));
        assert!(whitelist.contains("2001:db8::1"));
        assert!(!whitelist.contains("unknown"));
        assert!(!whitelist.contains(""));
    }

    #[test]
    fn test_whitelist_rejects_garbage() {
        assert!(Whitelist::parse(&["not-an-ip"]).is_err());
    }

    #[test]
    fn test_emergency_token() {
        let token = EmergencyToken::new(Some("s3cret"));
        assert!(token.matches("s3cret"));
        assert!(!token.matches("s3cre"));
        assert!(!token.matches(""));

        let disabled = EmergencyToken::new(Some("   "));
        assert!(!disabled.is_configured());
        assert!(!disabled.matches("   "));
        assert!(!EmergencyToken::new(None).matches(""));
    }

    #[test]
    fn test_debug_hides_secret() {
        let token = EmergencyToken::new(Some("s3cret"));
        assert!(!format!("{:?}", token).contains("s3cret"));
    }

    #[test]
    fn test_policy_evaluation() {
        let policy = BypassPolicy::new(
            Whitelist::parse(&["127.0.0.1"]).unwrap(),
            EmergencyToken::new(Some("open-sesame")),
        );

        let trusted = RateLimitContext::new("127.0.0.1", "/");
        assert_eq!(policy.evaluate(&trusted), Some(Bypass::Whitelist));

        let emergency = RateLimitContext::new("198.51.100.1", "/").with_bypass_token("open-sesame");
        assert_eq!(policy.evaluate(&emergency), Some(Bypass::Emergency));

        let wrong = RateLimitContext::new("198.51.100.1", "/").with_bypass_token("guess");
        assert_eq!(policy.evaluate(&wrong), None);

        let plain = RateLimitContext::new("198.51.100.1", "/");
        assert_eq!(policy.evaluate(&plain), None);
    }
}
