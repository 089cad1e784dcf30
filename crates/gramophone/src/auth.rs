//! Request authentication.
//!
//! Control requests carry three headers: the origin url they claim to come
//! from, a random nonce, and a hex HMAC-SHA256 checksum of `nonce + body`
//! computed with the shared secret of that origin. The origin url selects the
//! secret from the credential registry; an unknown origin is rejected before
//! any verification happens.

use gramoconf::{Registry, ResolvedBackend};
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::Sha256;
use std::net::IpAddr;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the origin url of a control request.
pub const BACKEND_HEADER: &str = "recording-backend";
/// Header carrying the request nonce.
pub const RANDOM_HEADER: &str = "recording-random";
/// Header carrying the hex HMAC-SHA256 checksum of nonce + body.
pub const CHECKSUM_HEADER: &str = "recording-checksum";

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("origin {0} matches no configured backend")]
    UnknownOrigin(String),

    #[error("checksum verification failed")]
    AuthenticationFailed,

    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("message size {size} above limit {limit}")]
    BodyTooLarge { size: u64, limit: u64 },
}

/// Compute the hex HMAC-SHA256 checksum of `random + body` with `secret`.
pub fn checksum(secret: &str, random: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(random.as_bytes());
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Generate a request nonce.
pub fn new_random() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}

fn verify(secret: &str, random: &str, body: &[u8], claimed: &str) -> bool {
    let Ok(claimed) = hex::decode(claimed) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(random.as_bytes());
    mac.update(body);
    // Constant-time comparison.
    mac.verify_slice(&claimed).is_ok()
}

/// Validate a control request against the credential registry.
///
/// Returns the resolved backend on success so the caller never has to look
/// it up a second time.
pub fn authenticate(
    registry: &Registry,
    origin: &str,
    random: &str,
    claimed_checksum: &str,
    body: &[u8],
) -> Result<ResolvedBackend, AuthError> {
    let backend = registry
        .backend_for_url(origin)
        .ok_or_else(|| AuthError::UnknownOrigin(origin.to_string()))?;

    let size = body.len() as u64;
    if size == 0 || size > backend.max_message_size {
        return Err(AuthError::BodyTooLarge {
            size,
            limit: backend.max_message_size,
        });
    }

    if !verify(&backend.secret, random, body, claimed_checksum) {
        return Err(AuthError::AuthenticationFailed);
    }

    Ok(backend)
}

/// An address or CIDR network from the trusted-proxy configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Network {
    addr: IpAddr,
    prefix: u8,
}

impl Network {
    /// Parse `"4.8.15.16"`, `"4.8.15.0/24"`, `"2001:db8::/32"` and the like.
    pub fn parse(text: &str) -> Option<Self> {
        let (addr_text, prefix_text) = match text.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (text, None),
        };

        let addr: IpAddr = addr_text.trim().parse().ok()?;
        let max_prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = match prefix_text {
            Some(text) => {
                let prefix: u8 = text.trim().parse().ok()?;
                if prefix > max_prefix {
                    return None;
                }
                prefix
            }
            None => max_prefix,
        };

        Some(Self { addr, prefix })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let shift = 32 - u32::from(self.prefix);
                if shift >= 32 {
                    return true;
                }
                (u32::from(net) >> shift) == (u32::from(addr) >> shift)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let shift = 128 - u32::from(self.prefix);
                if shift >= 128 {
                    return true;
                }
                (u128::from(net) >> shift) == (u128::from(addr) >> shift)
            }
            _ => false,
        }
    }
}

/// Whether `addr` is inside any of `networks`.
pub fn is_address_in_networks(addr: IpAddr, networks: &[Network]) -> bool {
    networks.iter().any(|network| network.contains(addr))
}

/// The configured set of reverse proxies allowed to supply a forwarded
/// client address.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    networks: Vec<Network>,
}

impl TrustedProxies {
    /// Build from the config strings, dropping entries that do not parse.
    ///
    /// Returns the parsed set and the rejected entries for logging.
    pub fn from_config(entries: &[String]) -> (Self, Vec<String>) {
        let mut networks = Vec::new();
        let mut rejected = Vec::new();
        for entry in entries {
            match Network::parse(entry) {
                Some(network) => networks.push(network),
                None => rejected.push(entry.clone()),
            }
        }
        (Self { networks }, rejected)
    }

    fn is_trusted(&self, addr: IpAddr) -> bool {
        is_address_in_networks(addr, &self.networks)
    }

    /// Derive the real client address of a request.
    ///
    /// Walks the forwarded chain right to left starting from the socket peer
    /// address. While the current address belongs to a trusted proxy the next
    /// entry to the left is taken; the walk stops at the first untrusted or
    /// unparseable entry. A peer that is not itself trusted never has its
    /// forwarded header believed.
    pub fn remote_address(&self, peer: &str, forwarded_for: Option<&str>) -> String {
        let mut current = peer.to_string();

        let mut chain: Vec<&str> = forwarded_for
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .collect();

        loop {
            let Ok(addr) = address_without_port(&current).parse::<IpAddr>() else {
                return current;
            };

            if !self.is_trusted(addr) {
                return current;
            }

            let Some(next) = chain.pop() else {
                return current;
            };

            let next = address_without_port(next);
            if next.parse::<IpAddr>().is_err() {
                return current;
            }

            current = next.to_string();
        }
    }
}

/// Strip a port (and IPv6 brackets) from an address string.
///
/// Addresses with multiple colons and no brackets are returned untouched, a
/// bare IPv6 address has no port to strip.
pub fn address_without_port(address: &str) -> String {
    if let Some(stripped) = address.strip_prefix('[') {
        if let Some(end) = stripped.rfind(']') {
            return stripped[..end].to_string();
        }
        return stripped.to_string();
    }

    if address.matches(':').count() == 1 {
        if let Some((host, _port)) = address.split_once(':') {
            return host.to_string();
        }
    }

    address.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn networks(entries: &[&str]) -> Vec<Network> {
        entries
            .iter()
            .map(|entry| Network::parse(entry).unwrap())
            .collect()
    }

    fn proxies(entries: &[&str]) -> TrustedProxies {
        TrustedProxies {
            networks: networks(entries),
        }
    }

    #[test]
    fn test_checksum_round_trip() {
        let body = br#"{"type":"start"}"#;
        let random = new_random();
        let value = checksum("the-secret", &random, body);

        assert!(verify("the-secret", &random, body, &value));
        assert!(!verify("other-secret", &random, body, &value));
        assert!(!verify("the-secret", "other-random", body, &value));
        assert!(!verify("the-secret", &random, b"tampered", &value));
        assert!(!verify("the-secret", &random, body, "not-hex"));
    }

    #[test]
    fn test_authenticate() {
        let config: gramoconf::RecordingConfig = toml::from_str(
            r#"
[backends.cloud]
url = "https://cloud.example.com"
secret = "s3cr3t"
"#,
        )
        .unwrap();
        let registry = Registry::build(&config).unwrap();

        let body = br#"{"type":"stop","stop":{}}"#;
        let random = new_random();
        let value = checksum("s3cr3t", &random, body);

        let backend =
            authenticate(&registry, "https://cloud.example.com/", &random, &value, body).unwrap();
        assert_eq!(backend.id, "cloud");

        assert_eq!(
            authenticate(&registry, "https://other.example.com", &random, &value, body),
            Err(AuthError::UnknownOrigin(
                "https://other.example.com".to_string()
            ))
        );

        let wrong = checksum("wrong", &random, body);
        assert_eq!(
            authenticate(&registry, "https://cloud.example.com", &random, &wrong, body),
            Err(AuthError::AuthenticationFailed)
        );

        let oversized = vec![b'x'; 2048];
        assert!(matches!(
            authenticate(
                &registry,
                "https://cloud.example.com",
                &random,
                &value,
                &oversized
            ),
            Err(AuthError::BodyTooLarge { size: 2048, .. })
        ));
    }

    #[test]
    fn test_is_address_in_networks() {
        let cases: &[(&str, &[&str], bool)] = &[
            ("192.168.57.42", &[], false),
            ("192.168.57.42", &["192.168.58.0/24"], false),
            ("192.168.57.42", &["192.168.57.0/24"], true),
            ("2001:db8::abc", &[], false),
            ("2001:db8::abc", &["2001:db8::b00/120"], false),
            ("2001:db8::abc", &["2001:db8::a00/120"], true),
            (
                "192.168.57.42",
                &["192.168.58.0/24", "2001:db8::a00/120", "192.168.57.42"],
                true,
            ),
            (
                "192.168.59.42",
                &["192.168.58.0/24", "2001:db8::a00/120", "192.168.57.42"],
                false,
            ),
        ];

        for (address, entries, expected) in cases {
            let addr: IpAddr = address.parse().unwrap();
            assert_eq!(
                is_address_in_networks(addr, &networks(entries)),
                *expected,
                "address {address} networks {entries:?}"
            );
        }
    }

    #[test]
    fn test_remote_address_without_trusted_proxies() {
        let fix = proxies(&[]);
        assert_eq!(fix.remote_address("4.8.15.16", None), "4.8.15.16");
        assert_eq!(
            fix.remote_address("4.8.15.16", Some("23.42.108.0")),
            "4.8.15.16"
        );
        assert_eq!(
            fix.remote_address("4.8.15.16:12345", None),
            "4.8.15.16:12345"
        );
        assert_eq!(
            fix.remote_address("2001:db8:4815::16", Some("2001:db8:2342::108")),
            "2001:db8:4815::16"
        );
    }

    #[test]
    fn test_remote_address_with_untrusted_peer() {
        let fix = proxies(&["10.11.12.13"]);
        assert_eq!(
            fix.remote_address("4.8.15.16", Some("23.42.108.0")),
            "4.8.15.16"
        );
        assert_eq!(
            fix.remote_address("4.8.15.16", Some("23.42.108.0, 10.11.12.13")),
            "4.8.15.16"
        );
    }

    #[test]
    fn test_remote_address_with_trusted_peer() {
        let fix = proxies(&["4.8.15.16"]);
        assert_eq!(fix.remote_address("4.8.15.16", None), "4.8.15.16");
        assert_eq!(
            fix.remote_address("4.8.15.16", Some("23.42.108.0")),
            "23.42.108.0"
        );
        assert_eq!(
            fix.remote_address("4.8.15.16", Some("10.11.12.13, 23.42.108.0")),
            "23.42.108.0"
        );

        let fix = proxies(&["4.8.15.0/24"]);
        assert_eq!(
            fix.remote_address("4.8.15.16", Some("23.42.108.0")),
            "23.42.108.0"
        );

        let fix = proxies(&["2001:db8:4815::16"]);
        assert_eq!(
            fix.remote_address("2001:db8:4815::16", Some("2001:db8:2342::108")),
            "2001:db8:2342::108"
        );
    }

    #[test]
    fn test_remote_address_walks_through_trusted_chain() {
        let fix = proxies(&["4.8.15.16", "10.11.12.0/24"]);
        assert_eq!(
            fix.remote_address("4.8.15.16", Some("23.42.108.0, 10.11.12.13")),
            "23.42.108.0"
        );
        assert_eq!(
            fix.remote_address(
                "4.8.15.16",
                Some("10.11.12.15, 23.42.108.0, 10.11.12.14, 10.11.12.13")
            ),
            "23.42.108.0"
        );

        // A trusted address in the middle of the chain only shields what is
        // to its left while the walk is still inside trusted territory.
        let fix = proxies(&["4.8.15.0/24"]);
        assert_eq!(
            fix.remote_address("4.8.15.16", Some("23.42.108.0, 4.8.15.108")),
            "23.42.108.0"
        );
    }

    #[test]
    fn test_remote_address_strips_ports_from_forwarded_entries() {
        let fix = proxies(&["4.8.15.16", "10.11.12.13", "10.11.12.14", "10.11.12.15"]);
        assert_eq!(
            fix.remote_address(
                "4.8.15.16:12345",
                Some("10.11.12.15:23456, 23.42.108.0:34567, 10.11.12.14:45678, 10.11.12.13:56789")
            ),
            "23.42.108.0"
        );
    }

    #[test]
    fn test_remote_address_stops_at_invalid_entries() {
        let fix = proxies(&["4.8.15.0/24"]);
        assert_eq!(
            fix.remote_address("4.8.15.16", Some("not-an-ip")),
            "4.8.15.16"
        );
        assert_eq!(
            fix.remote_address("4.8.15.16", Some("23.42.108.0, not-an-ip")),
            "4.8.15.16"
        );
        assert_eq!(
            fix.remote_address("4.8.15.16", Some("23.42.108.0, not-an-ip, 4.8.15.108")),
            "4.8.15.108"
        );
        assert_eq!(
            fix.remote_address(
                "4.8.15.16",
                Some(",,not-an-ip,,23.42.108.0,,,     ,    4.8.15.108   ")
            ),
            "4.8.15.108"
        );
    }

    #[test]
    fn test_address_without_port() {
        let cases: &[(&str, &str)] = &[
            ("192.168.0.42", "192.168.0.42"),
            ("192.168.0.42:12345", "192.168.0.42"),
            ("::1", "::1"),
            ("2001:db8::0", "2001:db8::0"),
            ("[::1]", "::1"),
            ("[2001:db8::0]", "2001:db8::0"),
            ("[::1]:12345", "::1"),
            ("[2001:db8::0]:12345", "2001:db8::0"),
            ("not-an-ip", "not-an-ip"),
            ("not-an-ip:at-all", "not-an-ip"),
            ("not:an:ip::at-all", "not:an:ip::at-all"),
            ("[not:an:ip][very][::weird]", "not:an:ip][very][::weird"),
        ];

        for (address, expected) in cases {
            assert_eq!(address_without_port(address), *expected, "address {address}");
        }
    }

    #[test]
    fn test_network_parse_rejects_garbage() {
        assert!(Network::parse("not-a-network").is_none());
        assert!(Network::parse("192.168.0.0/33").is_none());
        assert!(Network::parse("2001:db8::/129").is_none());
        assert!(Network::parse("192.168.0.0/abc").is_none());
    }
}
