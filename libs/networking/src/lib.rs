//! Networking utilities for the control plane.
//!
//! This library provides the pure parsing half of the allocation pool:
//! - Address specifications: a single IPv4/IPv6 address, or CIDR notation
//!   expanded to the host addresses contained in the block
//! - Port specifications: singles, comma-separated lists, and inclusive
//!   ranges, normalized to a sorted deduplicated set
//!
//! Expansion is bounded by a caller-supplied cap so a fat-fingered `/8`
//! cannot turn into millions of allocation rows.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

/// The valid port range for allocations.
pub const PORT_MIN: u16 = 1;
pub const PORT_MAX: u16 = 65535;

/// Errors produced while parsing address or port specifications.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecError {
    /// Malformed IP address or CIDR notation.
    #[error("invalid address specification: {0}")]
    InvalidAddress(String),

    /// A CIDR block would expand to more addresses than the configured cap.
    #[error("address block expands to {count} addresses, exceeding the cap of {max}")]
    RangeTooLarge { count: u128, max: u64 },

    /// A port token is malformed or outside `[1, 65535]`.
    #[error("invalid port token: {0}")]
    InvalidPort(String),
}

// ============================================================================
// Address specifications
// ============================================================================

/// An IPv4 CIDR block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Block {
    /// Base (network) address of the block.
    pub address: Ipv4Addr,

    /// Prefix length (e.g. 24 for /24).
    pub prefix_len: u8,
}

impl Ipv4Block {
    /// Create a new block, masking the address to the prefix.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, SpecError> {
        if prefix_len > 32 {
            return Err(SpecError::InvalidAddress(format!(
                "prefix length {prefix_len} exceeds 32"
            )));
        }

        let masked = mask_ipv4(address, prefix_len);

        Ok(Self {
            address: masked,
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g. "192.168.10.0/24").
    pub fn from_cidr(s: &str) -> Result<Self, SpecError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(SpecError::InvalidAddress(format!("missing '/' in CIDR: {s}")));
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| SpecError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| SpecError::InvalidAddress(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Number of host addresses in the block.
    ///
    /// Blocks with a prefix of /30 or wider exclude the network and
    /// broadcast addresses; /31 and /32 contain every address.
    pub fn host_count(&self) -> u128 {
        let total = 1u128 << (32 - self.prefix_len);
        if self.prefix_len >= 31 {
            total
        } else {
            total - 2
        }
    }

    /// The host addresses contained in the block, in ascending order.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u32::from(self.address);
        let total = if self.prefix_len == 0 {
            u32::MAX as u64 + 1
        } else {
            1u64 << (32 - self.prefix_len)
        };

        let (start, end) = if self.prefix_len >= 31 {
            (0u64, total)
        } else {
            // Skip network and broadcast addresses.
            (1u64, total - 1)
        };

        (start..end).map(move |offset| Ipv4Addr::from(base.wrapping_add(offset as u32)))
    }
}

impl std::fmt::Display for Ipv4Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// An IPv6 CIDR block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Block {
    /// Base (network) address of the block.
    pub address: Ipv6Addr,

    /// Prefix length (e.g. 64 for /64).
    pub prefix_len: u8,
}

impl Ipv6Block {
    /// Create a new block, masking the address to the prefix.
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Result<Self, SpecError> {
        if prefix_len > 128 {
            return Err(SpecError::InvalidAddress(format!(
                "prefix length {prefix_len} exceeds 128"
            )));
        }

        let masked = mask_ipv6(address, prefix_len);

        Ok(Self {
            address: masked,
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g. "2001:db8::/120").
    pub fn from_cidr(s: &str) -> Result<Self, SpecError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(SpecError::InvalidAddress(format!("missing '/' in CIDR: {s}")));
        };

        let address = Ipv6Addr::from_str(addr_str)
            .map_err(|_| SpecError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| SpecError::InvalidAddress(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Number of host addresses in the block.
    ///
    /// The all-zero network address is excluded except for /128. A /0 block
    /// saturates to `u128::MAX`; the one address that cannot be counted is
    /// the excluded network address, so no host is lost.
    pub fn host_count(&self) -> u128 {
        if self.prefix_len == 0 {
            u128::MAX
        } else if self.prefix_len >= 128 {
            1
        } else {
            (1u128 << (128 - self.prefix_len)) - 1
        }
    }

    /// The host addresses contained in the block, in ascending order.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv6Addr> {
        let base = u128::from_be_bytes(self.address.octets());
        // Skip the network address (::0 within the block) except for /128.
        let first = if self.prefix_len >= 128 { 0u128 } else { 1u128 };
        let count = self.host_count();

        (0..count).map(move |offset| Ipv6Addr::from((base + first + offset).to_be_bytes()))
    }
}

impl std::fmt::Display for Ipv6Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from(bits & mask)
}

/// Mask an IPv6 address to a prefix length.
fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}

/// Parse an address specification into concrete addresses.
///
/// Accepts a single IPv4/IPv6 address or CIDR notation. CIDR blocks expand
/// to every host address in the block, ascending and deduplicated. The
/// expansion is rejected with [`SpecError::RangeTooLarge`] before any
/// address is materialized when the block holds more than `max_addresses`.
pub fn parse_address_spec(spec: &str, max_addresses: u64) -> Result<Vec<IpAddr>, SpecError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(SpecError::InvalidAddress(spec.to_string()));
    }

    if !spec.contains('/') {
        let addr =
            IpAddr::from_str(spec).map_err(|_| SpecError::InvalidAddress(spec.to_string()))?;
        return Ok(vec![addr]);
    }

    if spec.contains(':') {
        let block = Ipv6Block::from_cidr(spec)?;
        let count = block.host_count();
        if count > u128::from(max_addresses) {
            return Err(SpecError::RangeTooLarge {
                count,
                max: max_addresses,
            });
        }
        Ok(block.hosts().map(IpAddr::V6).collect())
    } else {
        let block = Ipv4Block::from_cidr(spec)?;
        let count = block.host_count();
        if count > u128::from(max_addresses) {
            return Err(SpecError::RangeTooLarge {
                count,
                max: max_addresses,
            });
        }
        Ok(block.hosts().map(IpAddr::V4).collect())
    }
}

// ============================================================================
// Port specifications
// ============================================================================

/// Parse a port specification into a sorted, deduplicated set of ports.
///
/// Accepts a single port (`"8080"`), a comma-separated list (`"80,443"`),
/// inclusive ranges (`"8000-8010"`), and combinations of all three. Every
/// value must be within `[1, 65535]`; the offending token is reported in
/// [`SpecError::InvalidPort`].
pub fn parse_port_spec(spec: &str) -> Result<Vec<u16>, SpecError> {
    let mut ports = std::collections::BTreeSet::new();

    let tokens: Vec<&str> = spec.split(',').map(str::trim).collect();
    if tokens.iter().all(|t| t.is_empty()) {
        return Err(SpecError::InvalidPort(spec.trim().to_string()));
    }

    for token in tokens {
        if token.is_empty() {
            return Err(SpecError::InvalidPort(token.to_string()));
        }

        if let Some((lo_str, hi_str)) = token.split_once('-') {
            let lo = parse_port_token(lo_str.trim(), token)?;
            let hi = parse_port_token(hi_str.trim(), token)?;
            if lo > hi {
                return Err(SpecError::InvalidPort(token.to_string()));
            }
            ports.extend(lo..=hi);
        } else {
            ports.insert(parse_port_token(token, token)?);
        }
    }

    Ok(ports.into_iter().collect())
}

/// Parse one numeric port value, attributing failures to the whole token.
fn parse_port_token(value: &str, token: &str) -> Result<u16, SpecError> {
    let port: u32 = value
        .parse()
        .map_err(|_| SpecError::InvalidPort(token.to_string()))?;

    if port < u32::from(PORT_MIN) || port > u32::from(PORT_MAX) {
        return Err(SpecError::InvalidPort(token.to_string()));
    }

    Ok(port as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_single_ipv4_address() {
        let addrs = parse_address_spec("10.0.0.5", 1024).unwrap();
        assert_eq!(addrs, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_single_ipv6_address() {
        let addrs = parse_address_spec("2001:db8::1", 1024).unwrap();
        assert_eq!(addrs, vec!["2001:db8::1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_ipv4_cidr_excludes_network_and_broadcast() {
        let addrs = parse_address_spec("192.168.1.0/29", 1024).unwrap();
        let expected: Vec<IpAddr> = (1..=6)
            .map(|i| format!("192.168.1.{i}").parse().unwrap())
            .collect();
        assert_eq!(addrs, expected);
    }

    #[test]
    fn test_ipv4_slash_31_keeps_both_addresses() {
        let addrs = parse_address_spec("10.0.0.0/31", 1024).unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0], "10.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(addrs[1], "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_ipv4_slash_32_is_single_host() {
        let addrs = parse_address_spec("10.1.2.3/32", 1024).unwrap();
        assert_eq!(addrs, vec!["10.1.2.3".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_ipv4_cidr_is_masked_to_base() {
        // A stray host part in the CIDR is masked away, same block either way.
        let a = parse_address_spec("192.168.1.77/29", 1024).unwrap();
        let b = parse_address_spec("192.168.1.72/29", 1024).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_ipv4_cidr_ascending_and_unique() {
        let addrs = parse_address_spec("172.16.0.0/26", 1024).unwrap();
        assert_eq!(addrs.len(), 62);
        let mut sorted = addrs.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(addrs, sorted);
    }

    #[test]
    fn test_ipv6_cidr_skips_network_address() {
        let addrs = parse_address_spec("2001:db8:1::/126", 1024).unwrap();
        assert_eq!(addrs.len(), 3);
        assert_eq!(addrs[0], "2001:db8:1::1".parse::<IpAddr>().unwrap());
        assert_eq!(addrs[2], "2001:db8:1::3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_range_too_large_rejected_before_expansion() {
        let err = parse_address_spec("10.0.0.0/8", 1024).unwrap_err();
        match err {
            SpecError::RangeTooLarge { count, max } => {
                assert_eq!(count, (1u128 << 24) - 2);
                assert_eq!(max, 1024);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = parse_address_spec("2001:db8::/32", 1024).unwrap_err();
        assert!(matches!(err, SpecError::RangeTooLarge { .. }));
    }

    #[test]
    fn test_default_route_blocks_rejected_without_panicking() {
        let err = parse_address_spec("0.0.0.0/0", 1024).unwrap_err();
        assert!(matches!(err, SpecError::RangeTooLarge { .. }));

        let err = parse_address_spec("::/0", 1024).unwrap_err();
        match err {
            SpecError::RangeTooLarge { count, max } => {
                assert_eq!(count, u128::MAX);
                assert_eq!(max, 1024);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_cap_boundary_is_inclusive() {
        // /24 holds 254 hosts; a cap of exactly 254 admits it.
        assert!(parse_address_spec("10.0.0.0/24", 254).is_ok());
        assert!(parse_address_spec("10.0.0.0/24", 253).is_err());
    }

    #[rstest]
    #[case("")]
    #[case("not-an-ip")]
    #[case("10.0.0.256")]
    #[case("10.0.0.0/33")]
    #[case("2001:db8::/129")]
    #[case("10.0.0.0/abc")]
    #[case("10.0.0.0/")]
    fn test_invalid_address_specs(#[case] spec: &str) {
        let err = parse_address_spec(spec, 1024).unwrap_err();
        assert!(matches!(err, SpecError::InvalidAddress(_)), "{spec}: {err:?}");
    }

    #[test]
    fn test_single_port() {
        assert_eq!(parse_port_spec("8080").unwrap(), vec![8080]);
    }

    #[test]
    fn test_port_list_and_range_combined() {
        let ports = parse_port_spec("80,443,8000-8010").unwrap();
        let mut expected = vec![80, 443];
        expected.extend(8000..=8010);
        assert_eq!(ports, expected);
    }

    #[test]
    fn test_port_spec_deduplicates_and_sorts() {
        let ports = parse_port_spec("443,80,443,80-82").unwrap();
        assert_eq!(ports, vec![80, 81, 82, 443]);
    }

    #[test]
    fn test_port_boundaries() {
        assert_eq!(parse_port_spec("1").unwrap(), vec![1]);
        assert_eq!(parse_port_spec("65535").unwrap(), vec![65535]);
    }

    #[rstest]
    #[case("0", "0")]
    #[case("70000", "70000")]
    #[case("80,0", "0")]
    #[case("8000-70000", "8000-70000")]
    #[case("8010-8000", "8010-8000")]
    #[case("abc", "abc")]
    #[case("80,,443", "")]
    #[case("", "")]
    fn test_invalid_port_specs(#[case] spec: &str, #[case] offending: &str) {
        let err = parse_port_spec(spec).unwrap_err();
        assert_eq!(err, SpecError::InvalidPort(offending.to_string()));
    }

    proptest::proptest! {
        #[test]
        fn prop_port_spec_output_sorted_unique(ports in proptest::collection::vec(1u16..=65535, 1..32)) {
            let spec = ports
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let parsed = parse_port_spec(&spec).unwrap();

            let mut expected: Vec<u16> = ports.clone();
            expected.sort_unstable();
            expected.dedup();
            proptest::prop_assert_eq!(parsed, expected);
        }
    }
}
