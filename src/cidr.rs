//! IPv4 CIDR arithmetic for carving per-zone subnets out of a VPC block.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Errors from parsing or partitioning a CIDR block
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrError {
    #[error("'{0}' is not a valid IPv4 network range")]
    Parse(String),

    #[error("prefix length {0} is out of range for IPv4")]
    Prefix(u8),

    #[error("network address has host bits set")]
    HostBits,
}

/// An IPv4 network range in CIDR notation, e.g. `10.0.0.0/16`.
///
/// Strict: the address must be the network address of the block (no host
/// bits set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    addr: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Build a CIDR block, rejecting out-of-range prefixes and host bits.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, CidrError> {
        if prefix > 32 {
            return Err(CidrError::Prefix(prefix));
        }
        let addr = u32::from(addr);
        if addr & !mask(prefix) != 0 {
            return Err(CidrError::HostBits);
        }
        Ok(Self { addr, prefix })
    }

    /// The network address of this block.
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.addr)
    }

    /// The prefix length of this block.
    pub fn prefix_len(&self) -> u8 {
        self.prefix
    }

    /// Total number of addresses covered by this block.
    pub fn num_addresses(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    /// Whether `other` is fully contained in this block.
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && (other.addr & mask(self.prefix)) == self.addr
    }

    /// Whether the two blocks share any address.
    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Partition this block into subnets `extra_bits` longer, returning the
    /// first `count` of them in address order.
    pub fn subnets(&self, extra_bits: u8, count: usize) -> Result<Vec<Ipv4Cidr>, CidrError> {
        let prefix = self.prefix + extra_bits;
        if prefix > 32 {
            return Err(CidrError::Prefix(prefix));
        }
        let step = 1u64 << (32 - u32::from(prefix));
        let total = 1usize << extra_bits;
        Ok((0..count.min(total))
            .map(|i| Ipv4Cidr {
                addr: self.addr + (i as u64 * step) as u32,
                prefix,
            })
            .collect())
    }
}

/// Netmask for a prefix length, as a host-order u32.
fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

/// Extra prefix bits needed so one partition exists per item: `ceil(log2(n))`.
pub fn extra_prefix_bits(count: usize) -> u8 {
    count.max(1).next_power_of_two().trailing_zeros() as u8
}

impl FromStr for Ipv4Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or_else(|| CidrError::Parse(s.to_string()))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| CidrError::Parse(s.to_string()))?;
        let prefix: u8 = prefix.parse().map_err(|_| CidrError::Parse(s.to_string()))?;
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_roundtrip() {
        let cidr: Ipv4Cidr = "10.0.0.0/16".parse().unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.0/16");
        assert_eq!(cidr.prefix_len(), 16);
        assert_eq!(cidr.num_addresses(), 65536);
    }

    #[test]
    fn rejects_host_bits() {
        assert_eq!("10.0.0.1/16".parse::<Ipv4Cidr>(), Err(CidrError::HostBits));
    }

    #[test]
    fn rejects_bad_input() {
        assert!("10.0.0.0".parse::<Ipv4Cidr>().is_err());
        assert!("not-a-network/16".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn three_zone_partition_of_a_slash_16() {
        let cidr: Ipv4Cidr = "10.0.0.0/16".parse().unwrap();
        let extra = extra_prefix_bits(3);
        assert_eq!(extra, 2);

        let subnets = cidr.subnets(extra, 3).unwrap();
        let rendered: Vec<String> = subnets.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["10.0.0.0/18", "10.0.64.0/18", "10.0.128.0/18"]);
    }

    #[test]
    fn eight_zone_partition_is_nested_and_disjoint() {
        let cidr: Ipv4Cidr = "10.0.0.0/16".parse().unwrap();
        let subnets = cidr.subnets(extra_prefix_bits(8), 8).unwrap();

        assert_eq!(subnets.len(), 8);
        for (i, a) in subnets.iter().enumerate() {
            assert!(cidr.contains(a));
            assert_eq!(a.prefix_len(), 19);
            for b in &subnets[i + 1..] {
                assert!(!a.overlaps(b), "{a} overlaps {b}");
            }
        }
    }

    #[test]
    fn subnet_prefix_overflow() {
        let cidr: Ipv4Cidr = "10.0.0.0/30".parse().unwrap();
        assert!(cidr.subnets(3, 8).is_err());
    }

    #[test]
    fn extra_bits_covers_counts() {
        assert_eq!(extra_prefix_bits(1), 0);
        assert_eq!(extra_prefix_bits(2), 1);
        assert_eq!(extra_prefix_bits(3), 2);
        assert_eq!(extra_prefix_bits(4), 2);
        assert_eq!(extra_prefix_bits(5), 3);
        assert_eq!(extra_prefix_bits(8), 3);
    }
}
