//! CIDR parsing and gateway derivation for managed bridge networks.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrError {
    #[error("missing '/' in CIDR: {0}")]
    MissingPrefix(String),

    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Bits set below the prefix, e.g. `10.0.0.5/24`.
    #[error("{0} has host bits set")]
    HostBitsSet(String),
}

/// An IPv4 or IPv6 address range in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    address: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    pub fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// First usable host address in the range, reserved as the gateway.
    ///
    /// Point-to-point (`/31`, `/127`) and single-host (`/32`, `/128`) ranges
    /// have no network/broadcast reservation, so their first address is used.
    pub fn gateway(&self) -> IpAddr {
        match self.address {
            IpAddr::V4(addr) => {
                if self.prefix_len >= 31 {
                    return IpAddr::V4(addr);
                }
                IpAddr::V4(Ipv4Addr::from(u32::from(addr) + 1))
            }
            IpAddr::V6(addr) => {
                if self.prefix_len >= 127 {
                    return IpAddr::V6(addr);
                }
                IpAddr::V6(Ipv6Addr::from(u128::from(addr) + 1))
            }
        }
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(CidrError::MissingPrefix(s.to_string()));
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| CidrError::InvalidAddress(addr_str.to_string()))?;
        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| CidrError::InvalidPrefix(prefix_str.to_string()))?;

        let masked = match address {
            IpAddr::V4(addr) => {
                if prefix_len > 32 {
                    return Err(CidrError::InvalidPrefix(prefix_str.to_string()));
                }
                let mask = u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0);
                IpAddr::V4(Ipv4Addr::from(u32::from(addr) & mask))
            }
            IpAddr::V6(addr) => {
                if prefix_len > 128 {
                    return Err(CidrError::InvalidPrefix(prefix_str.to_string()));
                }
                let mask = u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0);
                IpAddr::V6(Ipv6Addr::from(u128::from(addr) & mask))
            }
        };
        if masked != address {
            return Err(CidrError::HostBitsSet(s.to_string()));
        }

        Ok(Self {
            address,
            prefix_len,
        })
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}
