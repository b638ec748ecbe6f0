//! Inclusive address ranges.
//!
//! The ASN and country feeds publish arbitrary from/to spans that do not
//! collapse losslessly into CIDR prefixes, so lookups run against closed
//! ranges instead.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An inclusive `[from, to]` range of addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    from: IpAddr,
    to: IpAddr,
}

impl IpRange {
    pub fn new(from: IpAddr, to: IpAddr) -> Self {
        Self { from, to }
    }

    pub fn from(&self) -> IpAddr {
        self.from
    }

    pub fn to(&self) -> IpAddr {
        self.to
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.from <= addr && addr <= self.to
    }
}

impl Default for IpRange {
    fn default() -> Self {
        Self {
            from: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            to: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

impl FromStr for IpRange {
    type Err = String;

    /// Parses the `"a-b"` form used by the reference feeds.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (from, to) = s.split_once('-').ok_or_else(|| format!("invalid range {s:?}"))?;
        let from: IpAddr = from.trim().parse().map_err(|_| format!("invalid range {s:?}"))?;
        let to: IpAddr = to.trim().parse().map_err(|_| format!("invalid range {s:?}"))?;
        if to < from {
            return Err(format!("inverted range {s:?}"));
        }
        Ok(Self { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let r: IpRange = "1.0.0.0-1.0.0.255".parse().unwrap();
        assert_eq!(r.from(), IpAddr::V4(Ipv4Addr::new(1, 0, 0, 0)));
        assert_eq!(r.to(), IpAddr::V4(Ipv4Addr::new(1, 0, 0, 255)));

        assert!("1.0.0.0".parse::<IpRange>().is_err());
        assert!("1.0.0.255-1.0.0.0".parse::<IpRange>().is_err());
        assert!("bogus-1.0.0.0".parse::<IpRange>().is_err());
    }

    #[test]
    fn test_contains() {
        let r: IpRange = "10.0.0.10-10.0.0.20".parse().unwrap();
        assert!(r.contains("10.0.0.10".parse().unwrap()));
        assert!(r.contains("10.0.0.15".parse().unwrap()));
        assert!(r.contains("10.0.0.20".parse().unwrap()));
        assert!(!r.contains("10.0.0.9".parse().unwrap()));
        assert!(!r.contains("10.0.0.21".parse().unwrap()));
    }

    #[test]
    fn test_display_round_trip() {
        let r: IpRange = "192.168.1.1-192.168.1.254".parse().unwrap();
        assert_eq!(r.to_string().parse::<IpRange>().unwrap(), r);
    }
}
