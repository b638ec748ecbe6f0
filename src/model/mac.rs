//! 6-byte hardware address with the helpers enrichment relies on.

use std::fmt;
use std::str::FromStr;

use pnet::util::MacAddr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 6-byte hardware address.
///
/// Serialized as the canonical lowercase colon form so snapshots and logs
/// stay human readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Mac([u8; 6]);

impl Mac {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }

    /// True when the locally-administered bit of the first octet is set,
    /// i.e. the lower nibble is one of 0x2, 0x6, 0xA, 0xE. Clients use such
    /// addresses for MAC privacy, so no vendor can be derived from them.
    pub fn is_randomized(&self) -> bool {
        if self.is_zero() {
            return false;
        }
        matches!(self.0[0] & 0x0f, 0x2 | 0x6 | 0xa | 0xe)
    }

    /// First three octets as uppercase hex, the key used by the OUI table.
    pub fn oui_prefix(&self) -> String {
        format!("{:02X}{:02X}{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for Mac {
    type Err = String;

    /// Accepts colon or hyphen separated hex octets.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split([':', '-']) {
            if count == 6 {
                return Err(format!("invalid mac {s:?}"));
            }
            octets[count] =
                u8::from_str_radix(part, 16).map_err(|_| format!("invalid mac {s:?}"))?;
            count += 1;
        }
        if count != 6 {
            return Err(format!("invalid mac {s:?}"));
        }
        Ok(Self(octets))
    }
}

impl From<MacAddr> for Mac {
    fn from(m: MacAddr) -> Self {
        Self([m.0, m.1, m.2, m.3, m.4, m.5])
    }
}

impl From<Mac> for MacAddr {
    fn from(m: Mac) -> Self {
        MacAddr::new(m.0[0], m.0[1], m.0[2], m.0[3], m.0[4], m.0[5])
    }
}

impl Serialize for Mac {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Mac {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let mac: Mac = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac.octets(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");

        let hyphens: Mac = "AA-BB-CC-DD-EE-FF".parse().unwrap();
        assert_eq!(hyphens, mac);

        assert!("aa:bb:cc".parse::<Mac>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<Mac>().is_err());
        assert!("zz:bb:cc:dd:ee:ff".parse::<Mac>().is_err());
    }

    #[test]
    fn test_oui_prefix() {
        let mac: Mac = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac.oui_prefix(), "AABBCC");
    }

    #[test]
    fn test_is_randomized() {
        for nibble in [0x2u8, 0x6, 0xa, 0xe] {
            let mac = Mac::new([0x10 | nibble, 0, 0, 0, 0, 1]);
            assert!(mac.is_randomized(), "nibble {nibble:x}");
        }
        for nibble in [0x0u8, 0x1, 0x3, 0x4, 0x5, 0x7, 0x8, 0x9, 0xb, 0xc, 0xd, 0xf] {
            let mac = Mac::new([nibble, 0, 0, 0, 0, 1]);
            assert!(!mac.is_randomized(), "nibble {nibble:x}");
        }
        assert!(!Mac::default().is_randomized());
    }
}
