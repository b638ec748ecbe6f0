//! A named CIDR-defined network under management.

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// A network the sweeper walks and the store tracks. Uniqueness is by
/// prefix: two stored networks never cover the same base address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub prefix: IpNetwork,
    /// When the discovery sweep last walked this network.
    pub last_sweep: Option<DateTime<Utc>>,
}

impl Network {
    pub fn new(name: impl Into<String>, prefix: IpNetwork) -> Self {
        Self {
            name: name.into(),
            prefix,
            last_sweep: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_contains_base() {
        let net = Network::new("home", "192.168.1.0/24".parse().unwrap());
        assert!(net.prefix.contains("192.168.1.42".parse().unwrap()));
        assert!(!net.prefix.contains("192.168.2.1".parse().unwrap()));
    }
}
