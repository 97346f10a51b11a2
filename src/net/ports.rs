//! Listener port selection.

use crate::config::schema::{ResolvedConfiguration, GRPC_PORT, PORT};

pub const DEFAULT_PRIMARY_PORT: u16 = 80;
pub const DEFAULT_RPC_PORT: u16 = 81;

/// Ports for the two listeners.
///
/// The ports may be equal; a collision surfaces when the second listener
/// binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    /// HTTP/1.1 + HTTP/2 listener.
    pub primary: u16,
    /// HTTP/2-only listener for streaming RPC.
    pub rpc: u16,
}

impl Default for PortPair {
    fn default() -> Self {
        Self {
            primary: DEFAULT_PRIMARY_PORT,
            rpc: DEFAULT_RPC_PORT,
        }
    }
}

/// Read `PORT` and `GRPC_PORT`, defaulting each independently.
pub fn select_ports(config: &ResolvedConfiguration) -> PortPair {
    PortPair {
        primary: port_or(config, PORT, DEFAULT_PRIMARY_PORT),
        rpc: port_or(config, GRPC_PORT, DEFAULT_RPC_PORT),
    }
}

fn port_or(config: &ResolvedConfiguration, key: &str, default: u16) -> u16 {
    config
        .get_parsed::<u16>(key)
        .filter(|port| *port > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_ports_are_used() {
        let config = ResolvedConfiguration::from_pairs([("PORT", "5101"), ("GRPC_PORT", " 5111 ")]);
        assert_eq!(select_ports(&config), PortPair { primary: 5101, rpc: 5111 });
    }

    #[test]
    fn absent_ports_default_to_80_and_81() {
        let ports = select_ports(&ResolvedConfiguration::default());
        assert_eq!(ports, PortPair { primary: 80, rpc: 81 });
    }

    #[test]
    fn unusable_values_fall_back_independently() {
        for bad in ["", "abc", "-1", "0", "65536", "80.5"] {
            let config = ResolvedConfiguration::from_pairs([("PORT", bad), ("GRPC_PORT", "9001")]);
            assert_eq!(select_ports(&config), PortPair { primary: 80, rpc: 9001 }, "PORT={bad:?}");

            let config = ResolvedConfiguration::from_pairs([("PORT", "9000"), ("GRPC_PORT", bad)]);
            assert_eq!(select_ports(&config), PortPair { primary: 9000, rpc: 81 }, "GRPC_PORT={bad:?}");
        }
    }

    #[test]
    fn equal_ports_are_not_rejected() {
        let config = ResolvedConfiguration::from_pairs([("PORT", "7000"), ("GRPC_PORT", "7000")]);
        assert_eq!(select_ports(&config), PortPair { primary: 7000, rpc: 7000 });
    }
}
