//! Protocol header lengths used to size messages on the wire.

use crate::nodes::NodeKind;
use cellsim_common::{Protocol, V2xMessage};
use serde::{Deserialize, Serialize};

const BITS_PER_BYTE: u64 = 8;

/// Header lengths in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeaderLengths {
    pub cellular_header: u64,
    pub ethernet_header: u64,
    pub ip_header: u64,
    pub udp_header: u64,
    pub tcp_header: u64,
}

impl Default for HeaderLengths {
    fn default() -> Self {
        HeaderLengths {
            cellular_header: 18,
            ethernet_header: 14,
            ip_header: 20,
            udp_header: 8,
            tcp_header: 20,
        }
    }
}

impl HeaderLengths {
    /// Length of `message` in bits including all headers.
    ///
    /// Backbone nodes use the ethernet link header, everything else the
    /// cellular one.
    pub fn message_bits(&self, message: &V2xMessage, endpoint: NodeKind) -> u64 {
        let link = if endpoint.is_backbone() {
            self.ethernet_header
        } else {
            self.cellular_header
        };
        let transport = match message.protocol() {
            Protocol::Udp => self.udp_header,
            Protocol::Tcp => self.tcp_header,
        };
        (link + self.ip_header + transport + message.payload_bytes) * BITS_PER_BYTE
    }
}
