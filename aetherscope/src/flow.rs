use std::fmt;
use std::net::IpAddr;

/// Network and transport endpoint tuple identifying a reassembled TCP
/// stream. Flows are directional: the reverse path of a connection is a
/// separate flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    /// Classify the flow relative to the observed client.
    ///
    /// Ingress means server to client (public source, private destination),
    /// egress the opposite. Flows between two private or two public
    /// endpoints cannot be classified.
    pub fn direction(&self) -> FlowDirection {
        let src_private = is_private(self.src_addr);
        let dst_private = is_private(self.dst_addr);

        // Check for inbound first since that's the majority.
        if dst_private && !src_private {
            return FlowDirection::Ingress;
        }

        if src_private && !dst_private {
            return FlowDirection::Egress;
        }

        FlowDirection::Unknown
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_addr, self.src_port, self.dst_addr, self.dst_port
        )
    }
}

/// Direction of a frame: inbound to the client or outbound from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowDirection {
    #[default]
    Unknown,
    Ingress,
    Egress,
}

/// An address is private when it is loopback, link-local, or inside the
/// RFC 1918 blocks `10.0.0.0/8`, `172.16.0.0/12`, `192.168.0.0/16`.
pub fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_link_local() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}
