use std::fmt;

/// Marker byte opening every envelope
pub const ENVELOPE_TAG: u8 = 0x75;

/// Marker introducing a 4-byte IPv4 destination address
pub const ADDRESS_V4_TAG: u8 = 0x04;

/// Marker introducing the optional original-sender address
pub const SENDER_TAG: u8 = 0x76;

/// Marker closing the envelope header; everything after it is payload
pub const TERMINATOR: u8 = 0x80;

/// Well-known local UDP port applications send local frames to
pub const DEFAULT_INGRESS_PORT: u16 = 55555;

/// Port relays accept tunnel connections on
pub const DEFAULT_TUNNEL_PORT: u16 = 55554;

/// Destination ports the relay never forwards to
pub const RESERVED_PORTS: [u16; 2] = [0, 1023];

/// Check whether a destination port is reserved
pub fn is_reserved_port(port: u16) -> bool {
    RESERVED_PORTS.contains(&port)
}

/// Three-byte envelope protocol version (`major.minor.patch`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl ProtocolVersion {
    /// Version written by this implementation
    pub const CURRENT: Self = Self::new(1, 0, 0);

    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }

    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2])
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [self.major, self.minor, self.patch]
    }

    /// Minor and patch revisions never change the header layout, so any
    /// version sharing our major is decodable.
    pub fn is_supported(&self) -> bool {
        self.major == Self::CURRENT.major
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
