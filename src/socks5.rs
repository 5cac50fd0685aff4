use std::net::Ipv4Addr;
use thiserror::Error;

// RSV: Fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

/// Version represents available SOCKS proxy versions.
/// Only SOCKS5 is serviced here.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Version {
    Socks5 = 0x05,
}

/// AuthMethod represents the SOCKS5 authentication methods the
/// server can answer with
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    // 0x01 - 0x02: GSSAPI and username/password, not serviced
    // 0x03 - 0x7f: IANA reserved
    // 0x80 - 0xFE: private methods
    NoAcceptable = 0xFF,
}

/// Command represents SOCKS5 protocol commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

/// Command implementation block
impl Command {
    /// from_byte converts a byte to its related SOCKS5 protocol command
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

/// ReplyCode holds the subset of SOCKS5 reply codes this server emits
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    HostUnreachable = 0x04,
    CommandNotSupported = 0x07,
    AddrTypeNotSupported = 0x08,
}

/// ProtocolError covers client messages this server refuses to parse
/// any further. A short read is never an error -> decoders signal it
/// with `Ok(None)` instead so the caller can keep reading.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version: {0:#04x}")]
    BadVersion(u8),

    #[error("unknown address type: {0:#04x}")]
    BadAddressType(u8),

    #[error("malformed domain name in request")]
    BadDomain,
}

/// Greeting is a parsed client hello: the list of authentication
/// methods the client offers
#[derive(Debug, PartialEq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

/// Greeting implementation block
impl Greeting {
    /// select_method picks the authentication method the server answers
    /// with. Only no-auth is implemented; a client offering anything else
    /// exclusively is refused with NoAcceptable.
    pub fn select_method(&self) -> AuthMethod {
        if self.methods.contains(&(AuthMethod::NoAuth as u8)) {
            AuthMethod::NoAuth
        } else {
            AuthMethod::NoAcceptable
        }
    }
}

/// RequestAddr is the destination address carried in a connection request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestAddr {
    Ipv4(Ipv4Addr),
    Domain(String),
    /// ATYP=4. Parsed so the message can be consumed, but always refused.
    Ipv6,
}

/// Request is a parsed client connection request
#[derive(Debug, PartialEq)]
pub struct Request {
    pub command: u8,
    pub addr: RequestAddr,
    pub port: u16,
}

/// decode_greeting parses a SOCKS5 client hello from the front of `buf`.
///
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
///
/// Returns the greeting and the number of bytes consumed, or `Ok(None)`
/// when the message is not complete yet.
pub fn decode_greeting(buf: &[u8]) -> Result<Option<(Greeting, usize)>, ProtocolError> {
    let Some(&version) = buf.first() else {
        return Ok(None);
    };
    if version != Version::Socks5 as u8 {
        return Err(ProtocolError::BadVersion(version));
    }

    let Some(&n_methods) = buf.get(1) else {
        return Ok(None);
    };
    let end = 2 + n_methods as usize;
    if buf.len() < end {
        return Ok(None);
    }

    let greeting = Greeting {
        methods: buf[2..end].to_vec(),
    };
    Ok(Some((greeting, end)))
}

/// decode_request parses a SOCKS5 connection request from the front of `buf`.
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// The port is the trailing two bytes of the message, big-endian.
/// Returns `Ok(None)` when the message is not complete yet.
pub fn decode_request(buf: &[u8]) -> Result<Option<(Request, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != Version::Socks5 as u8 {
        return Err(ProtocolError::BadVersion(buf[0]));
    }
    if buf.len() < 4 {
        return Ok(None);
    }

    let command = buf[1];
    let atyp = buf[3];

    // Variable-length address field starts at offset 4
    let (addr, addr_len) = match atyp {
        0x01 => {
            if buf.len() < 4 + 6 {
                return Ok(None);
            }
            let octets: [u8; 4] = buf[4..8].try_into().expect("4-byte slice");
            (RequestAddr::Ipv4(Ipv4Addr::from(octets)), 4)
        }
        0x03 => {
            // First octet of the field is the number of name octets to follow
            let Some(&name_len) = buf.get(4) else {
                return Ok(None);
            };
            if name_len == 0 {
                return Err(ProtocolError::BadDomain);
            }
            if buf.len() < 5 + name_len as usize + 2 {
                return Ok(None);
            }
            let name = String::from_utf8(buf[5..5 + name_len as usize].to_vec())
                .map_err(|_| ProtocolError::BadDomain)?;
            (RequestAddr::Domain(name), 1 + name_len as usize)
        }
        0x04 => {
            if buf.len() < 4 + 18 {
                return Ok(None);
            }
            (RequestAddr::Ipv6, 16)
        }
        other => return Err(ProtocolError::BadAddressType(other)),
    };

    let port_at = 4 + addr_len;
    let port = u16::from_be_bytes([buf[port_at], buf[port_at + 1]]);

    let request = Request {
        command,
        addr,
        port,
    };
    Ok(Some((request, port_at + 2)))
}

/// encode_method_reply builds the server's method selection answer.
///
/// ```text
/// +----+--------+
/// |VER | METHOD |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
pub fn encode_method_reply(method: AuthMethod) -> [u8; 2] {
    [Version::Socks5 as u8, method as u8]
}

/// encode_reply builds the fixed 10-byte server reply. The bound address
/// and port are always zeroed rather than echoing the real ones.
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   |    4     |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
pub fn encode_reply(code: ReplyCode) -> [u8; 10] {
    [
        Version::Socks5 as u8,
        code as u8,
        RSV,
        0x01, // ATYP = IPv4
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
    ]
}
