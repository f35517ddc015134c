//! SOCKS5 frame encoding and decoding.
//!
//! The `parse_*` and `encode_*` functions are pure transforms over complete
//! frames. `read_handshake` and `read_request` pull exactly one frame off a
//! stream, using the length fields to decide how many bytes belong to it, and
//! then hand the bytes to the pure parser.

use crate::address::Address;
use crate::protocol::{AddressType, AuthMethod, Command, RSV, ReplyCode, Version};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// ParseError is returned when bytes do not form a valid frame
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),
}

impl ParseError {
    /// reply_code is the status sent to the client when a request fails to parse
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            ParseError::Malformed(_) => ReplyCode::ServerFailure,
            ParseError::UnsupportedAddressType(_) => ReplyCode::AddrTypeUnsupported,
        }
    }
}

/// FrameError is a ParseError, a frame from another protocol, or the I/O
/// error hit while reading the frame
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The peer does not speak SOCKS5, so no reply can be framed
    #[error("not a SOCKS5 frame (version {0:#04x})")]
    VersionMismatch(u8),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// HandshakeRequest is the client's greeting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub version: u8,
    pub methods: Vec<u8>,
}

/// ProxyRequest is a parsed client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub version: u8,
    pub command: Command,
    pub reserved: u8,
    pub address: Address,
    pub port: u16,
}

/// ProxyReply is the server's answer to a ProxyRequest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyReply {
    pub status: ReplyCode,
    pub address: Address,
    pub port: u16,
}

/// ProxyReply implementation block
impl ProxyReply {
    /// new builds a reply carrying a bound address
    pub fn new(status: ReplyCode, bound: SocketAddr) -> Self {
        Self {
            status,
            address: bound.ip().into(),
            port: bound.port(),
        }
    }

    /// failure builds a reply with a zeroed IPv4 address and port
    pub fn failure(status: ReplyCode) -> Self {
        Self {
            status,
            address: Address::unspecified(),
            port: 0,
        }
    }
}

/// parse_handshake parses a complete client greeting
pub fn parse_handshake(bytes: &[u8]) -> Result<HandshakeRequest, ParseError> {
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    let [version, n_methods, methods @ ..] = bytes else {
        return Err(ParseError::Malformed("handshake shorter than header"));
    };

    if *version != Version::SOCKS5 as u8 {
        return Err(ParseError::Malformed("not SOCKS5"));
    }

    if methods.len() != *n_methods as usize {
        return Err(ParseError::Malformed("method count does not match NMETHODS"));
    }

    Ok(HandshakeRequest {
        version: *version,
        methods: methods.to_vec(),
    })
}

/// encode_handshake_reply builds the server's method selection message
pub fn encode_handshake_reply(method: AuthMethod) -> [u8; 2] {
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    [Version::SOCKS5 as u8, method as u8]
}

/// parse_request parses a complete client request
pub fn parse_request(bytes: &[u8]) -> Result<ProxyRequest, ParseError> {
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let [version, command, reserved, atyp, body @ ..] = bytes else {
        return Err(ParseError::Malformed("request shorter than header"));
    };

    if *version != Version::SOCKS5 as u8 {
        return Err(ParseError::Malformed("not SOCKS5"));
    }

    if *reserved != RSV {
        return Err(ParseError::Malformed("reserved byte is not zero"));
    }

    let (address, port) = parse_address(*atyp, body)?;

    Ok(ProxyRequest {
        version: *version,
        command: Command::from_byte(*command),
        reserved: *reserved,
        address,
        port,
    })
}

/// encode_reply serializes a reply frame
pub fn encode_reply(reply: &ProxyReply) -> Vec<u8> {
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut frame = vec![Version::SOCKS5 as u8, reply.status as u8, RSV];
    frame.push(reply.address.address_type() as u8);

    match &reply.address {
        Address::IPv4(ip) => frame.extend_from_slice(&ip.octets()),
        Address::IPv6(ip) => frame.extend_from_slice(&ip.octets()),
        Address::DomainName(name) => {
            // Names longer than a length byte can describe are cut at 255
            let name = &name.as_bytes()[..name.len().min(u8::MAX as usize)];
            frame.push(name.len() as u8);
            frame.extend_from_slice(name);
        }
    }

    frame.extend_from_slice(&reply.port.to_be_bytes());
    frame
}

/// parse_reply parses a complete reply frame, as a client would
pub fn parse_reply(bytes: &[u8]) -> Result<ProxyReply, ParseError> {
    let [version, status, reserved, atyp, body @ ..] = bytes else {
        return Err(ParseError::Malformed("reply shorter than header"));
    };

    if *version != Version::SOCKS5 as u8 {
        return Err(ParseError::Malformed("not SOCKS5"));
    }

    if *reserved != RSV {
        return Err(ParseError::Malformed("reserved byte is not zero"));
    }

    let status = ReplyCode::from_byte(*status).ok_or(ParseError::Malformed("unassigned reply code"))?;
    let (address, port) = parse_address(*atyp, body)?;

    Ok(ProxyReply {
        status,
        address,
        port,
    })
}

/// parse_address decodes DST.ADDR/DST.PORT; `body` must hold exactly the
/// bytes the address type implies
fn parse_address(atyp: u8, body: &[u8]) -> Result<(Address, u16), ParseError> {
    let address_type = AddressType::from_byte(atyp).ok_or(ParseError::UnsupportedAddressType(atyp))?;

    let (address, port) = match address_type {
        AddressType::IPv4 => {
            let [a, b, c, d, p0, p1] = body else {
                return Err(ParseError::Malformed("IPv4 address length mismatch"));
            };
            (Address::IPv4(Ipv4Addr::new(*a, *b, *c, *d)), [*p0, *p1])
        }
        AddressType::IPv6 => {
            if body.len() != 18 {
                return Err(ParseError::Malformed("IPv6 address length mismatch"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[..16]);
            (Address::IPv6(Ipv6Addr::from(octets)), [body[16], body[17]])
        }
        AddressType::DomainName => {
            // First octet contains the number of octets to follow
            let [len, rest @ ..] = body else {
                return Err(ParseError::Malformed("missing domain length"));
            };
            let len = *len as usize;

            if len == 0 {
                return Err(ParseError::Malformed("domain length cannot be 0"));
            }

            if rest.len() != len + 2 {
                return Err(ParseError::Malformed("domain length mismatch"));
            }

            let name = std::str::from_utf8(&rest[..len])
                .map_err(|_| ParseError::Malformed("domain is not valid UTF-8"))?;
            (Address::DomainName(name.to_string()), [rest[len], rest[len + 1]])
        }
    };

    Ok((address, u16::from_be_bytes(port)))
}

/// read_handshake reads one greeting frame from the stream
pub async fn read_handshake<R>(stream: &mut R) -> Result<HandshakeRequest, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = vec![0u8; 2];
    stream.read_exact(&mut frame).await?;

    // Fail before reading the methods if this is not SOCKS5 at all
    if frame[0] != Version::SOCKS5 as u8 {
        return Err(FrameError::VersionMismatch(frame[0]));
    }

    let n_methods = frame[1] as usize;
    frame.resize(2 + n_methods, 0);
    stream.read_exact(&mut frame[2..]).await?;

    Ok(parse_handshake(&frame)?)
}

/// read_request reads one request frame from the stream. An unknown
/// address type stops reading after the header, since the length of the
/// rest of the frame cannot be known
pub async fn read_request<R>(stream: &mut R) -> Result<ProxyRequest, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = vec![0u8; 4];
    stream.read_exact(&mut frame).await?;

    if frame[0] != Version::SOCKS5 as u8 {
        return Err(FrameError::VersionMismatch(frame[0]));
    }

    let remaining = match AddressType::from_byte(frame[3]) {
        Some(AddressType::IPv4) => 4 + 2,
        Some(AddressType::IPv6) => 16 + 2,
        Some(AddressType::DomainName) => {
            let len = stream.read_u8().await?;
            frame.push(len);
            len as usize + 2
        }
        None => 0,
    };

    let start = frame.len();
    frame.resize(start + remaining, 0);
    stream.read_exact(&mut frame[start..]).await?;

    Ok(parse_request(&frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, duplex};

    #[test]
    fn handshake_offering_no_auth() {
        let hello = parse_handshake(&[0x05, 0x01, 0x00]).unwrap();
        assert_eq!(hello.methods, vec![0x00]);
        assert_eq!(encode_handshake_reply(AuthMethod::NoAuth), [0x05, 0x00]);
    }

    #[test]
    fn handshake_method_count_must_match() {
        assert_eq!(
            parse_handshake(&[0x05, 0x02, 0x00]),
            Err(ParseError::Malformed("method count does not match NMETHODS"))
        );
        assert!(matches!(
            parse_handshake(&[0x05, 0x01, 0x00, 0x02]),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn handshake_wrong_version_is_malformed() {
        assert_eq!(
            parse_handshake(&[0x04, 0x01, 0x00]),
            Err(ParseError::Malformed("not SOCKS5"))
        );
        assert!(parse_handshake(&[0x05]).is_err());
    }

    #[test]
    fn request_connect_ipv4() {
        let req = parse_request(&[0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50]).unwrap();
        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.address, Address::IPv4(Ipv4Addr::LOCALHOST));
        assert_eq!(req.port, 80);
    }

    #[test]
    fn request_domain_and_ipv6() {
        let mut bytes = vec![0x05, 0x01, 0x00, 0x03, 11];
        bytes.extend_from_slice(b"example.com");
        bytes.extend_from_slice(&443u16.to_be_bytes());
        let req = parse_request(&bytes).unwrap();
        assert_eq!(req.address, Address::DomainName("example.com".into()));
        assert_eq!(req.port, 443);

        let mut bytes = vec![0x05, 0x01, 0x00, 0x04];
        bytes.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        bytes.extend_from_slice(&[0x1F, 0x90]);
        let req = parse_request(&bytes).unwrap();
        assert_eq!(req.address, Address::IPv6(Ipv6Addr::LOCALHOST));
        assert_eq!(req.port, 8080);
    }

    #[test]
    fn request_length_inconsistent_with_address_type() {
        let cases: &[&[u8]] = &[
            // IPv4 tag with 16 address bytes
            &[5, 1, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 80],
            // IPv4 tag, short by one
            &[5, 1, 0, 1, 127, 0, 0, 1, 0],
            // IPv6 tag with 4 address bytes
            &[5, 1, 0, 4, 127, 0, 0, 1, 0, 80],
            // Domain length says 5, only 3 present
            &[5, 1, 0, 3, 5, b'a', b'b', b'c', 0, 80],
            // Domain length says 1, trailing garbage
            &[5, 1, 0, 3, 1, b'a', 0, 80, 0xFF],
        ];

        for bytes in cases {
            assert!(
                matches!(parse_request(bytes), Err(ParseError::Malformed(_))),
                "expected malformed for {bytes:02x?}"
            );
        }
    }

    #[test]
    fn request_unknown_address_type() {
        let err = parse_request(&[0x05, 0x01, 0x00, 0x02]).unwrap_err();
        assert_eq!(err, ParseError::UnsupportedAddressType(0x02));
        assert_eq!(err.reply_code(), ReplyCode::AddrTypeUnsupported);
    }

    #[test]
    fn request_reserved_must_be_zero() {
        assert!(matches!(
            parse_request(&[0x05, 0x01, 0x01, 0x01, 127, 0, 0, 1, 0, 80]),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn request_unknown_command_still_parses() {
        let req = parse_request(&[0x05, 0x09, 0x00, 0x01, 127, 0, 0, 1, 0, 80]).unwrap();
        assert_eq!(req.command, Command::Unknown(0x09));
    }

    #[test]
    fn failure_reply_is_zeroed() {
        let bytes = encode_reply(&ProxyReply::failure(ReplyCode::AddrTypeUnsupported));
        assert_eq!(bytes, [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn reply_decodes_to_what_was_encoded() {
        let replies = [
            ProxyReply::new(ReplyCode::Succeeded, "192.168.1.20:40123".parse().unwrap()),
            ProxyReply::new(ReplyCode::Succeeded, "[2001:db8::1]:1080".parse().unwrap()),
            ProxyReply {
                status: ReplyCode::HostUnreachable,
                address: Address::DomainName("proxy.local".into()),
                port: 0,
            },
        ];

        for reply in replies {
            assert_eq!(parse_reply(&encode_reply(&reply)), Ok(reply));
        }
    }

    #[tokio::test]
    async fn read_request_consumes_exactly_one_frame() {
        let (mut client, mut server) = duplex(64);
        let mut bytes = vec![0x05, 0x01, 0x00, 0x03, 9];
        bytes.extend_from_slice(b"localhost");
        bytes.extend_from_slice(&[0x00, 0x50]);
        bytes.extend_from_slice(b"payload");
        client.write_all(&bytes).await.unwrap();

        let req = read_request(&mut server).await.unwrap();
        assert_eq!(req.address, Address::DomainName("localhost".into()));

        let mut rest = [0u8; 7];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"payload");
    }

    #[tokio::test]
    async fn read_request_stops_at_unknown_address_type() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x00, 0x02]).await.unwrap();

        let err = read_request(&mut server).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Parse(ParseError::UnsupportedAddressType(0x02))
        ));
    }

    #[tokio::test]
    async fn read_request_with_foreign_version_is_not_answerable() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x04, 0x01, 0x00, 0x01]).await.unwrap();

        let err = read_request(&mut server).await.unwrap_err();
        assert!(matches!(err, FrameError::VersionMismatch(0x04)));
    }

    #[tokio::test]
    async fn read_handshake_rejects_truncated_stream() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x03, 0x00]).await.unwrap();
        drop(client);

        let err = read_handshake(&mut server).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }
}
