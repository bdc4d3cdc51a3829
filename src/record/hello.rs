//! Best-effort inspection of plaintext handshake records.
//!
//! Pulls the server name, offered ALPN protocols and supported versions out
//! of a ClientHello so a server can pick options before the engine sees it.
//! Also parses alert records. Nothing here is fatal: a malformed hello just
//! yields fewer details.

use alloc::string::String;
use alloc::vec::Vec;

use super::alert::Alert;
use super::{try_get_frame_header, ContentType, FrameHeader, Framing, Protocol};
use crate::error::Error;

// Extension type codes
pub const EXT_SERVER_NAME: u16 = 0x0000;
pub const EXT_ALPN: u16 = 0x0010;
pub const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;

/// Handshake header: type (1) + length (3).
pub const HANDSHAKE_HEADER_LEN: usize = 4;

/// TLS handshake message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    HelloRequest = 0,
    ClientHello = 1,
    ServerHello = 2,
    NewSessionTicket = 4,
    Certificate = 11,
    CertificateRequest = 13,
    Finished = 20,
    KeyUpdate = 24,
}

impl HandshakeType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::HelloRequest),
            1 => Some(Self::ClientHello),
            2 => Some(Self::ServerHello),
            4 => Some(Self::NewSessionTicket),
            11 => Some(Self::Certificate),
            13 => Some(Self::CertificateRequest),
            20 => Some(Self::Finished),
            24 => Some(Self::KeyUpdate),
            _ => None,
        }
    }
}

/// Details extracted from one buffered record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub header: FrameHeader,
    pub handshake_type: Option<HandshakeType>,
    pub alert: Option<Alert>,
    /// SNI host name from a ClientHello.
    pub server_name: Option<String>,
    /// ALPN protocols offered in a ClientHello.
    pub application_protocols: Vec<Vec<u8>>,
    /// Versions offered (ClientHello) or selected (ServerHello).
    pub supported_versions: Vec<Protocol>,
}

/// Parsed ClientHello body.
pub struct ClientHello<'a> {
    pub version: u16,
    pub random: &'a [u8; 32],
    pub session_id: &'a [u8],
    pub cipher_suites: &'a [u8],
    pub extensions: &'a [u8],
}

/// Parsed ServerHello body.
pub struct ServerHello<'a> {
    pub version: u16,
    pub random: &'a [u8; 32],
    pub session_id: &'a [u8],
    pub cipher_suite: u16,
    pub extensions: &'a [u8],
}

/// Extensions relevant to option selection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HelloExtensions {
    pub server_name: Option<String>,
    pub application_protocols: Vec<Vec<u8>>,
    pub supported_versions: Vec<u16>,
}

// ---------------------------------------------------------------------------
// Primitive readers
// ---------------------------------------------------------------------------

fn get_u8(data: &[u8], off: &mut usize) -> Option<u8> {
    let v = *data.get(*off)?;
    *off += 1;
    Some(v)
}

fn get_u16(data: &[u8], off: &mut usize) -> Option<u16> {
    let bytes = data.get(*off..*off + 2)?;
    *off += 2;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn get_slice<'a>(data: &'a [u8], off: &mut usize, len: usize) -> Option<&'a [u8]> {
    let s = data.get(*off..off.checked_add(len)?)?;
    *off += len;
    Some(s)
}

fn put_u16(out: &mut Vec<u8>, val: u16) {
    out.extend_from_slice(&val.to_be_bytes());
}

// ---------------------------------------------------------------------------
// Handshake messages
// ---------------------------------------------------------------------------

/// Append a handshake header followed by `body`.
pub fn write_handshake_message(msg_type: HandshakeType, body: &[u8], out: &mut Vec<u8>) {
    let len = body.len() as u32;
    out.push(msg_type as u8);
    out.extend_from_slice(&len.to_be_bytes()[1..]);
    out.extend_from_slice(body);
}

/// Read a handshake header: returns (type_byte, body_length).
pub fn read_handshake_header(data: &[u8]) -> Option<(u8, usize)> {
    if data.len() < HANDSHAKE_HEADER_LEN {
        return None;
    }
    let length = ((data[1] as usize) << 16) | ((data[2] as usize) << 8) | (data[3] as usize);
    Some((data[0], length))
}

/// Split concatenated handshake messages into (type, body) pairs.
pub fn iter_handshake_messages(data: &[u8]) -> impl Iterator<Item = Option<(u8, &[u8])>> + '_ {
    let mut off = 0;
    core::iter::from_fn(move || {
        if off >= data.len() {
            return None;
        }
        let item = read_handshake_header(&data[off..]).and_then(|(ty, len)| {
            let start = off + HANDSHAKE_HEADER_LEN;
            let body = data.get(start..start.checked_add(len)?)?;
            off = start + len;
            Some((ty, body))
        });
        if item.is_none() {
            off = data.len();
        }
        Some(item)
    })
}

/// Encode a ClientHello body (without the handshake header).
///
/// Layout: legacy version 0x0303, random, empty session id, cipher suites,
/// null compression, then server_name, supported_versions and ALPN extensions.
pub fn encode_client_hello(
    random: &[u8; 32],
    cipher_suites: &[u16],
    server_name: Option<&str>,
    versions: &[u16],
    alpn: &[Vec<u8>],
    out: &mut Vec<u8>,
) {
    put_u16(out, 0x0303);
    out.extend_from_slice(random);
    out.push(0);
    put_u16(out, (cipher_suites.len() * 2) as u16);
    for &suite in cipher_suites {
        put_u16(out, suite);
    }
    out.push(1);
    out.push(0);

    let mut ext = Vec::new();
    if let Some(name) = server_name.filter(|n| !n.is_empty()) {
        let name = name.as_bytes();
        // ServerNameList: list_length(2) + type(1) + name_length(2) + name
        put_u16(&mut ext, EXT_SERVER_NAME);
        put_u16(&mut ext, (2 + 1 + 2 + name.len()) as u16);
        put_u16(&mut ext, (1 + 2 + name.len()) as u16);
        ext.push(0);
        put_u16(&mut ext, name.len() as u16);
        ext.extend_from_slice(name);
    }
    if !versions.is_empty() {
        put_u16(&mut ext, EXT_SUPPORTED_VERSIONS);
        put_u16(&mut ext, (1 + versions.len() * 2) as u16);
        ext.push((versions.len() * 2) as u8);
        for &v in versions {
            put_u16(&mut ext, v);
        }
    }
    if !alpn.is_empty() {
        let start = ext.len();
        put_u16(&mut ext, EXT_ALPN);
        put_u16(&mut ext, 0);
        encode_alpn_list(alpn, &mut ext);
        let body_len = (ext.len() - start - 4) as u16;
        ext[start + 2..start + 4].copy_from_slice(&body_len.to_be_bytes());
    }
    put_u16(out, ext.len() as u16);
    out.extend_from_slice(&ext);
}

/// Parse a ClientHello body (after the 4-byte handshake header).
pub fn parse_client_hello(data: &[u8]) -> Option<ClientHello<'_>> {
    let mut off = 0;
    let version = get_u16(data, &mut off)?;
    let random: &[u8; 32] = get_slice(data, &mut off, 32)?.try_into().ok()?;
    let sid_len = get_u8(data, &mut off)? as usize;
    let session_id = get_slice(data, &mut off, sid_len)?;
    let cs_len = get_u16(data, &mut off)? as usize;
    let cipher_suites = get_slice(data, &mut off, cs_len)?;
    let comp_len = get_u8(data, &mut off)? as usize;
    get_slice(data, &mut off, comp_len)?;
    let extensions = if off + 2 <= data.len() {
        let ext_len = get_u16(data, &mut off)? as usize;
        get_slice(data, &mut off, ext_len)?
    } else {
        &[]
    };
    Some(ClientHello {
        version,
        random,
        session_id,
        cipher_suites,
        extensions,
    })
}

/// Encode a ServerHello body with the selected version and optional ALPN.
pub fn encode_server_hello(
    random: &[u8; 32],
    cipher_suite: u16,
    selected_version: u16,
    alpn: Option<&[u8]>,
    out: &mut Vec<u8>,
) {
    put_u16(out, 0x0303);
    out.extend_from_slice(random);
    out.push(0);
    put_u16(out, cipher_suite);
    out.push(0);

    let mut ext = Vec::new();
    put_u16(&mut ext, EXT_SUPPORTED_VERSIONS);
    put_u16(&mut ext, 2);
    put_u16(&mut ext, selected_version);
    if let Some(proto) = alpn {
        put_u16(&mut ext, EXT_ALPN);
        put_u16(&mut ext, (2 + 1 + proto.len()) as u16);
        encode_alpn_list(core::slice::from_ref(&proto.to_vec()), &mut ext);
    }
    put_u16(out, ext.len() as u16);
    out.extend_from_slice(&ext);
}

/// Parse a ServerHello body (after the 4-byte handshake header).
pub fn parse_server_hello(data: &[u8]) -> Option<ServerHello<'_>> {
    let mut off = 0;
    let version = get_u16(data, &mut off)?;
    let random: &[u8; 32] = get_slice(data, &mut off, 32)?.try_into().ok()?;
    let sid_len = get_u8(data, &mut off)? as usize;
    let session_id = get_slice(data, &mut off, sid_len)?;
    let cipher_suite = get_u16(data, &mut off)?;
    get_u8(data, &mut off)?;
    let extensions = if off + 2 <= data.len() {
        let ext_len = get_u16(data, &mut off)? as usize;
        get_slice(data, &mut off, ext_len)?
    } else {
        &[]
    };
    Some(ServerHello {
        version,
        random,
        session_id,
        cipher_suite,
        extensions,
    })
}

/// Parse the extensions we care about.
///
/// `client` selects the ClientHello form of supported_versions (a list) over
/// the ServerHello form (a single version).
pub fn parse_hello_extensions(data: &[u8], client: bool) -> Option<HelloExtensions> {
    let mut result = HelloExtensions::default();
    let mut off = 0;
    while off + 4 <= data.len() {
        let ext_type = get_u16(data, &mut off)?;
        let ext_len = get_u16(data, &mut off)? as usize;
        let ext = get_slice(data, &mut off, ext_len)?;
        match ext_type {
            EXT_SERVER_NAME => result.server_name = parse_server_name(ext),
            EXT_ALPN => result.application_protocols = parse_alpn_list(ext)?,
            EXT_SUPPORTED_VERSIONS if client => {
                let mut p = 0;
                let list_len = get_u8(ext, &mut p)? as usize;
                let list = get_slice(ext, &mut p, list_len)?;
                result.supported_versions = list
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
            }
            EXT_SUPPORTED_VERSIONS => {
                let mut p = 0;
                result.supported_versions = alloc::vec![get_u16(ext, &mut p)?];
            }
            _ => {}
        }
    }
    Some(result)
}

fn parse_server_name(ext: &[u8]) -> Option<String> {
    let mut off = 0;
    let list_len = get_u16(ext, &mut off)? as usize;
    let list = get_slice(ext, &mut off, list_len)?;
    let mut p = 0;
    while p < list.len() {
        let name_type = get_u8(list, &mut p)?;
        let len = get_u16(list, &mut p)? as usize;
        let name = get_slice(list, &mut p, len)?;
        // host_name(0)
        if name_type == 0 {
            return core::str::from_utf8(name).ok().map(String::from);
        }
    }
    None
}

/// Append an ALPN `ProtocolNameList`: u16 length then u8-prefixed names.
pub fn encode_alpn_list(protocols: &[Vec<u8>], out: &mut Vec<u8>) {
    let list_len: usize = protocols.iter().map(|p| 1 + p.len()).sum();
    put_u16(out, list_len as u16);
    for proto in protocols {
        out.push(proto.len() as u8);
        out.extend_from_slice(proto);
    }
}

/// Parse an ALPN `ProtocolNameList`.
pub fn parse_alpn_list(data: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut off = 0;
    let list_len = get_u16(data, &mut off)? as usize;
    let list = get_slice(data, &mut off, list_len)?;
    let mut protocols = Vec::new();
    let mut p = 0;
    while p < list.len() {
        let len = get_u8(list, &mut p)? as usize;
        protocols.push(get_slice(list, &mut p, len)?.to_vec());
    }
    Some(protocols)
}

// ---------------------------------------------------------------------------
// Frame inspection
// ---------------------------------------------------------------------------

/// Inspect the record at the start of `bytes`.
///
/// Returns `Ok(None)` if the header is incomplete. Header errors propagate;
/// body parse failures just leave fields empty.
pub fn try_get_frame_info(bytes: &[u8], framing: Framing) -> Result<Option<FrameInfo>, Error> {
    let header = match try_get_frame_header(bytes, framing)? {
        Some(h) => h,
        None => return Ok(None),
    };
    let end = header.frame_size().min(bytes.len());
    let body = &bytes[header.header_size..end];

    let mut info = FrameInfo {
        header,
        handshake_type: None,
        alert: None,
        server_name: None,
        application_protocols: Vec::new(),
        supported_versions: Vec::new(),
    };

    match header.content_type {
        ContentType::Alert => info.alert = Alert::parse(body),
        ContentType::Handshake if header.protocol() == Some(Protocol::Ssl2) => {
            // v2 hello: msg_type(1) + version(2) + ...
            if body.len() >= 3 && body[0] == HandshakeType::ClientHello as u8 {
                info.handshake_type = Some(HandshakeType::ClientHello);
                info.supported_versions
                    .extend(Protocol::from_wire(u16::from_be_bytes([body[1], body[2]])));
            }
        }
        ContentType::Handshake => {
            info.handshake_type = body.first().and_then(|&b| HandshakeType::from_u8(b));
            if let Some((ty, len)) = read_handshake_header(body) {
                let msg = body.get(HANDSHAKE_HEADER_LEN..HANDSHAKE_HEADER_LEN + len);
                match (HandshakeType::from_u8(ty), msg) {
                    (Some(HandshakeType::ClientHello), Some(msg)) => {
                        fill_from_client_hello(&mut info, msg)
                    }
                    (Some(HandshakeType::ServerHello), Some(msg)) => {
                        fill_from_server_hello(&mut info, msg)
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    Ok(Some(info))
}

fn fill_from_client_hello(info: &mut FrameInfo, msg: &[u8]) {
    let Some(hello) = parse_client_hello(msg) else {
        return;
    };
    let ext = parse_hello_extensions(hello.extensions, true).unwrap_or_default();
    info.server_name = ext.server_name;
    info.application_protocols = ext.application_protocols;
    if ext.supported_versions.is_empty() {
        info.supported_versions.extend(Protocol::from_wire(hello.version));
    } else {
        info.supported_versions = ext
            .supported_versions
            .iter()
            .filter_map(|&v| Protocol::from_wire(v))
            .collect();
    }
}

fn fill_from_server_hello(info: &mut FrameInfo, msg: &[u8]) {
    let Some(hello) = parse_server_hello(msg) else {
        return;
    };
    let ext = parse_hello_extensions(hello.extensions, false).unwrap_or_default();
    let selected = ext.supported_versions.first().copied().unwrap_or(hello.version);
    info.supported_versions.extend(Protocol::from_wire(selected));
    info.application_protocols = ext.application_protocols;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::alert::{AlertDescription, AlertLevel};
    use alloc::vec;

    fn client_hello_record(sni: Option<&str>, alpn: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        encode_client_hello(&[7u8; 32], &[0x1301], sni, &[0x0304, 0x0303], alpn, &mut body);
        let mut msg = Vec::new();
        write_handshake_message(HandshakeType::ClientHello, &body, &mut msg);
        let mut record = vec![22, 3, 1];
        record.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        record.extend_from_slice(&msg);
        record
    }

    #[test]
    fn client_hello_details() {
        let alpn = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let record = client_hello_record(Some("example.com"), &alpn);
        let info = try_get_frame_info(&record, Framing::Unknown).unwrap().unwrap();
        assert_eq!(info.handshake_type, Some(HandshakeType::ClientHello));
        assert_eq!(info.server_name.as_deref(), Some("example.com"));
        assert_eq!(info.application_protocols, alpn);
        assert_eq!(info.supported_versions, vec![Protocol::Tls13, Protocol::Tls12]);
    }

    #[test]
    fn client_hello_without_sni() {
        let record = client_hello_record(None, &[]);
        let info = try_get_frame_info(&record, Framing::Ssl3Plus).unwrap().unwrap();
        assert_eq!(info.server_name, None);
        assert!(info.application_protocols.is_empty());
    }

    #[test]
    fn truncated_hello_is_not_fatal() {
        let record = client_hello_record(Some("example.com"), &[]);
        let cut = &record[..record.len() - 10];
        let info = try_get_frame_info(cut, Framing::Ssl3Plus).unwrap().unwrap();
        assert_eq!(info.handshake_type, Some(HandshakeType::ClientHello));
        assert_eq!(info.server_name, None);
    }

    #[test]
    fn alert_record_details() {
        let record = [21, 3, 3, 0, 2, 2, 40];
        let info = try_get_frame_info(&record, Framing::Ssl3Plus).unwrap().unwrap();
        let alert = info.alert.unwrap();
        assert_eq!(alert.level, AlertLevel::Fatal);
        assert_eq!(alert.description, AlertDescription::HandshakeFailure);
    }

    #[test]
    fn server_hello_selected_version() {
        let mut body = Vec::new();
        encode_server_hello(&[9u8; 32], 0x1301, 0x0304, Some(b"h2"), &mut body);
        let hello = parse_server_hello(&body).unwrap();
        assert_eq!(hello.cipher_suite, 0x1301);
        assert_eq!(hello.random, &[9u8; 32]);
        let ext = parse_hello_extensions(hello.extensions, false).unwrap();
        assert_eq!(ext.supported_versions, vec![0x0304]);
        assert_eq!(ext.application_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn ssl2_hello_version() {
        let record = [0x80, 0x09, 0x01, 0x03, 0x01, 0, 0, 0, 0, 0, 0];
        let info = try_get_frame_info(&record, Framing::Unknown).unwrap().unwrap();
        assert_eq!(info.handshake_type, Some(HandshakeType::ClientHello));
        assert_eq!(info.supported_versions, vec![Protocol::Tls10]);
    }

    #[test]
    fn handshake_message_iteration() {
        let mut data = Vec::new();
        write_handshake_message(HandshakeType::Finished, &[1, 2, 3], &mut data);
        write_handshake_message(HandshakeType::CertificateRequest, &[], &mut data);
        let msgs: Vec<_> = iter_handshake_messages(&data).collect();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0], Some((20, &[1u8, 2, 3][..])));
        assert_eq!(msgs[1], Some((13, &[][..])));

        // truncated message yields a single None and stops
        let msgs: Vec<_> = iter_handshake_messages(&data[..5]).collect();
        assert_eq!(msgs, vec![None]);
    }

    #[test]
    fn alpn_list_roundtrip() {
        let protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let mut wire = Vec::new();
        encode_alpn_list(&protocols, &mut wire);
        assert_eq!(&wire[..2], &[0, 12]);
        assert_eq!(parse_alpn_list(&wire).unwrap(), protocols);
        assert_eq!(parse_alpn_list(&wire[..5]), None);
    }
}
