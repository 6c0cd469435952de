//! TLS ClientHello inspection.
//!
//! The TCP entry points peek at the first bytes of every accepted
//! connection (MSG_PEEK, nothing is consumed) to decide plaintext versus
//! TLS and to extract SNI and ALPN for rule evaluation. Passthrough
//! routers then splice the untouched byte stream; terminating routers
//! hand the same socket to the TLS acceptor, which re-reads the hello.

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// TLS handshake record type; the single-byte plaintext/TLS hint.
pub const TLS_HANDSHAKE_BYTE: u8 = 0x16;

/// Upper bound on the bytes peeked while waiting for a full ClientHello.
const MAX_PEEK_BYTES: usize = 16 * 1024;

/// How long to wait for the client to send its hello.
const PEEK_TIMEOUT: Duration = Duration::from_millis(500);

/// Result of inspecting the first bytes of a connection.
#[derive(Debug, Clone)]
pub enum HelloInspection {
    /// Not a TLS handshake; treat as plaintext.
    Plaintext,
    /// TLS ClientHello parsed.
    Tls(ClientHelloInfo),
    /// Looked like TLS but the hello never completed or was malformed.
    Undecided,
}

#[derive(Debug, Clone, Default)]
pub struct ClientHelloInfo {
    /// SNI hostname, lowercased, trailing dot trimmed
    pub sni: Option<String>,
    /// ALPN protocols offered by the client
    pub alpn: Vec<String>,
}

/// Peek at a connection until the ClientHello is complete (or it is
/// clearly not TLS). Returns the peeked bytes alongside the verdict;
/// nothing is consumed from the socket.
pub async fn inspect(stream: &TcpStream) -> (Vec<u8>, HelloInspection) {
    let mut buf = vec![0u8; MAX_PEEK_BYTES];
    let deadline = tokio::time::Instant::now() + PEEK_TIMEOUT;
    let mut seen = 0usize;

    loop {
        let peeked = match tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!(error = %e, "Peek failed");
                return (Vec::new(), HelloInspection::Undecided);
            }
            Err(_) => {
                debug!("Timed out waiting for client hello");
                return (buf[..seen].to_vec(), HelloInspection::Undecided);
            }
        };

        if peeked == 0 {
            return (Vec::new(), HelloInspection::Undecided);
        }
        seen = peeked;

        if buf[0] != TLS_HANDSHAKE_BYTE {
            return (buf[..peeked].to_vec(), HelloInspection::Plaintext);
        }

        if peeked >= 5 {
            let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
            let want = (5 + record_len).min(MAX_PEEK_BYTES);
            if peeked >= want {
                let data = buf[..peeked].to_vec();
                return match parse_client_hello(&data) {
                    Some(info) => (data, HelloInspection::Tls(info)),
                    None => (data, HelloInspection::Undecided),
                };
            }
        }

        // Hello incomplete: yield briefly and peek again.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Parse SNI and ALPN out of a complete TLS ClientHello record.
///
/// TLS record: type(1) version(2) length(2), then the handshake message:
/// type(1) length(3) version(2) random(32) session_id cipher_suites
/// compression_methods extensions.
pub fn parse_client_hello(data: &[u8]) -> Option<ClientHelloInfo> {
    if data.len() < 9 || data[0] != TLS_HANDSHAKE_BYTE {
        return None;
    }

    let handshake = &data[5..];
    // 0x01 = ClientHello
    if handshake.first() != Some(&0x01) {
        return None;
    }

    let client_hello = handshake.get(4..)?;
    // version(2) + random(32)
    let mut pos = 34usize;

    let session_id_len = *client_hello.get(pos)? as usize;
    pos += 1 + session_id_len;

    let cipher_suites_len =
        u16::from_be_bytes([*client_hello.get(pos)?, *client_hello.get(pos + 1)?]) as usize;
    pos += 2 + cipher_suites_len;

    let compression_len = *client_hello.get(pos)? as usize;
    pos += 1 + compression_len;

    let mut info = ClientHelloInfo::default();

    let Some(&ext_hi) = client_hello.get(pos) else {
        // No extensions block at all is still a valid hello.
        return Some(info);
    };
    let ext_lo = *client_hello.get(pos + 1)?;
    let extensions_len = u16::from_be_bytes([ext_hi, ext_lo]) as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(client_hello.len());

    while pos + 4 <= extensions_end {
        let ext_type =
            u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]);
        let ext_len =
            u16::from_be_bytes([client_hello[pos + 2], client_hello[pos + 3]]) as usize;
        pos += 4;
        let ext_data = client_hello.get(pos..pos + ext_len.min(client_hello.len() - pos))?;

        match ext_type {
            // server_name
            0x0000 => info.sni = parse_sni_extension(ext_data),
            // application_layer_protocol_negotiation
            0x0010 => info.alpn = parse_alpn_extension(ext_data),
            _ => {}
        }

        pos += ext_len;
    }

    Some(info)
}

/// SNI extension: list length(2), then entries of
/// type(1) name length(2) name.
fn parse_sni_extension(data: &[u8]) -> Option<String> {
    let list_len = u16::from_be_bytes([*data.first()?, *data.get(1)?]) as usize;
    let mut pos = 2;

    while pos + 3 <= 2 + list_len && pos + 3 <= data.len() {
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;

        if name_type == 0 {
            let name = data.get(pos..pos + name_len)?;
            let hostname = std::str::from_utf8(name).ok()?;
            return Some(hostname.to_lowercase().trim_end_matches('.').to_string());
        }
        pos += name_len;
    }

    None
}

/// ALPN extension: list length(2), then length-prefixed protocol names.
fn parse_alpn_extension(data: &[u8]) -> Vec<String> {
    let mut protocols = Vec::new();
    let Some(&hi) = data.first() else {
        return protocols;
    };
    let Some(&lo) = data.get(1) else {
        return protocols;
    };
    let list_len = u16::from_be_bytes([hi, lo]) as usize;
    let mut pos = 2;

    while pos < 2 + list_len && pos < data.len() {
        let proto_len = data[pos] as usize;
        pos += 1;
        if let Some(proto) = data.get(pos..pos + proto_len) {
            if let Ok(proto) = std::str::from_utf8(proto) {
                protocols.push(proto.to_string());
            }
        }
        pos += proto_len;
    }

    protocols
}
