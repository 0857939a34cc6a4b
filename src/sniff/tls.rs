use super::{FilterStep, SniffError};

const RECORD_HEADER_LEN: usize = 5;
const RECORD_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const EXTENSION_SERVER_NAME: u16 = 0;

/// Inspects buffered bytes for a TLS ClientHello and extracts the SNI
/// host name. Nothing is ever consumed: the record stays buffered and
/// is forwarded verbatim.
pub fn inspect(buf: &[u8]) -> FilterStep {
    if buf.len() < RECORD_HEADER_LEN {
        return FilterStep::Again(RECORD_HEADER_LEN);
    }

    if buf[0] != RECORD_TYPE_HANDSHAKE {
        return FilterStep::Continue;
    }

    let major = buf[1];
    let minor = buf[2];
    if major != 3 || minor > 3 {
        return FilterStep::Continue;
    }

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if record_len < 4 {
        return FilterStep::Continue;
    }

    if buf.len() < RECORD_HEADER_LEN + record_len {
        return FilterStep::Again(RECORD_HEADER_LEN + record_len);
    }

    let data = &buf[RECORD_HEADER_LEN..RECORD_HEADER_LEN + record_len];
    let handshake_len = (data[1] as usize) << 16 | (data[2] as usize) << 8 | data[3] as usize;
    if data.len() < handshake_len + 4 {
        return FilterStep::Fail(SniffError::MalformedClientHello("handshake length"));
    }

    if data[0] != HANDSHAKE_CLIENT_HELLO {
        return FilterStep::Fail(SniffError::SniNotFound);
    }

    match server_name(data) {
        Some(host) => FilterStep::Stop { host, consumed: 0 },
        None => FilterStep::Fail(SniffError::SniNotFound),
    }
}

/// Walks a ClientHello body (handshake header included) field by field,
/// skipping length-prefixed sections until the server_name extension.
/// Every slice access is bounds-checked; a length field that does not
/// fit in the remaining buffer aborts the walk.
fn server_name(data: &[u8]) -> Option<String> {
    // 4 handshake header + 2 version + 32 random + 1 session-id length.
    if data.len() < 42 {
        return None;
    }
    let session_id_len = data[38] as usize;
    if session_id_len > 32 || data.len() < 39 + session_id_len {
        return None;
    }
    let mut rest = &data[39 + session_id_len..];

    if rest.len() < 2 {
        return None;
    }
    let cipher_suite_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    // Cipher suites are u16s, so the byte count must be even.
    if cipher_suite_len % 2 == 1 || rest.len() < 2 + cipher_suite_len {
        return None;
    }
    rest = &rest[2 + cipher_suite_len..];

    let compression_len = *rest.first()? as usize;
    if rest.len() < 1 + compression_len {
        return None;
    }
    rest = &rest[1 + compression_len..];

    if rest.len() < 2 {
        return None;
    }
    let extensions_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    rest = &rest[2..];
    if extensions_len != rest.len() {
        return None;
    }

    while !rest.is_empty() {
        if rest.len() < 4 {
            return None;
        }
        let extension = u16::from_be_bytes([rest[0], rest[1]]);
        let length = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if rest.len() < length {
            return None;
        }

        if extension == EXTENSION_SERVER_NAME {
            let mut names = &rest[..length];
            if names.len() < 2 {
                return None;
            }
            let names_len = u16::from_be_bytes([names[0], names[1]]) as usize;
            names = &names[2..];
            if names.len() != names_len {
                return None;
            }
            while !names.is_empty() {
                if names.len() < 3 {
                    return None;
                }
                let name_type = names[0];
                let name_len = u16::from_be_bytes([names[1], names[2]]) as usize;
                names = &names[3..];
                if names.len() < name_len {
                    return None;
                }
                // Type 0 is host_name.
                if name_type == 0 {
                    return String::from_utf8(names[..name_len].to_vec()).ok();
                }
                names = &names[name_len..];
            }
            return None;
        }
        rest = &rest[length..];
    }

    None
}

#[cfg(test)]
pub(crate) fn client_hello_with_sni(host: &str) -> Vec<u8> {
    // ClientHello body, built inside-out.
    let mut sni_entry = vec![0u8]; // name_type host_name
    sni_entry.extend_from_slice(&(host.len() as u16).to_be_bytes());
    sni_entry.extend_from_slice(host.as_bytes());

    let mut sni_ext = Vec::new();
    sni_ext.extend_from_slice(&(sni_entry.len() as u16).to_be_bytes());
    sni_ext.extend_from_slice(&sni_entry);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
    extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni_ext);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // client_version
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0); // session_id length
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
    body.extend_from_slice(&[0x01, 0x00]); // null compression
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
    handshake.push((body.len() >> 16) as u8);
    handshake.push((body.len() >> 8) as u8);
    handshake.push(body.len() as u8);
    handshake.extend_from_slice(&body);

    let mut record = vec![RECORD_TYPE_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
