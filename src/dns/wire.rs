//! DNS wire-format handling: enough of RFC 1035 to classify queries,
//! harvest A/CNAME answers, and synthesize replies. Everything else is
//! relayed as opaque bytes.

use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("DNS packet too short: {0} bytes")]
    TooShort(usize),
    #[error("invalid DNS label length: {0}")]
    InvalidLabel(u8),
    #[error("DNS name too long")]
    NameTooLong,
    #[error("invalid compression pointer")]
    InvalidCompression,
    #[error("no questions in DNS packet")]
    NoQuestions,
}

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;

/// Maximum length of a domain name.
const MAX_DOMAIN_LEN: usize = 253;

/// Maximum compression pointer jumps to prevent loops.
const MAX_COMPRESSION_JUMPS: usize = 10;

/// The first question of a DNS message.
#[derive(Debug, Clone)]
pub struct Question {
    pub txid: u16,
    pub name: String,
    pub qtype: u16,
    /// Byte offset just past the question section, used when
    /// synthesizing a reply from the query bytes.
    pub question_end: usize,
}

/// An answer-section record we care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    A {
        name: String,
        addr: Ipv4Addr,
        ttl: u32,
    },
    Cname {
        name: String,
        target: String,
        ttl: u32,
    },
}

pub fn extract_txid(packet: &[u8]) -> Option<u16> {
    if packet.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([packet[0], packet[1]]))
}

pub fn rewrite_txid(packet: &mut [u8], txid: u16) {
    if packet.len() < 2 {
        return;
    }
    packet[..2].copy_from_slice(&txid.to_be_bytes());
}

/// Parses a DNS name starting at `offset`, following compression
/// pointers (RFC 1035 §4.1.4). Returns the name and the offset just
/// past it in the uncompressed stream.
pub fn parse_name(packet: &[u8], mut offset: usize) -> Result<(String, usize), DnsError> {
    let mut name = String::with_capacity(64);
    let mut jumps = 0;
    let mut final_offset = None;

    loop {
        if offset >= packet.len() {
            return Err(DnsError::TooShort(packet.len()));
        }

        let len = packet[offset];

        // Compression pointer: top two bits set.
        if len & 0xC0 == 0xC0 {
            if offset + 1 >= packet.len() {
                return Err(DnsError::TooShort(packet.len()));
            }
            if final_offset.is_none() {
                final_offset = Some(offset + 2);
            }
            let ptr = (((len & 0x3F) as usize) << 8) | (packet[offset + 1] as usize);
            if ptr >= offset {
                return Err(DnsError::InvalidCompression);
            }
            offset = ptr;
            jumps += 1;
            if jumps > MAX_COMPRESSION_JUMPS {
                return Err(DnsError::InvalidCompression);
            }
            continue;
        }

        if len == 0 {
            let end = final_offset.unwrap_or(offset + 1);
            return Ok((name, end));
        }

        let label_len = len as usize;
        if label_len > 63 {
            return Err(DnsError::InvalidLabel(len));
        }
        let label_end = offset + 1 + label_len;
        if label_end > packet.len() {
            return Err(DnsError::TooShort(packet.len()));
        }
        if !name.is_empty() {
            name.push('.');
        }
        if name.len() + label_len > MAX_DOMAIN_LEN {
            return Err(DnsError::NameTooLong);
        }
        for &b in &packet[offset + 1..label_end] {
            name.push(b.to_ascii_lowercase() as char);
        }
        offset = label_end;
    }
}

/// Parses the first question of a message.
pub fn parse_question(packet: &[u8]) -> Result<Question, DnsError> {
    if packet.len() < 12 {
        return Err(DnsError::TooShort(packet.len()));
    }
    let txid = u16::from_be_bytes([packet[0], packet[1]]);
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount == 0 {
        return Err(DnsError::NoQuestions);
    }

    let (name, end) = parse_name(packet, 12)?;
    if end + 4 > packet.len() {
        return Err(DnsError::TooShort(packet.len()));
    }
    let qtype = u16::from_be_bytes([packet[end], packet[end + 1]]);

    Ok(Question {
        txid,
        name,
        qtype,
        question_end: end + 4,
    })
}

/// Harvests A and CNAME records from the answer section of a response.
/// Other record types are skipped; a malformed trailing record ends the
/// harvest without failing what was already collected.
pub fn parse_answers(packet: &[u8]) -> Result<Vec<Record>, DnsError> {
    if packet.len() < 12 {
        return Err(DnsError::TooShort(packet.len()));
    }

    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    if flags & 0x8000 == 0 {
        // Not a response.
        return Ok(Vec::new());
    }

    let qdcount = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    let ancount = u16::from_be_bytes([packet[6], packet[7]]) as usize;

    let mut offset = 12;
    for _ in 0..qdcount {
        let (_, end) = parse_name(packet, offset)?;
        offset = end + 4;
    }

    let mut records = Vec::new();
    for _ in 0..ancount {
        if offset >= packet.len() {
            break;
        }
        let Ok((name, end)) = parse_name(packet, offset) else {
            break;
        };
        offset = end;
        if offset + 10 > packet.len() {
            break;
        }

        let rtype = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
        let ttl = u32::from_be_bytes([
            packet[offset + 4],
            packet[offset + 5],
            packet[offset + 6],
            packet[offset + 7],
        ]);
        let rdlength = u16::from_be_bytes([packet[offset + 8], packet[offset + 9]]) as usize;
        offset += 10;
        if offset + rdlength > packet.len() {
            break;
        }

        match rtype {
            TYPE_A if rdlength == 4 => {
                records.push(Record::A {
                    name,
                    addr: Ipv4Addr::new(
                        packet[offset],
                        packet[offset + 1],
                        packet[offset + 2],
                        packet[offset + 3],
                    ),
                    ttl,
                });
            }
            TYPE_CNAME => {
                if let Ok((target, _)) = parse_name(packet, offset) {
                    records.push(Record::Cname { name, target, ttl });
                }
            }
            _ => {}
        }

        offset += rdlength;
    }

    Ok(records)
}

/// Synthesizes an authoritative A-record reply to `query`, answering
/// with the given addresses. The question section is copied verbatim
/// and each answer points back at it with a compression pointer.
pub fn build_answer(query: &[u8], question: &Question, ips: &[Ipv4Addr], ttl: u32) -> Vec<u8> {
    let mut response = query[..question.question_end].to_vec();

    let flags = u16::from_be_bytes([query[2], query[3]]);
    // Keep OPCODE and RD; set QR, AA and RA.
    let new_flags = (flags & 0x7900) | 0x8000 | 0x0400 | 0x0080;
    response[2..4].copy_from_slice(&new_flags.to_be_bytes());
    response[4..6].copy_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    response[6..8].copy_from_slice(&(ips.len() as u16).to_be_bytes()); // ANCOUNT
    response[8..12].fill(0); // NSCOUNT, ARCOUNT

    for ip in ips {
        response.extend_from_slice(&[0xC0, 0x0C]); // pointer to the question name
        response.extend_from_slice(&TYPE_A.to_be_bytes());
        response.extend_from_slice(&1u16.to_be_bytes()); // IN
        response.extend_from_slice(&ttl.to_be_bytes());
        response.extend_from_slice(&4u16.to_be_bytes());
        response.extend_from_slice(&ip.octets());
    }

    response
}

#[cfg(test)]
pub(crate) fn build_query(txid: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&txid.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]); // standard query, RD
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in name.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Question parsing: txid, lowercased name, qtype, and the offset
    /// past the question section.
    #[test]
    fn parse_simple_question() {
        let packet = build_query(0x1234, "Example.COM", TYPE_A);
        let q = parse_question(&packet).unwrap();
        assert_eq!(q.txid, 0x1234);
        assert_eq!(q.name, "example.com");
        assert_eq!(q.qtype, TYPE_A);
        assert_eq!(q.question_end, packet.len());
    }

    /// Zero questions is an error, not a panic.
    #[test]
    fn reject_empty_question() {
        let packet = [0x12, 0x34, 0x01, 0x00, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            parse_question(&packet),
            Err(DnsError::NoQuestions)
        ));
    }

    /// Answer harvesting handles compression pointers and both A and
    /// CNAME records.
    #[test]
    fn harvest_a_and_cname() {
        let mut packet = build_query(0x0001, "www.example.com", TYPE_A);
        // Flip to a response with two answers.
        packet[2] = 0x81;
        packet[3] = 0x80;
        packet[7] = 2;

        // CNAME www.example.com -> cdn.example.net
        packet.extend_from_slice(&[0xC0, 0x0C]);
        packet.extend_from_slice(&TYPE_CNAME.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&300u32.to_be_bytes());
        let cname_rdata: &[u8] = &[
            3, b'c', b'd', b'n', 7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'n', b'e', b't',
            0,
        ];
        packet.extend_from_slice(&(cname_rdata.len() as u16).to_be_bytes());
        let cname_offset = packet.len();
        packet.extend_from_slice(cname_rdata);

        // A cdn.example.net -> 192.0.2.7 (name by pointer into the CNAME rdata)
        packet.extend_from_slice(&[0xC0, cname_offset as u8]);
        packet.extend_from_slice(&TYPE_A.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&120u32.to_be_bytes());
        packet.extend_from_slice(&4u16.to_be_bytes());
        packet.extend_from_slice(&[192, 0, 2, 7]);

        let records = parse_answers(&packet).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            Record::Cname {
                name: "www.example.com".into(),
                target: "cdn.example.net".into(),
                ttl: 300,
            }
        );
        assert_eq!(
            records[1],
            Record::A {
                name: "cdn.example.net".into(),
                addr: Ipv4Addr::new(192, 0, 2, 7),
                ttl: 120,
            }
        );
    }

    /// A synthesized reply parses back to the answered addresses and
    /// keeps the original transaction ID.
    #[test]
    fn build_answer_round_trip() {
        let query = build_query(0xBEEF, "cached.example", TYPE_A);
        let question = parse_question(&query).unwrap();
        let ips = [Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)];

        let reply = build_answer(&query, &question, &ips, 60);
        assert_eq!(extract_txid(&reply), Some(0xBEEF));
        // QR bit set.
        assert_ne!(reply[2] & 0x80, 0);

        let records = parse_answers(&reply).unwrap();
        let addrs: Vec<_> = records
            .iter()
            .map(|r| match r {
                Record::A { addr, ttl, name } => {
                    assert_eq!(*ttl, 60);
                    assert_eq!(name, "cached.example");
                    *addr
                }
                other => panic!("unexpected record {:?}", other),
            })
            .collect();
        assert_eq!(addrs, ips);
    }

    /// Pointer loops are rejected.
    #[test]
    fn reject_pointer_loop() {
        // A name at offset 12 that points at itself.
        let mut packet = vec![0u8; 14];
        packet[4] = 0;
        packet[5] = 1;
        packet[12] = 0xC0;
        packet[13] = 0x0C;
        assert!(parse_name(&packet, 12).is_err());
    }
}
