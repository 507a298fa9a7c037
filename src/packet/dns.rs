//! DNS message parsing and reserialization.
//!
//! The inbound pipeline inspects every tunneled packet that decodes as DNS.
//! Answer names and A-record addresses feed the DNS record log, and
//! configured hostnames get their A records overwritten before reinjection.
//! Reserialization expands compression pointers, so the message may grow.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Resource record type A.
pub const TYPE_A: u16 = 1;
/// Resource record type NS.
pub const TYPE_NS: u16 = 2;
/// Resource record type CNAME.
pub const TYPE_CNAME: u16 = 5;
/// Resource record type PTR.
pub const TYPE_PTR: u16 = 12;

const FLAG_RESPONSE: u16 = 0x8000;

// Compression pointers can chain; anything deeper than this is hostile.
const MAX_POINTER_JUMPS: usize = 16;

/// A question section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// Resource record data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    /// An IPv4 address (type A).
    A(Ipv4Addr),
    /// A domain name (NS, CNAME, PTR); re-encoded without compression.
    Name(String),
    /// Anything else, kept verbatim.
    Raw(Vec<u8>),
}

/// A resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

/// A parsed DNS message.
#[derive(Debug, Clone)]
pub struct DnsMessage {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl DnsMessage {
    /// Parse a DNS message from a UDP payload or an unprefixed TCP message.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(Error::Parse("DNS message too short".into()));
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        let qdcount = u16::from_be_bytes([data[4], data[5]]);
        let ancount = u16::from_be_bytes([data[6], data[7]]);
        let nscount = u16::from_be_bytes([data[8], data[9]]);
        let arcount = u16::from_be_bytes([data[10], data[11]]);

        let mut pos = 12;

        let mut questions = Vec::with_capacity(usize::from(qdcount));
        for _ in 0..qdcount {
            let (name, next) = read_name(data, pos)?;
            if data.len() < next + 4 {
                return Err(Error::Parse("DNS question truncated".into()));
            }
            questions.push(DnsQuestion {
                name,
                qtype: u16::from_be_bytes([data[next], data[next + 1]]),
                qclass: u16::from_be_bytes([data[next + 2], data[next + 3]]),
            });
            pos = next + 4;
        }

        let mut read_records = |count: u16, pos: &mut usize| -> Result<Vec<DnsRecord>> {
            let mut records = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                let (record, next) = read_record(data, *pos)?;
                records.push(record);
                *pos = next;
            }
            Ok(records)
        };

        let answers = read_records(ancount, &mut pos)?;
        let authorities = read_records(nscount, &mut pos)?;
        let additionals = read_records(arcount, &mut pos)?;

        Ok(Self {
            id,
            flags,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Whether the message is a response.
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    /// The name of the first answer and the IPv4 addresses of all A records.
    pub fn answers(&self) -> (String, Vec<Ipv4Addr>) {
        let name = self
            .answers
            .first()
            .map(|r| r.name.clone())
            .unwrap_or_default();
        let ips = self
            .answers
            .iter()
            .filter_map(|r| match r.data {
                RecordData::A(ip) => Some(ip),
                _ => None,
            })
            .collect();
        (name, ips)
    }

    /// Overwrite every A answer's address with `replacement`.
    pub fn overwrite_a_records(&mut self, replacement: Ipv4Addr) {
        for record in &mut self.answers {
            if let RecordData::A(ref mut ip) = record.data {
                *ip = replacement;
            }
        }
    }

    /// Serialize the message, expanding name compression.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.authorities.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.additionals.len() as u16).to_be_bytes());

        for question in &self.questions {
            write_name(&mut out, &question.name);
            out.extend_from_slice(&question.qtype.to_be_bytes());
            out.extend_from_slice(&question.qclass.to_be_bytes());
        }

        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            write_name(&mut out, &record.name);
            out.extend_from_slice(&record.rtype.to_be_bytes());
            out.extend_from_slice(&record.class.to_be_bytes());
            out.extend_from_slice(&record.ttl.to_be_bytes());

            match &record.data {
                RecordData::A(ip) => {
                    out.extend_from_slice(&4u16.to_be_bytes());
                    out.extend_from_slice(&ip.octets());
                }
                RecordData::Name(name) => {
                    let mut rdata = Vec::new();
                    write_name(&mut rdata, name);
                    out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
                    out.extend_from_slice(&rdata);
                }
                RecordData::Raw(bytes) => {
                    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                    out.extend_from_slice(bytes);
                }
            }
        }

        out
    }
}

/// Read a possibly-compressed name starting at `pos`.
///
/// Returns the name and the offset just past its encoding at `pos`.
fn read_name(data: &[u8], pos: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut cursor = pos;
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *data
            .get(cursor)
            .ok_or_else(|| Error::Parse("DNS name truncated".into()))?;

        if len & 0xc0 == 0xc0 {
            if jumps >= MAX_POINTER_JUMPS {
                return Err(Error::Parse("DNS name pointer loop".into()));
            }
            let low = *data
                .get(cursor + 1)
                .ok_or_else(|| Error::Parse("DNS name pointer truncated".into()))?;
            if end.is_none() {
                end = Some(cursor + 2);
            }
            cursor = usize::from(u16::from_be_bytes([len & 0x3f, low]));
            jumps += 1;
            continue;
        }

        if len == 0 {
            if end.is_none() {
                end = Some(cursor + 1);
            }
            break;
        }

        let len = usize::from(len);
        let label = data
            .get(cursor + 1..cursor + 1 + len)
            .ok_or_else(|| Error::Parse("DNS label truncated".into()))?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        cursor += 1 + len;
    }

    Ok((name, end.unwrap_or(cursor)))
}

/// Write an uncompressed name encoding.
fn write_name(out: &mut Vec<u8>, name: &str) {
    if !name.is_empty() {
        for label in name.split('.') {
            let label = label.as_bytes();
            let len = label.len().min(63);
            out.push(len as u8);
            out.extend_from_slice(&label[..len]);
        }
    }
    out.push(0);
}

fn read_record(data: &[u8], pos: usize) -> Result<(DnsRecord, usize)> {
    let (name, next) = read_name(data, pos)?;
    if data.len() < next + 10 {
        return Err(Error::Parse("DNS record truncated".into()));
    }

    let rtype = u16::from_be_bytes([data[next], data[next + 1]]);
    let class = u16::from_be_bytes([data[next + 2], data[next + 3]]);
    let ttl = u32::from_be_bytes([
        data[next + 4],
        data[next + 5],
        data[next + 6],
        data[next + 7],
    ]);
    let rdlength = usize::from(u16::from_be_bytes([data[next + 8], data[next + 9]]));

    let rdata_start = next + 10;
    let rdata = data
        .get(rdata_start..rdata_start + rdlength)
        .ok_or_else(|| Error::Parse("DNS rdata truncated".into()))?;

    let record_data = match rtype {
        TYPE_A if rdlength == 4 => {
            RecordData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
        }
        TYPE_NS | TYPE_CNAME | TYPE_PTR => {
            let (target, _) = read_name(data, rdata_start)?;
            RecordData::Name(target)
        }
        _ => RecordData::Raw(rdata.to_vec()),
    };

    Ok((
        DnsRecord {
            name,
            rtype,
            class,
            ttl,
            data: record_data,
        },
        rdata_start + rdlength,
    ))
}

/// Response for api.example.com with a CNAME and two A answers, using
/// compression pointers the way real resolvers emit them. Shared fixture
/// for tests across the crate.
#[cfg(test)]
pub(crate) fn sample_response() -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&0x1234u16.to_be_bytes()); // id
    msg.extend_from_slice(&0x8180u16.to_be_bytes()); // response, RD, RA
    msg.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    msg.extend_from_slice(&3u16.to_be_bytes()); // ancount
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());

    // Question: api.example.com A IN (name starts at offset 12)
    msg.extend_from_slice(b"\x03api\x07example\x03com\x00");
    msg.extend_from_slice(&TYPE_A.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());

    // CNAME answer: api.example.com -> edge.example.com
    msg.extend_from_slice(&[0xc0, 0x0c]); // pointer to question name
    msg.extend_from_slice(&TYPE_CNAME.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&300u32.to_be_bytes());
    msg.extend_from_slice(&7u16.to_be_bytes()); // rdlength
    msg.extend_from_slice(b"\x04edge");
    msg.extend_from_slice(&[0xc0, 0x10]); // pointer to example.com

    // Two A answers for the CNAME target.
    for ip in [[104u8, 244, 42, 1], [104u8, 244, 42, 2]] {
        msg.extend_from_slice(&[0xc0, 0x2d]); // pointer to edge.example.com
        msg.extend_from_slice(&TYPE_A.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&300u32.to_be_bytes());
        msg.extend_from_slice(&4u16.to_be_bytes());
        msg.extend_from_slice(&ip);
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        let msg = DnsMessage::parse(&sample_response()).unwrap();

        assert!(msg.is_response());
        assert_eq!(msg.questions.len(), 1);
        assert_eq!(msg.questions[0].name, "api.example.com");
        assert_eq!(msg.answers.len(), 3);
        assert_eq!(msg.answers[0].name, "api.example.com");
        assert_eq!(
            msg.answers[0].data,
            RecordData::Name("edge.example.com".into())
        );
        assert_eq!(msg.answers[1].name, "edge.example.com");
    }

    #[test]
    fn test_answers() {
        let msg = DnsMessage::parse(&sample_response()).unwrap();
        let (name, ips) = msg.answers();

        assert_eq!(name, "api.example.com");
        assert_eq!(
            ips,
            vec![
                Ipv4Addr::new(104, 244, 42, 1),
                Ipv4Addr::new(104, 244, 42, 2)
            ]
        );
    }

    #[test]
    fn test_overwrite_a_records() {
        let mut msg = DnsMessage::parse(&sample_response()).unwrap();
        let replacement = Ipv4Addr::new(192, 168, 123, 164);

        msg.overwrite_a_records(replacement);

        let (_, ips) = msg.answers();
        assert_eq!(ips, vec![replacement, replacement]);
        // The CNAME answer is untouched.
        assert_eq!(
            msg.answers[0].data,
            RecordData::Name("edge.example.com".into())
        );
    }

    #[test]
    fn test_serialize_reparse() {
        let mut msg = DnsMessage::parse(&sample_response()).unwrap();
        msg.overwrite_a_records(Ipv4Addr::new(192, 168, 123, 164));

        let bytes = msg.serialize();
        let reparsed = DnsMessage::parse(&bytes).unwrap();

        assert!(reparsed.is_response());
        assert_eq!(reparsed.id, 0x1234);
        assert_eq!(reparsed.questions[0].name, "api.example.com");

        let (name, ips) = reparsed.answers();
        assert_eq!(name, "api.example.com");
        assert_eq!(ips, vec![Ipv4Addr::new(192, 168, 123, 164); 2]);
    }

    #[test]
    fn test_query_is_not_response() {
        let mut query = sample_response();
        query[2] = 0x01; // clear QR
        query[3] = 0x00;
        let msg = DnsMessage::parse(&query).unwrap();
        assert!(!msg.is_response());
    }

    #[test]
    fn test_pointer_loop_rejected() {
        let mut msg = vec![0u8; 12];
        msg[5] = 1; // one question
        msg.extend_from_slice(&[0xc0, 0x0c]); // name points at itself
        msg.extend_from_slice(&[0, 1, 0, 1]);

        assert!(DnsMessage::parse(&msg).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(DnsMessage::parse(&[0u8; 5]).is_err());

        let mut msg = sample_response();
        msg.truncate(msg.len() - 3);
        assert!(DnsMessage::parse(&msg).is_err());
    }
}
