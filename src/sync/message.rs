//! Binary wire format for update messages.
//!
//! Frame layout, all integers big-endian:
//! ```text
//! magic "KaRL" | version u8 | type u8
//! originator str | domain str | quality u32 | clock u64 | timestamp_ms u64 | ttl u8
//! count u32 | count * (key str | clock u64 | quality u32 | tag u8 | payload)
//! crc32 u32 over everything before it
//! ```
//! A `str` is a u16 byte length followed by UTF-8.

use chrono::Utc;
use crc32fast::Hasher;

use crate::error::TransportError;
use crate::record::{FileKind, KnowledgeRecord, Value};

pub const MAGIC: [u8; 4] = *b"KaRL";

pub const WIRE_VERSION: u8 = 1;

pub const MESSAGE_UPDATE: u8 = 1;

const TAG_UNCREATED: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_INTEGER_ARRAY: u8 = 4;
const TAG_DOUBLE_ARRAY: u8 = 5;
const TAG_FILE: u8 = 6;

/// Smallest possible frame: header with empty strings, no updates, CRC.
const MIN_FRAME_LEN: usize = 4 + 1 + 1 + 2 + 2 + 4 + 8 + 8 + 1 + 4 + 4;

/// A batch of updates published by one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateMessage {
    /// Id of the peer that first published the updates. Preserved across
    /// rebroadcasts.
    pub originator: String,
    pub domain: String,
    pub quality: u32,
    pub clock: u64,
    /// Publish time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Remaining rebroadcast hops.
    pub ttl: u8,
    pub updates: Vec<(String, KnowledgeRecord)>,
}

impl UpdateMessage {
    /// A fresh message stamped with the current time. The message clock
    /// and quality are the highest among the updates.
    #[must_use]
    pub fn new(originator: &str, domain: &str, ttl: u8, updates: Vec<(String, KnowledgeRecord)>) -> Self {
        let clock = updates.iter().map(|(_, r)| r.clock).max().unwrap_or(0);
        let quality = updates.iter().map(|(_, r)| r.quality).max().unwrap_or(0);
        Self {
            originator: originator.to_string(),
            domain: domain.to_string(),
            quality,
            clock,
            timestamp_ms: now_ms(),
            ttl,
            updates,
        }
    }

    /// Serializes the message, failing when the frame would exceed
    /// `max_bytes`.
    pub fn encode(&self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        let mut out = Vec::with_capacity(MIN_FRAME_LEN + self.updates.len() * 32);
        out.extend_from_slice(&MAGIC);
        out.push(WIRE_VERSION);
        out.push(MESSAGE_UPDATE);
        put_str(&mut out, &self.originator)?;
        put_str(&mut out, &self.domain)?;
        out.extend_from_slice(&self.quality.to_be_bytes());
        out.extend_from_slice(&self.clock.to_be_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.push(self.ttl);
        put_len(&mut out, self.updates.len())?;
        for (key, record) in &self.updates {
            put_str(&mut out, key)?;
            out.extend_from_slice(&record.clock.to_be_bytes());
            out.extend_from_slice(&record.quality.to_be_bytes());
            put_value(&mut out, &record.value)?;
            if out.len() + 4 > max_bytes {
                return Err(TransportError::MessageTooLarge {
                    size: out.len() + 4,
                    max: max_bytes,
                });
            }
        }

        let mut hasher = Hasher::new();
        hasher.update(&out);
        let crc = hasher.finalize();
        out.extend_from_slice(&crc.to_be_bytes());

        if out.len() > max_bytes {
            return Err(TransportError::MessageTooLarge {
                size: out.len(),
                max: max_bytes,
            });
        }
        Ok(out)
    }

    /// Parses and verifies a frame.
    pub fn decode(frame: &[u8]) -> Result<Self, TransportError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(decode_error(format!("frame of {} bytes is too short", frame.len())));
        }
        let (body, crc_bytes) = frame.split_at(frame.len() - 4);
        let stored = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(decode_error(format!(
                "CRC mismatch: stored={stored:08x}, computed={computed:08x}"
            )));
        }

        let mut r = Reader { buf: body, pos: 0 };
        if r.take(4)? != MAGIC {
            return Err(decode_error("bad magic".to_string()));
        }
        let version = r.u8()?;
        if version != WIRE_VERSION {
            return Err(decode_error(format!("unsupported wire version {version}")));
        }
        let kind = r.u8()?;
        if kind != MESSAGE_UPDATE {
            return Err(decode_error(format!("unknown message type {kind}")));
        }

        let originator = r.str()?;
        let domain = r.str()?;
        let quality = r.u32()?;
        let clock = r.u64()?;
        let timestamp_ms = r.u64()?;
        let ttl = r.u8()?;
        let count = r.len()?;
        let mut updates = Vec::with_capacity(count.min(body.len()));
        for _ in 0..count {
            let key = r.str()?;
            let mut record = KnowledgeRecord::new(Value::Uncreated);
            record.clock = r.u64()?;
            record.quality = r.u32()?;
            record.value = r.value()?;
            updates.push((key, record));
        }
        if r.pos != body.len() {
            return Err(decode_error(format!("{} trailing bytes", body.len() - r.pos)));
        }

        Ok(Self {
            originator,
            domain,
            quality,
            clock,
            timestamp_ms,
            ttl,
            updates,
        })
    }
}

pub(crate) fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

fn decode_error(message: String) -> TransportError {
    TransportError::Decode { message }
}

fn put_len(out: &mut Vec<u8>, len: usize) -> Result<(), TransportError> {
    let len = u32::try_from(len).map_err(|_| TransportError::MessageTooLarge {
        size: len,
        max: u32::MAX as usize,
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), TransportError> {
    let len = u16::try_from(s.len()).map_err(|_| TransportError::MessageTooLarge {
        size: s.len(),
        max: usize::from(u16::MAX),
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

const fn file_kind_code(kind: FileKind) -> u8 {
    match kind {
        FileKind::Text => 0,
        FileKind::Xml => 1,
        FileKind::ImageJpeg => 2,
        FileKind::Unknown => 3,
    }
}

fn put_value(out: &mut Vec<u8>, value: &Value) -> Result<(), TransportError> {
    match value {
        Value::Uncreated => out.push(TAG_UNCREATED),
        Value::Integer(v) => {
            out.push(TAG_INTEGER);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            put_len(out, s.len())?;
            out.extend_from_slice(s.as_bytes());
        }
        Value::Double(v) => {
            out.push(TAG_DOUBLE);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Value::IntegerArray(v) => {
            out.push(TAG_INTEGER_ARRAY);
            put_len(out, v.len())?;
            for x in v {
                out.extend_from_slice(&x.to_be_bytes());
            }
        }
        Value::DoubleArray(v) => {
            out.push(TAG_DOUBLE_ARRAY);
            put_len(out, v.len())?;
            for x in v {
                out.extend_from_slice(&x.to_bits().to_be_bytes());
            }
        }
        Value::File { kind, data } => {
            out.push(TAG_FILE);
            out.push(file_kind_code(*kind));
            put_len(out, data.len())?;
            out.extend_from_slice(data);
        }
    }
    Ok(())
}

struct Reader<'b> {
    buf: &'b [u8],
    pos: usize,
}

impl<'b> Reader<'b> {
    fn take(&mut self, n: usize) -> Result<&'b [u8], TransportError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| decode_error(format!("truncated frame at byte {}", self.pos)))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], TransportError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, TransportError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, TransportError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, TransportError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn len(&mut self) -> Result<usize, TransportError> {
        usize::try_from(self.u32()?).map_err(|_| decode_error("length overflows usize".to_string()))
    }

    fn str(&mut self) -> Result<String, TransportError> {
        let len = usize::from(u16::from_be_bytes(self.array()?));
        self.utf8(len)
    }

    fn utf8(&mut self, len: usize) -> Result<String, TransportError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| decode_error(format!("invalid UTF-8: {e}")))
    }

    /// Element count for an array of `width`-byte items, checked against
    /// the remaining input before anything is allocated.
    fn count(&mut self, width: usize) -> Result<usize, TransportError> {
        let n = self.len()?;
        if n.saturating_mul(width) > self.buf.len() - self.pos {
            return Err(decode_error(format!("array of {n} elements exceeds frame")));
        }
        Ok(n)
    }

    fn value(&mut self) -> Result<Value, TransportError> {
        let value = match self.u8()? {
            TAG_UNCREATED => Value::Uncreated,
            TAG_INTEGER => Value::Integer(i64::from_be_bytes(self.array()?)),
            TAG_STRING => {
                let len = self.len()?;
                Value::String(self.utf8(len)?)
            }
            TAG_DOUBLE => Value::Double(f64::from_bits(self.u64()?)),
            TAG_INTEGER_ARRAY => {
                let n = self.count(8)?;
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(i64::from_be_bytes(self.array()?));
                }
                Value::IntegerArray(v)
            }
            TAG_DOUBLE_ARRAY => {
                let n = self.count(8)?;
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(f64::from_bits(self.u64()?));
                }
                Value::DoubleArray(v)
            }
            TAG_FILE => {
                let kind = match self.u8()? {
                    0 => FileKind::Text,
                    1 => FileKind::Xml,
                    2 => FileKind::ImageJpeg,
                    _ => FileKind::Unknown,
                };
                let len = self.count(1)?;
                Value::File {
                    kind,
                    data: self.take(len)?.to_vec(),
                }
            }
            other => return Err(decode_error(format!("unknown value tag {other}"))),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UpdateMessage {
        let mut x = KnowledgeRecord::from(42);
        x.clock = 7;
        x.quality = 3;
        let mut name = KnowledgeRecord::from("ok");
        name.clock = 2;
        UpdateMessage {
            originator: "a".into(),
            domain: "d".into(),
            quality: 3,
            clock: 7,
            timestamp_ms: 1,
            ttl: 2,
            updates: vec![
                ("x".into(), x),
                ("name".into(), name),
                ("arr".into(), KnowledgeRecord::from(vec![1.5, -2.0])),
                ("blob".into(), KnowledgeRecord::file(FileKind::ImageJpeg, vec![0xff, 0xd8])),
            ],
        }
    }

    #[test]
    fn test_header_bytes() {
        let msg = UpdateMessage {
            updates: Vec::new(),
            ..sample()
        };
        let frame = msg.encode(1024).unwrap();
        let header = hex::encode(&frame[..frame.len() - 4]);
        assert_eq!(
            header,
            concat!(
                "4b61524c", "01", "01", // magic, version, type
                "0001", "61", "0001", "64", // originator "a", domain "d"
                "00000003", "0000000000000007", "0000000000000001", "02", // quality, clock, ts, ttl
                "00000000", // no updates
            )
        );
    }

    #[test]
    fn test_decode_restores_message() {
        let msg = sample();
        let decoded = UpdateMessage::decode(&msg.encode(1024).unwrap()).unwrap();
        assert_eq!(decoded.originator, "a");
        assert_eq!(decoded.ttl, 2);
        assert_eq!(decoded.updates.len(), 4);
        assert_eq!(decoded.updates[0].1.to_integer(), 42);
        assert_eq!(decoded.updates[0].1.clock, 7);
        assert_eq!(decoded.updates[0].1.quality, 3);
        assert_eq!(decoded.updates[1].1.to_string(), "ok");
        assert_eq!(decoded.updates[2].1.value, Value::DoubleArray(vec![1.5, -2.0]));
        assert_eq!(decoded.updates[3].1.value, Value::File {
            kind: FileKind::ImageJpeg,
            data: vec![0xff, 0xd8],
        });
    }

    #[test]
    fn test_detects_corruption() {
        let mut frame = sample().encode(1024).unwrap();
        frame[12] ^= 0xFF;
        let err = UpdateMessage::decode(&frame).unwrap_err();
        assert!(err.to_string().contains("CRC"));
    }

    #[test]
    fn test_rejects_truncated_frame() {
        let frame = sample().encode(1024).unwrap();
        assert!(matches!(UpdateMessage::decode(&frame[..10]), Err(TransportError::Decode { .. })));
    }

    #[test]
    fn test_rejects_oversized_message() {
        let big = UpdateMessage::new("a", "d", 0, vec![("k".into(), KnowledgeRecord::from("x".repeat(200)))]);
        assert!(matches!(big.encode(64), Err(TransportError::MessageTooLarge { max: 64, .. })));
    }

    #[test]
    fn test_new_takes_highest_clock_and_quality() {
        let mut a = KnowledgeRecord::from(1);
        a.clock = 4;
        a.quality = 1;
        let mut b = KnowledgeRecord::from(2);
        b.clock = 9;
        let msg = UpdateMessage::new("me", "d", 3, vec![("a".into(), a), ("b".into(), b)]);
        assert_eq!((msg.clock, msg.quality, msg.ttl), (9, 1, 3));
        assert!(msg.timestamp_ms > 0);
    }
}
