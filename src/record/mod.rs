//! Knowledge records: the typed value cells stored in a context.
//!
//! A record pairs a [`Value`] with the replication metadata the merge
//! protocol needs (clock, quality, write quality, modification status).
//! Arithmetic and comparison between records live in [`ops`] and are total:
//! every pair of kinds produces a defined result.

pub mod ops;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Largest array [`KnowledgeRecord::set_index`] will grow to.
pub const MAX_ARRAY_LEN: usize = 1 << 24;

/// Flavour of a binary/file payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// UTF-8 text.
    Text,
    /// XML document (treated as text).
    Xml,
    /// JPEG image bytes.
    ImageJpeg,
    /// Opaque bytes.
    Unknown,
}

impl FileKind {
    /// True for file kinds whose bytes are meaningful as text.
    #[must_use]
    pub const fn is_textual(self) -> bool {
        matches!(self, Self::Text | Self::Xml)
    }
}

/// The payload of a knowledge record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// No value. Also what a deleted key reads as.
    Uncreated,
    Integer(i64),
    IntegerArray(Vec<i64>),
    Double(f64),
    DoubleArray(Vec<f64>),
    String(String),
    File {
        kind: FileKind,
        data: Vec<u8>,
    },
}

impl Default for Value {
    fn default() -> Self {
        Self::Uncreated
    }
}

/// Kind tag of a record, with the numeric codes `#type` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Uncreated,
    Integer,
    String,
    Double,
    UnknownFile,
    Xml,
    TextFile,
    IntegerArray,
    DoubleArray,
    ImageJpeg,
}

impl RecordKind {
    /// Bit-flag style code for the kind.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Uncreated => 0,
            Self::Integer => 1,
            Self::String => 2,
            Self::Double => 4,
            Self::UnknownFile => 8,
            Self::Xml => 16,
            Self::TextFile => 32,
            Self::IntegerArray => 64,
            Self::DoubleArray => 128,
            Self::ImageJpeg => 256,
        }
    }
}

/// Whether a record changed since it was last sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Unmodified,
    Modified,
}

/// A value plus per-key replication metadata.
///
/// # Examples
///
/// ```
/// use karl::KnowledgeRecord;
///
/// let a = KnowledgeRecord::from(3);
/// let b = KnowledgeRecord::from(4.5);
/// assert_eq!((&a + &b).to_double(), 7.5);
/// assert!(!KnowledgeRecord::default().exists());
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    pub value: Value,
    /// Logical time of the last write, local or remote.
    pub clock: u64,
    /// Priority of the writer that produced the current value.
    pub quality: u32,
    /// Priority this process writes the key with.
    pub write_quality: u32,
    pub status: Status,
}

impl KnowledgeRecord {
    /// Creates an unmodified record holding `value` with zeroed metadata.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    /// The canonical "no value" record.
    #[must_use]
    pub fn uncreated() -> Self {
        Self::default()
    }

    /// Creates a file record.
    #[must_use]
    pub fn file(kind: FileKind, data: Vec<u8>) -> Self {
        Self::new(Value::File { kind, data })
    }

    /// Returns this record's value with metadata taken from `meta`.
    #[must_use]
    pub fn with_meta_of(mut self, meta: &Self) -> Self {
        self.clock = meta.clock;
        self.quality = meta.quality;
        self.write_quality = meta.write_quality;
        self.status = meta.status;
        self
    }

    /// Kind tag of the payload.
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        match &self.value {
            Value::Uncreated => RecordKind::Uncreated,
            Value::Integer(_) => RecordKind::Integer,
            Value::IntegerArray(_) => RecordKind::IntegerArray,
            Value::Double(_) => RecordKind::Double,
            Value::DoubleArray(_) => RecordKind::DoubleArray,
            Value::String(_) => RecordKind::String,
            Value::File { kind, .. } => match kind {
                FileKind::Text => RecordKind::TextFile,
                FileKind::Xml => RecordKind::Xml,
                FileKind::ImageJpeg => RecordKind::ImageJpeg,
                FileKind::Unknown => RecordKind::UnknownFile,
            },
        }
    }

    /// False only for the uncreated sentinel.
    #[must_use]
    pub const fn exists(&self) -> bool {
        !matches!(self.value, Value::Uncreated)
    }

    #[must_use]
    pub const fn is_file_type(&self) -> bool {
        matches!(self.value, Value::File { .. })
    }

    #[must_use]
    pub const fn is_array_type(&self) -> bool {
        matches!(self.value, Value::IntegerArray(_) | Value::DoubleArray(_))
    }

    #[must_use]
    pub const fn is_string_type(&self) -> bool {
        matches!(self.value, Value::String(_))
    }

    #[must_use]
    pub const fn is_integer_type(&self) -> bool {
        matches!(self.value, Value::Integer(_) | Value::IntegerArray(_))
    }

    #[must_use]
    pub const fn is_double_type(&self) -> bool {
        matches!(self.value, Value::Double(_) | Value::DoubleArray(_))
    }

    #[must_use]
    pub const fn is_modified(&self) -> bool {
        matches!(self.status, Status::Modified)
    }

    /// KaRL truthiness.
    #[must_use]
    pub fn is_true(&self) -> bool {
        match &self.value {
            Value::Uncreated => false,
            Value::Integer(v) => *v != 0,
            Value::Double(v) => *v != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::IntegerArray(v) => v.iter().any(|x| *x != 0),
            Value::DoubleArray(v) => v.iter().any(|x| *x != 0.0),
            Value::File { data, .. } => !data.is_empty(),
        }
    }

    #[must_use]
    pub fn is_false(&self) -> bool {
        !self.is_true()
    }

    /// Number of elements (arrays), bytes (strings, files), 1 for numeric
    /// scalars, 0 when uncreated.
    #[must_use]
    pub fn size(&self) -> usize {
        match &self.value {
            Value::Uncreated => 0,
            Value::Integer(_) | Value::Double(_) => 1,
            Value::String(s) => s.len(),
            Value::IntegerArray(v) => v.len(),
            Value::DoubleArray(v) => v.len(),
            Value::File { data, .. } => data.len(),
        }
    }

    /// Integer view. Doubles truncate, strings parse (0 when unparseable),
    /// arrays yield their first element.
    #[must_use]
    pub fn to_integer(&self) -> i64 {
        match &self.value {
            Value::Uncreated => 0,
            Value::Integer(v) => *v,
            #[allow(clippy::cast_possible_truncation)]
            Value::Double(v) => *v as i64,
            Value::String(s) => parse_integer(s),
            Value::IntegerArray(v) => v.first().copied().unwrap_or(0),
            #[allow(clippy::cast_possible_truncation)]
            Value::DoubleArray(v) => v.first().map_or(0, |d| *d as i64),
            Value::File { kind, data } if kind.is_textual() => parse_integer(&String::from_utf8_lossy(data)),
            Value::File { .. } => 0,
        }
    }

    /// Double view, same rules as [`Self::to_integer`].
    #[must_use]
    pub fn to_double(&self) -> f64 {
        match &self.value {
            Value::Uncreated => 0.0,
            #[allow(clippy::cast_precision_loss)]
            Value::Integer(v) => *v as f64,
            Value::Double(v) => *v,
            Value::String(s) => parse_double(s),
            #[allow(clippy::cast_precision_loss)]
            Value::IntegerArray(v) => v.first().map_or(0.0, |i| *i as f64),
            Value::DoubleArray(v) => v.first().copied().unwrap_or(0.0),
            Value::File { kind, data } if kind.is_textual() => parse_double(&String::from_utf8_lossy(data)),
            Value::File { .. } => 0.0,
        }
    }

    /// Element-wise integer view; scalars become a one-element vector.
    #[must_use]
    pub fn to_integers(&self) -> Vec<i64> {
        match &self.value {
            Value::Uncreated => Vec::new(),
            Value::IntegerArray(v) => v.clone(),
            #[allow(clippy::cast_possible_truncation)]
            Value::DoubleArray(v) => v.iter().map(|d| *d as i64).collect(),
            _ => vec![self.to_integer()],
        }
    }

    /// Element-wise double view; scalars become a one-element vector.
    #[must_use]
    pub fn to_doubles(&self) -> Vec<f64> {
        match &self.value {
            Value::Uncreated => Vec::new(),
            #[allow(clippy::cast_precision_loss)]
            Value::IntegerArray(v) => v.iter().map(|i| *i as f64).collect(),
            Value::DoubleArray(v) => v.clone(),
            _ => vec![self.to_double()],
        }
    }

    /// String form with an explicit array delimiter.
    #[must_use]
    pub fn to_string_delimited(&self, delimiter: &str) -> String {
        match &self.value {
            Value::IntegerArray(v) => join(v, delimiter),
            Value::DoubleArray(v) => join(v, delimiter),
            _ => self.to_string(),
        }
    }

    /// Reads element `index` of an array. Out-of-range indexes and
    /// non-array records read as uncreated.
    #[must_use]
    pub fn retrieve_index(&self, index: usize) -> Self {
        match &self.value {
            Value::IntegerArray(v) => v.get(index).map_or_else(Self::uncreated, |x| Self::from(*x)),
            Value::DoubleArray(v) => v.get(index).map_or_else(Self::uncreated, |x| Self::from(*x)),
            _ => Self::uncreated(),
        }
    }

    /// Writes element `index`, growing the array with zeros as needed.
    ///
    /// A non-array record becomes a zero-filled array first. Storing a
    /// double into an integer array promotes the array to doubles. An
    /// index at or past [`MAX_ARRAY_LEN`] leaves the record untouched and
    /// returns false.
    pub fn set_index(&mut self, index: usize, element: &Self) -> bool {
        if index >= MAX_ARRAY_LEN {
            return false;
        }
        let store_double = element.is_double_type();
        match &mut self.value {
            Value::IntegerArray(v) if !store_double => {
                if v.len() <= index {
                    v.resize(index + 1, 0);
                }
                v[index] = element.to_integer();
            }
            Value::IntegerArray(v) => {
                #[allow(clippy::cast_precision_loss)]
                let mut promoted: Vec<f64> = v.iter().map(|i| *i as f64).collect();
                if promoted.len() <= index {
                    promoted.resize(index + 1, 0.0);
                }
                promoted[index] = element.to_double();
                self.value = Value::DoubleArray(promoted);
            }
            Value::DoubleArray(v) => {
                if v.len() <= index {
                    v.resize(index + 1, 0.0);
                }
                v[index] = element.to_double();
            }
            _ => {
                if store_double {
                    let mut fresh = vec![0.0; index + 1];
                    fresh[index] = element.to_double();
                    self.value = Value::DoubleArray(fresh);
                } else {
                    let mut fresh = vec![0; index + 1];
                    fresh[index] = element.to_integer();
                    self.value = Value::IntegerArray(fresh);
                }
            }
        }
        true
    }

    /// Inclusive slice `[first, last]` of a string, array or file.
    /// Scalars are returned unchanged.
    #[must_use]
    pub fn fragment(&self, first: usize, last: usize) -> Self {
        fn bounds(len: usize, first: usize, last: usize) -> Option<(usize, usize)> {
            if len == 0 || first > last || first >= len {
                return None;
            }
            Some((first, last.min(len - 1) + 1))
        }

        let value = match &self.value {
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                match bounds(chars.len(), first, last) {
                    Some((a, b)) => Value::String(chars[a..b].iter().collect()),
                    None => Value::String(String::new()),
                }
            }
            Value::IntegerArray(v) => match bounds(v.len(), first, last) {
                Some((a, b)) => Value::IntegerArray(v[a..b].to_vec()),
                None => Value::IntegerArray(Vec::new()),
            },
            Value::DoubleArray(v) => match bounds(v.len(), first, last) {
                Some((a, b)) => Value::DoubleArray(v[a..b].to_vec()),
                None => Value::DoubleArray(Vec::new()),
            },
            Value::File { kind, data } => match bounds(data.len(), first, last) {
                Some((a, b)) => Value::File {
                    kind: *kind,
                    data: data[a..b].to_vec(),
                },
                None => Value::File {
                    kind: *kind,
                    data: Vec::new(),
                },
            },
            other => other.clone(),
        };
        Self::new(value)
    }

    /// Resets the payload to uncreated, keeping metadata.
    pub fn clear_value(&mut self) {
        self.value = Value::Uncreated;
    }
}

fn parse_integer(s: &str) -> i64 {
    let t = s.trim();
    t.parse::<i64>().unwrap_or_else(|_| {
        #[allow(clippy::cast_possible_truncation)]
        t.parse::<f64>().map_or(0, |d| d as i64)
    })
}

fn parse_double(s: &str) -> f64 {
    s.trim().parse::<f64>().unwrap_or(0.0)
}

fn join<T: fmt::Display>(items: &[T], delimiter: &str) -> String {
    let mut out = String::new();
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(delimiter);
        }
        out.push_str(&item.to_string());
    }
    out
}

impl fmt::Display for KnowledgeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::Uncreated => write!(f, "0"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s}"),
            Value::IntegerArray(v) => write!(f, "{}", join(v, ", ")),
            Value::DoubleArray(v) => write!(f, "{}", join(v, ", ")),
            Value::File { kind, data } if kind.is_textual() => write!(f, "{}", String::from_utf8_lossy(data)),
            Value::File { data, .. } => write!(f, "<binary: {} bytes>", data.len()),
        }
    }
}

impl From<Value> for KnowledgeRecord {
    fn from(v: Value) -> Self {
        Self::new(v)
    }
}

impl From<bool> for KnowledgeRecord {
    fn from(v: bool) -> Self {
        Self::new(Value::Integer(i64::from(v)))
    }
}

impl From<i32> for KnowledgeRecord {
    fn from(v: i32) -> Self {
        Self::new(Value::Integer(i64::from(v)))
    }
}

impl From<i64> for KnowledgeRecord {
    fn from(v: i64) -> Self {
        Self::new(Value::Integer(v))
    }
}

impl From<usize> for KnowledgeRecord {
    fn from(v: usize) -> Self {
        Self::new(Value::Integer(i64::try_from(v).unwrap_or(i64::MAX)))
    }
}

impl From<f64> for KnowledgeRecord {
    fn from(v: f64) -> Self {
        Self::new(Value::Double(v))
    }
}

impl From<&str> for KnowledgeRecord {
    fn from(v: &str) -> Self {
        Self::new(Value::String(v.to_string()))
    }
}

impl From<String> for KnowledgeRecord {
    fn from(v: String) -> Self {
        Self::new(Value::String(v))
    }
}

impl From<Vec<i64>> for KnowledgeRecord {
    fn from(v: Vec<i64>) -> Self {
        Self::new(Value::IntegerArray(v))
    }
}

impl From<Vec<f64>> for KnowledgeRecord {
    fn from(v: Vec<f64>) -> Self {
        Self::new(Value::DoubleArray(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncreated_is_distinct_from_zero() {
        let none = KnowledgeRecord::uncreated();
        let zero = KnowledgeRecord::from(0);
        assert!(!none.exists());
        assert!(zero.exists());
        assert_eq!(none.to_integer(), zero.to_integer());
        assert_ne!(none.kind(), zero.kind());
    }

    #[test]
    fn test_kind_codes() {
        assert_eq!(KnowledgeRecord::from(1).kind().code(), 1);
        assert_eq!(KnowledgeRecord::from("s").kind().code(), 2);
        assert_eq!(KnowledgeRecord::from(1.0).kind().code(), 4);
        assert_eq!(KnowledgeRecord::from(vec![1i64]).kind().code(), 64);
        assert_eq!(KnowledgeRecord::file(FileKind::Xml, Vec::new()).kind().code(), 16);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(KnowledgeRecord::from(" 12 ").to_integer(), 12);
        assert_eq!(KnowledgeRecord::from("3.7").to_integer(), 3);
        assert_eq!(KnowledgeRecord::from("abc").to_integer(), 0);
        assert_eq!(KnowledgeRecord::from(2.9).to_integer(), 2);
        assert_eq!(KnowledgeRecord::from(f64::NAN).to_integer(), 0);
        assert!((KnowledgeRecord::from("2.5").to_double() - 2.5).abs() < f64::EPSILON);
        assert_eq!(KnowledgeRecord::from(vec![4i64, 5]).to_integer(), 4);
        assert_eq!(KnowledgeRecord::file(FileKind::Text, b"42".to_vec()).to_integer(), 42);
        assert_eq!(KnowledgeRecord::file(FileKind::ImageJpeg, b"42".to_vec()).to_integer(), 0);
    }

    #[test]
    fn test_to_string_forms() {
        assert_eq!(KnowledgeRecord::from(7).to_string(), "7");
        assert_eq!(KnowledgeRecord::from(7.0).to_string(), "7");
        assert_eq!(KnowledgeRecord::from(2.5).to_string(), "2.5");
        assert_eq!(KnowledgeRecord::uncreated().to_string(), "0");
        assert_eq!(KnowledgeRecord::from(vec![1i64, 2, 3]).to_string(), "1, 2, 3");
        assert_eq!(KnowledgeRecord::from(vec![1i64, 2]).to_string_delimited(";"), "1;2");
    }

    #[test]
    fn test_truthiness() {
        assert!(KnowledgeRecord::from(1).is_true());
        assert!(KnowledgeRecord::from(0).is_false());
        assert!(KnowledgeRecord::uncreated().is_false());
        assert!(KnowledgeRecord::from("x").is_true());
        assert!(KnowledgeRecord::from("").is_false());
        assert!(KnowledgeRecord::from(vec![0i64, 0, 3]).is_true());
        assert!(KnowledgeRecord::from(vec![0.0, 0.0]).is_false());
    }

    #[test]
    fn test_set_index_grows_with_zeros() {
        let mut rec = KnowledgeRecord::from(vec![1i64]);
        rec.set_index(3, &KnowledgeRecord::from(9));
        assert_eq!(rec.value, Value::IntegerArray(vec![1, 0, 0, 9]));
    }

    #[test]
    fn test_set_index_on_scalar_creates_array() {
        let mut rec = KnowledgeRecord::uncreated();
        rec.set_index(2, &KnowledgeRecord::from(5));
        assert_eq!(rec.value, Value::IntegerArray(vec![0, 0, 5]));

        let mut rec = KnowledgeRecord::from("text");
        rec.set_index(0, &KnowledgeRecord::from(1.5));
        assert_eq!(rec.value, Value::DoubleArray(vec![1.5]));
    }

    #[test]
    fn test_set_index_past_limit_is_ignored() {
        let mut rec = KnowledgeRecord::from(vec![1i64, 2]);
        assert!(!rec.set_index(MAX_ARRAY_LEN, &KnowledgeRecord::from(9)));
        assert!(!rec.set_index(usize::MAX, &KnowledgeRecord::from(9.5)));
        assert_eq!(rec.value, Value::IntegerArray(vec![1, 2]));

        let mut rec = KnowledgeRecord::uncreated();
        assert!(!rec.set_index(2_000_000_000_000_000_000, &KnowledgeRecord::from(1)));
        assert!(!rec.exists());
        assert!(rec.set_index(0, &KnowledgeRecord::from(1)));
    }

    #[test]
    fn test_set_index_promotes_to_doubles() {
        let mut rec = KnowledgeRecord::from(vec![1i64, 2]);
        rec.set_index(1, &KnowledgeRecord::from(0.5));
        assert_eq!(rec.value, Value::DoubleArray(vec![1.0, 0.5]));
    }

    #[test]
    fn test_retrieve_index() {
        let rec = KnowledgeRecord::from(vec![1.5, 2.5]);
        assert_eq!(rec.retrieve_index(1).to_double(), 2.5);
        assert!(!rec.retrieve_index(2).exists());
        assert!(!KnowledgeRecord::from(5).retrieve_index(0).exists());
    }

    #[test]
    fn test_fragment() {
        assert_eq!(KnowledgeRecord::from("hello").fragment(1, 3).to_string(), "ell");
        assert_eq!(KnowledgeRecord::from("hello").fragment(3, 100).to_string(), "lo");
        assert_eq!(KnowledgeRecord::from("hello").fragment(9, 10).to_string(), "");
        assert_eq!(
            KnowledgeRecord::from(vec![1i64, 2, 3, 4]).fragment(1, 2).value,
            Value::IntegerArray(vec![2, 3])
        );
        assert_eq!(KnowledgeRecord::from(5).fragment(0, 0).to_integer(), 5);
    }

    #[test]
    fn test_size() {
        assert_eq!(KnowledgeRecord::uncreated().size(), 0);
        assert_eq!(KnowledgeRecord::from(3).size(), 1);
        assert_eq!(KnowledgeRecord::from("abc").size(), 3);
        assert_eq!(KnowledgeRecord::from(vec![1.0, 2.0]).size(), 2);
    }

    #[test]
    fn test_value_serialization() {
        let rec = KnowledgeRecord::from(vec![1i64, 2]);
        let json = serde_json::to_string(&rec.value).unwrap();
        assert!(json.contains("integer_array"));
        let decoded: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, rec.value);
    }
}
