//! Typed record codec: a `Format` describes a record as an ordered list of
//! typed fields with explicit list/length pairings, and drives both the
//! delimited text encoding (ingestion) and the self-delimiting binary
//! encoding (the compressed on-disk files).

use crate::cache::{FileId, PageCache};
use crate::datetime::Stamp;
use crate::types::AccountKind;
use std::fmt::Write as _;

// ---------------------------------------------------------------------------
// Field types and values
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldType {
    /// `True` / `False`; one byte in binary.
    Bool,
    /// Account kind; one byte in binary.
    Kind,
    /// Non-negative decimal; four bytes big-endian in binary.
    Int,
    /// No text form; eight bytes big-endian in binary.
    Double,
    /// Non-empty text up to the next separator; length-paired in binary.
    Str,
    /// Possibly empty text; length-paired in binary.
    OptStr,
    /// `[a, b, c]`; length-paired in binary, four bytes per element.
    IntList,
    /// `YYYY-MM-DD`; text-only.
    Date,
    /// `YYYY-MM-DD HH:MM:SS`; four bytes packed in binary.
    DateTime,
}

impl FieldType {
    fn fixed_size(self) -> Option<usize> {
        match self {
            FieldType::Bool | FieldType::Kind => Some(1),
            FieldType::Int => Some(4),
            FieldType::Double => Some(8),
            FieldType::DateTime => Some(4),
            FieldType::Str | FieldType::OptStr | FieldType::IntList | FieldType::Date => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Kind(AccountKind),
    Int(u32),
    Double(f64),
    Str(String),
    OptStr(String),
    IntList(Vec<u32>),
    Date(Stamp),
    DateTime(Stamp),
}

impl Value {
    pub fn as_u32(&self) -> u32 {
        match self {
            Value::Int(n) => *n,
            other => panic!("int field expected, got {other:?}"),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            other => panic!("bool field expected, got {other:?}"),
        }
    }

    pub fn as_kind(&self) -> AccountKind {
        match self {
            Value::Kind(k) => *k,
            other => panic!("kind field expected, got {other:?}"),
        }
    }

    pub fn as_stamp(&self) -> Stamp {
        match self {
            Value::Date(s) | Value::DateTime(s) => *s,
            other => panic!("date field expected, got {other:?}"),
        }
    }

    pub fn as_text(&self) -> &str {
        match self {
            Value::Str(s) | Value::OptStr(s) => s,
            other => panic!("text field expected, got {other:?}"),
        }
    }

    pub fn as_ints(&self) -> &[u32] {
        match self {
            Value::IntList(v) => v,
            other => panic!("list field expected, got {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Format
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: &'static str,
    pub ty: FieldType,
}

pub fn field(name: &'static str, ty: FieldType) -> FieldDef {
    FieldDef { name, ty }
}

/// Record layout description. Constructed once per record shape; the codec
/// keeps no per-record metadata of its own.
#[derive(Clone, Debug)]
pub struct Format {
    fields: Vec<FieldDef>,
    /// Text separator between fields; `None` marks a binary format.
    separator: Option<char>,
    /// For each field, the ordinal of the field carrying its byte/element
    /// length. Populated for every variable-length field of a binary format
    /// and every list field of a text format.
    len_of: Vec<Option<usize>>,
}

impl Format {
    /// Text format: fields separated by `separator`, list fields paired with
    /// the count field named in `pairs` as `(list, count)`.
    pub fn text(separator: char, fields: Vec<FieldDef>, pairs: &[(usize, usize)]) -> Self {
        let len_of = Self::check_pairs(&fields, pairs);
        for (i, f) in fields.iter().enumerate() {
            if f.ty == FieldType::IntList {
                assert!(len_of[i].is_some(), "list field {} has no length pairing", f.name);
            }
            assert!(f.ty != FieldType::Double, "double has no text representation");
        }
        Format { fields, separator: Some(separator), len_of }
    }

    /// Binary format: self-delimiting, every variable-length field paired
    /// with a preceding length field.
    pub fn binary(fields: Vec<FieldDef>, pairs: &[(usize, usize)]) -> Self {
        let len_of = Self::check_pairs(&fields, pairs);
        for (i, f) in fields.iter().enumerate() {
            assert!(f.ty != FieldType::Date, "date fields are text-only");
            if f.ty.fixed_size().is_none() {
                assert!(len_of[i].is_some(), "variable field {} has no length pairing", f.name);
            }
        }
        Format { fields, separator: None, len_of }
    }

    fn check_pairs(fields: &[FieldDef], pairs: &[(usize, usize)]) -> Vec<Option<usize>> {
        let mut len_of = vec![None; fields.len()];
        for &(data, len) in pairs {
            assert!(len < data, "length field must precede its data field");
            assert!(fields[len].ty == FieldType::Int, "length field must be an int");
            len_of[data] = Some(len);
        }
        len_of
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field_type(&self, i: usize) -> FieldType {
        self.fields[i].ty
    }

    pub fn len_source(&self, i: usize) -> Option<usize> {
        self.len_of[i]
    }

    // -----------------------------------------------------------------------
    // Text encoding
    // -----------------------------------------------------------------------

    pub fn validate(&self, line: &str) -> bool {
        self.parse(line).is_some()
    }

    /// Parse one delimited line into a record. Any failure yields `None`;
    /// partial records are never exposed.
    pub fn parse(&self, line: &str) -> Option<Vec<Value>> {
        let sep = self.separator.expect("parse requires a text format");
        let parts: Vec<&str> = line.splitn(self.fields.len(), sep).collect();
        if parts.len() != self.fields.len() {
            return None;
        }
        let mut rec = Vec::with_capacity(self.fields.len());
        for (i, part) in parts.iter().enumerate() {
            rec.push(self.parse_field(i, part)?);
        }
        // Each paired length field must agree with its data field.
        for (i, len_src) in self.len_of.iter().enumerate() {
            if let Some(src) = len_src {
                let declared = match &rec[*src] {
                    Value::Int(n) => *n as usize,
                    _ => return None,
                };
                let actual = match &rec[i] {
                    Value::IntList(v) => v.len(),
                    Value::Str(s) | Value::OptStr(s) => s.len(),
                    _ => return None,
                };
                if declared != actual {
                    return None;
                }
            }
        }
        Some(rec)
    }

    fn parse_field(&self, i: usize, part: &str) -> Option<Value> {
        match self.fields[i].ty {
            FieldType::Bool => match part {
                "True" => Some(Value::Bool(true)),
                "False" => Some(Value::Bool(false)),
                _ => None,
            },
            FieldType::Kind => AccountKind::parse(part).map(Value::Kind),
            FieldType::Int => parse_int(part).map(Value::Int),
            FieldType::Double => None,
            FieldType::Str => {
                if part.is_empty() {
                    None
                } else {
                    Some(Value::Str(part.to_string()))
                }
            }
            FieldType::OptStr => Some(Value::OptStr(part.to_string())),
            FieldType::IntList => {
                let body = part.strip_prefix('[')?.strip_suffix(']')?;
                if body.is_empty() {
                    return Some(Value::IntList(Vec::new()));
                }
                let mut out = Vec::new();
                for item in body.split(", ") {
                    out.push(parse_int(item)?);
                }
                Some(Value::IntList(out))
            }
            FieldType::Date => Stamp::parse_date(part).map(Value::Date),
            FieldType::DateTime => Stamp::parse_date_time(part).map(Value::DateTime),
        }
    }

    /// Emit the record in its text form, separator between fields.
    pub fn print_text(&self, rec: &[Value], out: &mut String) {
        let sep = self.separator.expect("print_text requires a text format");
        for (i, v) in rec.iter().enumerate() {
            if i > 0 {
                out.push(sep);
            }
            print_field(v, out);
        }
    }

    // -----------------------------------------------------------------------
    // Binary encoding
    // -----------------------------------------------------------------------

    /// Append the record's self-delimiting binary form to `out`.
    pub fn write_binary(&self, rec: &[Value], out: &mut Vec<u8>) {
        debug_assert!(self.separator.is_none(), "write_binary requires a binary format");
        debug_assert_eq!(rec.len(), self.fields.len());
        for (i, len_src) in self.len_of.iter().enumerate() {
            if let Some(src) = len_src {
                let declared = rec[*src].as_u32() as usize;
                let actual = match &rec[i] {
                    Value::IntList(v) => v.len(),
                    Value::Str(s) | Value::OptStr(s) => s.len(),
                    _ => 0,
                };
                debug_assert_eq!(declared, actual, "length field disagrees with {}", self.fields[i].name);
            }
        }
        for v in rec {
            encode_value(v, out);
        }
    }

    /// Decode a full record at `offset`, returning it and the offset just
    /// past its last byte.
    pub fn read_binary(&self, cache: &PageCache, file: FileId, offset: u64) -> (Vec<Value>, u64) {
        debug_assert!(self.separator.is_none(), "read_binary requires a binary format");
        let mut rec: Vec<Value> = Vec::with_capacity(self.fields.len());
        let mut pos = offset;
        for i in 0..self.fields.len() {
            let len = self.len_of[i].map(|src| rec[src].as_u32()).unwrap_or(0);
            let (v, size) = self.read_field(cache, file, pos, i, len);
            rec.push(v);
            pos += size as u64;
        }
        (rec, pos)
    }

    /// Decode the single field `i` at `offset`. `len` is the value of the
    /// paired length field (ignored for fixed-size fields). Returns the value
    /// and its encoded size.
    pub fn read_field(&self, cache: &PageCache, file: FileId, offset: u64, i: usize, len: u32) -> (Value, usize) {
        match self.fields[i].ty {
            FieldType::Bool => {
                let mut b = [0u8; 1];
                cache.read_bytes(file, offset, &mut b);
                (Value::Bool(b[0] != 0), 1)
            }
            FieldType::Kind => {
                let mut b = [0u8; 1];
                cache.read_bytes(file, offset, &mut b);
                let kind = AccountKind::from_code(b[0]).expect("corrupt kind byte in record file");
                (Value::Kind(kind), 1)
            }
            FieldType::Int => (Value::Int(cache.u32_at(file, offset)), 4),
            FieldType::Double => {
                let mut b = [0u8; 8];
                cache.read_bytes(file, offset, &mut b);
                (Value::Double(f64::from_be_bytes(b)), 8)
            }
            FieldType::Str | FieldType::OptStr => {
                let mut buf = vec![0u8; len as usize];
                cache.read_bytes(file, offset, &mut buf);
                let text = String::from_utf8_lossy(&buf).into_owned();
                let v = if self.fields[i].ty == FieldType::Str {
                    Value::Str(text)
                } else {
                    Value::OptStr(text)
                };
                (v, len as usize)
            }
            FieldType::IntList => {
                let mut buf = vec![0u8; len as usize * 4];
                cache.read_bytes(file, offset, &mut buf);
                let ints = buf
                    .chunks_exact(4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                (Value::IntList(ints), len as usize * 4)
            }
            FieldType::DateTime => (Value::DateTime(Stamp::from_word(cache.u32_at(file, offset))), 4),
            FieldType::Date => unreachable!("date fields are text-only"),
        }
    }

    /// Encoded size of field `i` given its paired length.
    pub fn field_size(&self, i: usize, len: u32) -> usize {
        match self.fields[i].ty.fixed_size() {
            Some(n) => n,
            None => match self.fields[i].ty {
                FieldType::IntList => len as usize * 4,
                _ => len as usize,
            },
        }
    }
}

fn parse_int(part: &str) -> Option<u32> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

fn print_field(v: &Value, out: &mut String) {
    match v {
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Kind(k) => out.push_str(k.as_str()),
        Value::Int(n) => {
            let _ = write!(out, "{n}");
        }
        Value::Double(d) => {
            let _ = write!(out, "{d}");
        }
        Value::Str(s) | Value::OptStr(s) => out.push_str(s),
        Value::IntList(v) => {
            out.push('[');
            for (i, n) in v.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{n}");
            }
            out.push(']');
        }
        Value::Date(s) => out.push_str(&s.date_string()),
        Value::DateTime(s) => {
            let _ = write!(out, "{s}");
        }
    }
}

/// Append one value's binary form to `out`.
pub fn encode_value(v: &Value, out: &mut Vec<u8>) {
    match v {
        Value::Bool(b) => out.push(*b as u8),
        Value::Kind(k) => out.push(k.code()),
        Value::Int(n) => out.extend_from_slice(&n.to_be_bytes()),
        Value::Double(d) => out.extend_from_slice(&d.to_be_bytes()),
        Value::Str(s) | Value::OptStr(s) => out.extend_from_slice(s.as_bytes()),
        Value::IntList(v) => {
            for n in v {
                out.extend_from_slice(&n.to_be_bytes());
            }
        }
        Value::DateTime(s) => out.extend_from_slice(&s.raw().to_be_bytes()),
        Value::Date(_) => unreachable!("date fields are text-only"),
    }
}
