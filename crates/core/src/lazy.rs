//! Lazy record view: a handle onto one binary record resident in a backing
//! file. Only fields that are actually touched are decoded (through the block
//! cache), and only fields explicitly set are written back on flush. A single
//! view is rebound from record to record when scanning a file.

use crate::cache::{FileId, PageCache};
use crate::datetime::Stamp;
use crate::format::{encode_value, Format, Value};
use crate::types::AccountKind;

pub struct Lazy<'f> {
    format: &'f Format,
    file: FileId,
    start: u64,
    values: Vec<Option<Value>>,
    altered: Vec<bool>,
    /// Absolute offset just past field `i`, filled in as fields are touched.
    ends: Vec<Option<u64>>,
}

impl<'f> Lazy<'f> {
    pub fn new(format: &'f Format, file: FileId, start: u64) -> Self {
        let n = format.field_count();
        Lazy {
            format,
            file,
            start,
            values: vec![None; n],
            altered: vec![false; n],
            ends: vec![None; n],
        }
    }

    /// Move the view to another record in the same file, dropping any loaded
    /// fields and prefix sums.
    pub fn rebind(&mut self, start: u64) {
        let file = self.file;
        self.rebind_to(file, start);
    }

    /// Move the view to a record in a (possibly) different file.
    pub fn rebind_to(&mut self, file: FileId, start: u64) {
        self.file = file;
        self.start = start;
        for v in &mut self.values {
            *v = None;
        }
        for a in &mut self.altered {
            *a = false;
        }
        for e in &mut self.ends {
            *e = None;
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    fn offset_of(&mut self, cache: &PageCache, i: usize) -> u64 {
        if i == 0 {
            self.start
        } else {
            self.end_of(cache, i - 1)
        }
    }

    fn end_of(&mut self, cache: &PageCache, i: usize) -> u64 {
        if let Some(e) = self.ends[i] {
            return e;
        }
        let off = self.offset_of(cache, i);
        let len = self.field_len(cache, i);
        let end = off + self.format.field_size(i, len) as u64;
        self.ends[i] = Some(end);
        end
    }

    fn field_len(&mut self, cache: &PageCache, i: usize) -> u32 {
        match self.format.len_source(i) {
            // Length fields precede their data field, so this recursion only
            // ever walks backwards.
            Some(src) => self.u32(cache, src),
            None => 0,
        }
    }

    /// Decode field `i` if not yet loaded and return it.
    pub fn get(&mut self, cache: &PageCache, i: usize) -> &Value {
        if self.values[i].is_none() {
            let len = self.field_len(cache, i);
            let off = self.offset_of(cache, i);
            let (v, size) = self.format.read_field(cache, self.file, off, i, len);
            self.ends[i] = Some(off + size as u64);
            self.values[i] = Some(v);
        }
        self.values[i].as_ref().unwrap()
    }

    pub fn u32(&mut self, cache: &PageCache, i: usize) -> u32 {
        self.get(cache, i).as_u32()
    }

    pub fn flag(&mut self, cache: &PageCache, i: usize) -> bool {
        self.get(cache, i).as_bool()
    }

    pub fn kind(&mut self, cache: &PageCache, i: usize) -> AccountKind {
        self.get(cache, i).as_kind()
    }

    pub fn stamp(&mut self, cache: &PageCache, i: usize) -> Stamp {
        self.get(cache, i).as_stamp()
    }

    pub fn text(&mut self, cache: &PageCache, i: usize) -> &str {
        self.get(cache, i).as_text()
    }

    pub fn ints(&mut self, cache: &PageCache, i: usize) -> &[u32] {
        self.get(cache, i).as_ints()
    }

    /// Replace field `i` in the view and mark it for write-back. Only
    /// fixed-size fields can be altered in place.
    pub fn set(&mut self, i: usize, v: Value) {
        debug_assert!(
            self.format.len_source(i).is_none(),
            "variable-length fields cannot be altered in place"
        );
        self.values[i] = Some(v);
        self.altered[i] = true;
    }

    /// Encode every altered field and write it at its offset through the
    /// cache. Alteration marks are cleared.
    pub fn flush_to_file(&mut self, cache: &PageCache) {
        for i in 0..self.format.field_count() {
            if !self.altered[i] {
                continue;
            }
            let off = self.offset_of(cache, i);
            let mut buf = Vec::new();
            encode_value(self.values[i].as_ref().unwrap(), &mut buf);
            cache.set_bytes(self.file, off, &buf);
            self.altered[i] = false;
        }
    }

    /// Offset just past this record, materializing all prefix sums. This is
    /// how a linear scan finds the next record.
    pub fn position_after(&mut self, cache: &PageCache) -> u64 {
        self.end_of(cache, self.format.field_count() - 1)
    }
}
