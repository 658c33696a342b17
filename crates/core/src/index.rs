//! External-memory indexer: a file of fixed-size `(key, value)` entries with
//! append-only inserts, an external k-way merge sort, optional grouping into
//! posting lists, and ordered lookups. All reads and writes of the index and
//! values files go through the block cache; only the sort's scratch run files
//! use plain buffered I/O.

use crate::cache::{FileId, PageCache};
use crate::lazy::Lazy;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

/// On-disk entry size: 8-byte key word + 8-byte value word, big-endian.
pub const ENTRY_SIZE: u64 = 16;

// ---------------------------------------------------------------------------
// Key ordering
// ---------------------------------------------------------------------------

/// Materialized comparison key, used while building and merging sorted runs
/// so the merge heap never re-reads a key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum SortKey {
    Word(u64),
    Bytes(Vec<u8>),
}

/// How an index interprets and orders its key words.
pub trait KeyOrder {
    /// Probe type for lookups: `u64` for embedded keys, lowercased bytes for
    /// indirect text keys.
    type Probe: ?Sized;

    fn sort_key(&self, cache: &PageCache, key: u64) -> SortKey;
    fn cmp_keys(&self, cache: &PageCache, a: u64, b: u64) -> Ordering;
    fn cmp_key_probe(&self, cache: &PageCache, key: u64, probe: &Self::Probe) -> Ordering;
}

/// Embedded keys: the key word itself is the comparison key (an id, or a
/// packed date whose unsigned order is chronological).
pub struct NumericKeys;

impl KeyOrder for NumericKeys {
    type Probe = u64;

    fn sort_key(&self, _cache: &PageCache, key: u64) -> SortKey {
        SortKey::Word(key)
    }

    fn cmp_keys(&self, _cache: &PageCache, a: u64, b: u64) -> Ordering {
        a.cmp(&b)
    }

    fn cmp_key_probe(&self, _cache: &PageCache, key: u64, probe: &u64) -> Ordering {
        key.cmp(probe)
    }
}

/// Indirect keys: the key word is the offset of a length-prefixed byte string
/// in `keys_file`; ordering is ASCII case-insensitive, read through the cache.
pub struct TextKeys {
    pub keys_file: FileId,
}

impl TextKeys {
    fn read_lower(&self, cache: &PageCache, offset: u64) -> Vec<u8> {
        let len = cache.u32_at(self.keys_file, offset) as usize;
        let mut buf = vec![0u8; len];
        cache.read_bytes(self.keys_file, offset + 4, &mut buf);
        buf.make_ascii_lowercase();
        buf
    }
}

impl KeyOrder for TextKeys {
    type Probe = [u8];

    fn sort_key(&self, cache: &PageCache, key: u64) -> SortKey {
        SortKey::Bytes(self.read_lower(cache, key))
    }

    fn cmp_keys(&self, cache: &PageCache, a: u64, b: u64) -> Ordering {
        self.read_lower(cache, a).cmp(&self.read_lower(cache, b))
    }

    /// `probe` must already be lowercased by the caller.
    fn cmp_key_probe(&self, cache: &PageCache, key: u64, probe: &[u8]) -> Ordering {
        self.read_lower(cache, key).as_slice().cmp(probe)
    }
}

// ---------------------------------------------------------------------------
// Merge machinery
// ---------------------------------------------------------------------------

struct MergeHead {
    key: SortKey,
    /// Run ordinal; ties on equal keys pop lower runs first, which keeps the
    /// overall sort stable with respect to insertion order.
    run: usize,
    raw: [u8; ENTRY_SIZE as usize],
}

impl PartialEq for MergeHead {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.run == other.run
    }
}

impl Eq for MergeHead {}

impl PartialOrd for MergeHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeHead {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key).then(self.run.cmp(&other.run))
    }
}

fn read_entry(reader: &mut impl Read) -> io::Result<Option<[u8; ENTRY_SIZE as usize]>> {
    let mut raw = [0u8; ENTRY_SIZE as usize];
    match reader.read_exact(&mut raw) {
        Ok(()) => Ok(Some(raw)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

fn entry_key(raw: &[u8; ENTRY_SIZE as usize]) -> u64 {
    u64::from_be_bytes(raw[..8].try_into().unwrap())
}

// ---------------------------------------------------------------------------
// Indexer
// ---------------------------------------------------------------------------

pub struct Indexer<O: KeyOrder> {
    path: PathBuf,
    file: FileId,
    /// Entries before grouping; distinct groups after.
    count: u64,
    grouped: bool,
    values_file: Option<FileId>,
    order: O,
}

impl<O: KeyOrder> Indexer<O> {
    /// Create an empty index file, truncating any previous one.
    pub fn create(cache: &PageCache, path: &Path, order: O) -> io::Result<Self> {
        let file = cache.create(path)?;
        Ok(Indexer {
            path: path.to_path_buf(),
            file,
            count: 0,
            grouped: false,
            values_file: None,
            order,
        })
    }

    /// Open an index (and its values file, when grouped) produced by an
    /// earlier run.
    pub fn open(cache: &PageCache, path: &Path, order: O, values_path: Option<&Path>) -> io::Result<Self> {
        let file = cache.register(path, false)?;
        let len = cache.file_len(file);
        if len % ENTRY_SIZE != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: length {} is not a whole number of entries", path.display(), len),
            ));
        }
        let values_file = match values_path {
            Some(p) => Some(cache.register(p, false)?),
            None => None,
        };
        Ok(Indexer {
            path: path.to_path_buf(),
            file,
            count: len / ENTRY_SIZE,
            grouped: values_file.is_some(),
            values_file,
            order,
        })
    }

    /// Entries (after grouping: distinct groups).
    pub fn element_count(&self) -> u64 {
        self.count
    }

    /// Append an unsorted entry. Single-writer only.
    pub fn insert(&mut self, cache: &PageCache, key: u64, value: u64) {
        debug_assert!(!self.grouped);
        let mut raw = [0u8; ENTRY_SIZE as usize];
        raw[..8].copy_from_slice(&key.to_be_bytes());
        raw[8..].copy_from_slice(&value.to_be_bytes());
        cache.set_bytes(self.file, self.count * ENTRY_SIZE, &raw);
        self.count += 1;
    }

    pub fn key_at(&self, cache: &PageCache, ord: u64) -> u64 {
        cache.u64_at(self.file, ord * ENTRY_SIZE)
    }

    pub fn value_at(&self, cache: &PageCache, ord: u64) -> u64 {
        cache.u64_at(self.file, ord * ENTRY_SIZE + 8)
    }

    // -----------------------------------------------------------------------
    // Sort
    // -----------------------------------------------------------------------

    /// External k-way merge sort. Runs of at most `buffer_bytes` worth of
    /// entries are sorted in memory and spilled to scratch files, then merged
    /// back into the index file through a min-heap. Stable with respect to
    /// insertion order.
    pub fn sort(&mut self, cache: &PageCache, buffer_bytes: usize) -> io::Result<()> {
        let started = Instant::now();
        let per_run = (buffer_bytes as u64 / ENTRY_SIZE).max(1);

        let mut runs: Vec<BufReader<File>> = Vec::new();
        let mut ord = 0u64;
        while ord < self.count {
            let n = per_run.min(self.count - ord);
            let mut chunk: Vec<(SortKey, [u8; ENTRY_SIZE as usize])> = Vec::with_capacity(n as usize);
            for i in ord..ord + n {
                let mut raw = [0u8; ENTRY_SIZE as usize];
                cache.read_bytes(self.file, i * ENTRY_SIZE, &mut raw);
                chunk.push((self.order.sort_key(cache, entry_key(&raw)), raw));
            }
            chunk.sort_by(|a, b| a.0.cmp(&b.0));
            let mut writer = BufWriter::new(tempfile::tempfile()?);
            for (_, raw) in &chunk {
                writer.write_all(raw)?;
            }
            let mut scratch = writer.into_inner().map_err(|e| e.into_error())?;
            scratch.seek(SeekFrom::Start(0))?;
            runs.push(BufReader::new(scratch));
            ord += n;
        }
        let run_count = runs.len();

        // The unsorted pages must not linger: a later write-back would
        // clobber the merged output.
        cache.refresh_file(self.file);

        let mut heap: BinaryHeap<Reverse<MergeHead>> = BinaryHeap::new();
        for (i, run) in runs.iter_mut().enumerate() {
            if let Some(raw) = read_entry(run)? {
                heap.push(Reverse(MergeHead {
                    key: self.order.sort_key(cache, entry_key(&raw)),
                    run: i,
                    raw,
                }));
            }
        }
        let mut out = 0u64;
        while let Some(Reverse(head)) = heap.pop() {
            cache.set_bytes(self.file, out * ENTRY_SIZE, &head.raw);
            out += 1;
            if let Some(raw) = read_entry(&mut runs[head.run])? {
                heap.push(Reverse(MergeHead {
                    key: self.order.sort_key(cache, entry_key(&raw)),
                    run: head.run,
                    raw,
                }));
            }
        }
        debug_assert_eq!(out, self.count);
        cache.flush_file(self.file);

        debug!(
            path = %self.path.display(),
            entries = self.count,
            runs = run_count,
            time_ms = started.elapsed().as_millis() as u64,
            "index sorted"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Group
    // -----------------------------------------------------------------------

    /// Collapse a sorted index into one entry per distinct key, writing a
    /// posting list per key (u32 count + u64 entries) to `values_path` and
    /// rewriting the index as `(key, posting offset)`. With `dedup`, each
    /// posting list is sorted and deduplicated first. Calling this on an
    /// unsorted index is a programmer error: a descending key panics.
    pub fn group(&mut self, cache: &PageCache, values_path: &Path, dedup: bool) -> io::Result<()> {
        assert!(!self.grouped, "index {} is already grouped", self.path.display());
        let started = Instant::now();
        let values = cache.create(values_path)?;

        let mut groups = 0u64;
        let mut values_pos = 0u64;
        let mut open: Option<(u64, SortKey)> = None;
        let mut members: Vec<u64> = Vec::new();

        for ord in 0..self.count {
            let key_word = self.key_at(cache, ord);
            let value = self.value_at(cache, ord);
            let skey = self.order.sort_key(cache, key_word);
            let same = match &open {
                Some((_, prev)) => {
                    if skey < *prev {
                        panic!(
                            "grouping unsorted index {}: key at ordinal {} sorts below its predecessor",
                            self.path.display(),
                            ord
                        );
                    }
                    skey == *prev
                }
                None => false,
            };
            if same {
                members.push(value);
                continue;
            }
            if let Some((prev_word, _)) = open.take() {
                values_pos += self.emit_group(cache, values, groups, prev_word, values_pos, &mut members, dedup);
                groups += 1;
            }
            open = Some((key_word, skey));
            members.push(value);
        }
        if let Some((word, _)) = open.take() {
            self.emit_group(cache, values, groups, word, values_pos, &mut members, dedup);
            groups += 1;
        }

        cache.flush_file(self.file);
        cache.set_len(self.file, groups * ENTRY_SIZE)?;
        cache.flush_file(values);

        self.count = groups;
        self.grouped = true;
        self.values_file = Some(values);

        debug!(
            path = %self.path.display(),
            groups,
            time_ms = started.elapsed().as_millis() as u64,
            "index grouped"
        );
        Ok(())
    }

    /// Write one posting list and its rewritten index entry. The rewrite is
    /// in place: group `g` lands at entry `g`, always strictly behind the
    /// read position. Returns the posting list's byte size.
    fn emit_group(
        &self,
        cache: &PageCache,
        values: FileId,
        group_ord: u64,
        key_word: u64,
        values_pos: u64,
        members: &mut Vec<u64>,
        dedup: bool,
    ) -> u64 {
        if dedup {
            members.sort_unstable();
            members.dedup();
        }
        let mut buf = Vec::with_capacity(4 + members.len() * 8);
        buf.extend_from_slice(&(members.len() as u32).to_be_bytes());
        for v in members.iter() {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        cache.set_bytes(values, values_pos, &buf);

        let mut raw = [0u8; ENTRY_SIZE as usize];
        raw[..8].copy_from_slice(&key_word.to_be_bytes());
        raw[8..].copy_from_slice(&values_pos.to_be_bytes());
        cache.set_bytes(self.file, group_ord * ENTRY_SIZE, &raw);

        let size = buf.len() as u64;
        members.clear();
        size
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Binary search: ordinal of an entry matching `probe`, if any.
    pub fn find(&self, cache: &PageCache, probe: &O::Probe) -> Option<u64> {
        let mut lo = 0u64;
        let mut hi = self.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.order.cmp_key_probe(cache, self.key_at(cache, mid), probe) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    /// Smallest ordinal whose key is `>= probe`, or `element_count()` if none.
    pub fn lower_bound(&self, cache: &PageCache, probe: &O::Probe) -> u64 {
        let mut lo = 0u64;
        let mut hi = self.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.order.cmp_key_probe(cache, self.key_at(cache, mid), probe) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    // -----------------------------------------------------------------------
    // View bridging and posting-list access
    // -----------------------------------------------------------------------

    /// Rebind `view` onto the record whose offset is stored as the value at
    /// `ord`.
    pub fn value_as_view(&self, cache: &PageCache, ord: u64, view: &mut Lazy<'_>) {
        view.rebind(self.value_at(cache, ord));
    }

    /// Look up `probe` and rebind `view` onto its record. Returns false when
    /// the key is absent.
    pub fn find_value_as_view(&self, cache: &PageCache, probe: &O::Probe, view: &mut Lazy<'_>) -> bool {
        match self.find(cache, probe) {
            Some(ord) => {
                self.value_as_view(cache, ord, view);
                true
            }
            None => false,
        }
    }

    pub fn group_size(&self, cache: &PageCache, group_offset: u64) -> u32 {
        cache.u32_at(self.values_file.expect("grouped index"), group_offset)
    }

    pub fn group_elem(&self, cache: &PageCache, group_offset: u64, i: u32) -> u64 {
        cache.u64_at(
            self.values_file.expect("grouped index"),
            group_offset + 4 + i as u64 * 8,
        )
    }

    pub fn group_elem_as_view(&self, cache: &PageCache, group_offset: u64, i: u32, view: &mut Lazy<'_>) {
        view.rebind(self.group_elem(cache, group_offset, i));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, PageCache) {
        (tempfile::tempdir().unwrap(), PageCache::new(64))
    }

    #[test]
    fn sort_orders_entries_even_with_tiny_runs() {
        let (dir, cache) = scratch();
        let mut idx = Indexer::create(&cache, &dir.path().join("n.indx"), NumericKeys).unwrap();
        // Insertion order deliberately scrambled; values mark insertion slot.
        let keys = [9u64, 3, 7, 3, 1, 9, 2, 8, 3, 0];
        for (i, &k) in keys.iter().enumerate() {
            idx.insert(&cache, k, i as u64);
        }
        // 32 bytes per run = 2 entries, forcing a 5-way merge.
        idx.sort(&cache, 32).unwrap();

        assert_eq!(idx.element_count(), keys.len() as u64);
        for i in 1..idx.element_count() {
            assert!(idx.key_at(&cache, i - 1) <= idx.key_at(&cache, i));
        }
        // Stability: the three key-3 entries keep insertion order 1, 3, 8.
        let first3 = idx.lower_bound(&cache, &3);
        assert_eq!(idx.value_at(&cache, first3), 1);
        assert_eq!(idx.value_at(&cache, first3 + 1), 3);
        assert_eq!(idx.value_at(&cache, first3 + 2), 8);
    }

    #[test]
    fn find_and_lower_bound() {
        let (dir, cache) = scratch();
        let mut idx = Indexer::create(&cache, &dir.path().join("n.indx"), NumericKeys).unwrap();
        for k in [10u64, 20, 30, 40] {
            idx.insert(&cache, k, k * 100);
        }
        idx.sort(&cache, 1 << 20).unwrap();

        assert_eq!(idx.find(&cache, &20), Some(1));
        assert_eq!(idx.find(&cache, &25), None);
        assert_eq!(idx.lower_bound(&cache, &0), 0);
        assert_eq!(idx.lower_bound(&cache, &20), 1);
        assert_eq!(idx.lower_bound(&cache, &21), 2);
        assert_eq!(idx.lower_bound(&cache, &99), 4);
        assert_eq!(idx.value_at(&cache, 1), 2000);
    }

    #[test]
    fn group_builds_posting_lists() {
        let (dir, cache) = scratch();
        let mut idx = Indexer::create(&cache, &dir.path().join("g.indx"), NumericKeys).unwrap();
        for (k, v) in [(5u64, 50u64), (1, 11), (5, 51), (1, 12), (1, 11), (9, 90)] {
            idx.insert(&cache, k, v);
        }
        idx.sort(&cache, 1 << 20).unwrap();
        idx.group(&cache, &dir.path().join("g.dat"), false).unwrap();

        assert_eq!(idx.element_count(), 3);
        // Strictly ascending distinct keys.
        assert_eq!(idx.key_at(&cache, 0), 1);
        assert_eq!(idx.key_at(&cache, 1), 5);
        assert_eq!(idx.key_at(&cache, 2), 9);

        let g1 = idx.value_at(&cache, 0);
        assert_eq!(idx.group_size(&cache, g1), 3);
        assert_eq!(
            (0..3).map(|i| idx.group_elem(&cache, g1, i)).collect::<Vec<_>>(),
            vec![11, 12, 11]
        );
        let g9 = idx.value_at(&cache, 2);
        assert_eq!(idx.group_size(&cache, g9), 1);
        assert_eq!(idx.group_elem(&cache, g9, 0), 90);
    }

    #[test]
    fn group_with_dedup_sorts_and_dedups_members() {
        let (dir, cache) = scratch();
        let mut idx = Indexer::create(&cache, &dir.path().join("d.indx"), NumericKeys).unwrap();
        for (k, v) in [(2u64, 9u64), (2, 3), (2, 9), (2, 1)] {
            idx.insert(&cache, k, v);
        }
        idx.sort(&cache, 1 << 20).unwrap();
        idx.group(&cache, &dir.path().join("d.dat"), true).unwrap();

        assert_eq!(idx.element_count(), 1);
        let g = idx.value_at(&cache, 0);
        assert_eq!(idx.group_size(&cache, g), 3);
        assert_eq!(
            (0..3).map(|i| idx.group_elem(&cache, g, i)).collect::<Vec<_>>(),
            vec![1, 3, 9]
        );
    }

    #[test]
    #[should_panic(expected = "grouping unsorted index")]
    fn grouping_an_unsorted_index_panics() {
        let (dir, cache) = scratch();
        let mut idx = Indexer::create(&cache, &dir.path().join("u.indx"), NumericKeys).unwrap();
        for k in [5u64, 2, 7] {
            idx.insert(&cache, k, 0);
        }
        let _ = idx.group(&cache, &dir.path().join("u.dat"), false);
    }

    #[test]
    fn text_keys_compare_case_insensitively_through_the_cache() {
        let (dir, cache) = scratch();

        // Keys file: length-prefixed strings at known offsets.
        let keys_path = dir.path().join("keys.dat");
        let keys = cache.create(&keys_path).unwrap();
        let mut offsets = Vec::new();
        let mut pos = 0u64;
        for name in ["Rust", "c", "PYTHON", "C", "rust"] {
            offsets.push(pos);
            let mut buf = Vec::new();
            buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
            buf.extend_from_slice(name.as_bytes());
            cache.set_bytes(keys, pos, &buf);
            pos += buf.len() as u64;
        }

        let mut idx = Indexer::create(
            &cache,
            &dir.path().join("lang.indx"),
            TextKeys { keys_file: keys },
        )
        .unwrap();
        for (i, off) in offsets.iter().enumerate() {
            idx.insert(&cache, *off, i as u64);
        }
        idx.sort(&cache, 1 << 20).unwrap();
        idx.group(&cache, &dir.path().join("lang.dat"), false).unwrap();

        // "Rust"/"rust", "c"/"C", "PYTHON" collapse case-insensitively.
        assert_eq!(idx.element_count(), 3);
        let rust = idx.find(&cache, b"rust".as_slice()).unwrap();
        let g = idx.value_at(&cache, rust);
        assert_eq!(idx.group_size(&cache, g), 2);
        assert!(idx.find(&cache, b"Rust".as_slice()).is_none(), "probes must be lowercased");
        assert!(idx.find(&cache, b"go".as_slice()).is_none());
    }
}
