//! Page-granular block cache: a fixed number of 1 KiB frames over
//! registered files, LRU eviction with write-back. All record and index
//! reads in the engine go through here, which is what keeps the resident
//! set bounded regardless of how large the data files grow.
//!
//! Locking order: the global index lock (frame map + LRU list) is always
//! released before a frame lock is taken, and neither is held across the
//! underlying pread/pwrite. Do not reorder.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::{debug, warn};

pub const PAGE_SIZE: usize = 1024;
const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;
const NIL: usize = usize::MAX;

/// Handle to a file registered with the cache. Passing a handle that was
/// never issued by this cache is a programmer error and panics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FileId(u32);

struct FileSlot {
    file: File,
    /// Logical length: how many bytes of the file are meaningful. Writes
    /// through the cache extend it; write-back never pads past it.
    len: AtomicU64,
}

struct FrameData {
    /// Identity of the bytes currently in `data` (None = empty frame).
    tag: Option<(FileId, u64)>,
    loaded: bool,
    dirty: bool,
    data: Box<[u8]>,
}

/// Frame map + LRU list, guarded by the one global lock.
struct CacheIndex {
    map: HashMap<(FileId, u64), usize>,
    /// Page each frame is assigned to hold, from the map's point of view.
    assigned: Vec<Option<(FileId, u64)>>,
    prev: Vec<usize>,
    next: Vec<usize>,
    head: usize,
    tail: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheIndex {
    fn unlink(&mut self, i: usize) {
        let p = self.prev[i];
        let n = self.next[i];
        if p != NIL {
            self.next[p] = n;
        } else {
            self.head = n;
        }
        if n != NIL {
            self.prev[n] = p;
        } else {
            self.tail = p;
        }
    }

    fn push_front(&mut self, i: usize) {
        self.prev[i] = NIL;
        self.next[i] = self.head;
        if self.head != NIL {
            self.prev[self.head] = i;
        }
        self.head = i;
        if self.tail == NIL {
            self.tail = i;
        }
    }

    fn push_back(&mut self, i: usize) {
        self.next[i] = NIL;
        self.prev[i] = self.tail;
        if self.tail != NIL {
            self.next[self.tail] = i;
        }
        self.tail = i;
        if self.head == NIL {
            self.head = i;
        }
    }

    fn touch(&mut self, i: usize) {
        if self.head != i {
            self.unlink(i);
            self.push_front(i);
        }
    }

    fn demote(&mut self, i: usize) {
        if self.tail != i {
            self.unlink(i);
            self.push_back(i);
        }
    }
}

/// Hit/miss/eviction counters, cumulative since construction.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct PageCache {
    frames: Vec<Mutex<FrameData>>,
    index: Mutex<CacheIndex>,
    files: RwLock<Vec<FileSlot>>,
}

impl PageCache {
    pub fn new(frame_count: usize) -> Self {
        let frame_count = frame_count.max(1);
        let frames = (0..frame_count)
            .map(|_| {
                Mutex::new(FrameData {
                    tag: None,
                    loaded: false,
                    dirty: false,
                    data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
                })
            })
            .collect();
        let mut index = CacheIndex {
            map: HashMap::new(),
            assigned: vec![None; frame_count],
            prev: vec![NIL; frame_count],
            next: vec![NIL; frame_count],
            head: NIL,
            tail: NIL,
            hits: 0,
            misses: 0,
            evictions: 0,
        };
        for i in 0..frame_count {
            index.push_back(i);
        }
        PageCache {
            frames,
            index: Mutex::new(index),
            files: RwLock::new(Vec::new()),
        }
    }

    // -----------------------------------------------------------------------
    // File registry
    // -----------------------------------------------------------------------

    /// Open an existing file and register it with the cache.
    pub fn register(&self, path: &Path, writable: bool) -> io::Result<FileId> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let len = file.metadata()?.len();
        self.add_slot(file, len)
    }

    /// Create (or truncate) a file and register it read-write.
    pub fn create(&self, path: &Path) -> io::Result<FileId> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        self.add_slot(file, 0)
    }

    fn add_slot(&self, file: File, len: u64) -> io::Result<FileId> {
        let mut files = self.files.write().unwrap();
        let id = FileId(files.len() as u32);
        files.push(FileSlot { file, len: AtomicU64::new(len) });
        Ok(id)
    }

    /// Logical length of a registered file, including unflushed writes.
    pub fn file_len(&self, file: FileId) -> u64 {
        self.files.read().unwrap()[file.0 as usize].len.load(Ordering::Acquire)
    }

    /// Truncate a registered file and drop its cached pages. Pending writes
    /// past the new length are discarded.
    pub fn set_len(&self, file: FileId, len: u64) -> io::Result<()> {
        self.refresh_file(file);
        let files = self.files.read().unwrap();
        let slot = &files[file.0 as usize];
        slot.file.set_len(len)?;
        slot.len.store(len, Ordering::Release);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Frame acquisition
    // -----------------------------------------------------------------------

    fn with_frame<R>(&self, file: FileId, aligned: u64, f: impl FnOnce(&mut FrameData) -> R) -> R {
        debug_assert_eq!(aligned & PAGE_MASK, 0);
        let want = (file, aligned);
        let idx = {
            let mut ix = self.index.lock().unwrap();
            match ix.map.get(&want).copied() {
                Some(i) => {
                    ix.hits += 1;
                    ix.touch(i);
                    i
                }
                None => {
                    ix.misses += 1;
                    let victim = ix.tail;
                    if let Some(old) = ix.assigned[victim].take() {
                        ix.map.remove(&old);
                        ix.evictions += 1;
                    }
                    ix.assigned[victim] = Some(want);
                    ix.map.insert(want, victim);
                    ix.touch(victim);
                    victim
                }
            }
        };
        // Global lock dropped; frame work happens under the frame lock only.
        let mut frame = self.frames[idx].lock().unwrap();
        if frame.tag != Some(want) {
            if frame.dirty {
                if let Some((old_file, old_offset)) = frame.tag {
                    self.store_page(old_file, old_offset, &frame.data);
                }
            }
            frame.tag = Some(want);
            frame.loaded = false;
            frame.dirty = false;
        }
        if !frame.loaded {
            self.load_page(file, aligned, &mut frame.data);
            frame.loaded = true;
        }
        f(&mut frame)
    }

    fn load_page(&self, file: FileId, offset: u64, buf: &mut [u8]) {
        let files = self.files.read().unwrap();
        let slot = &files[file.0 as usize];
        let mut read = 0usize;
        while read < buf.len() {
            match slot.file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(offset, error = %e, "page read failed, padding with zeros");
                    break;
                }
            }
        }
        // End of file inside the page is not an error: zero sentinel.
        buf[read..].fill(0);
    }

    /// Write a page back, trimmed to the file's logical length so write-back
    /// never pads a file out to a page boundary. Returns false on failure.
    fn store_page(&self, file: FileId, offset: u64, data: &[u8]) -> bool {
        let files = self.files.read().unwrap();
        let slot = &files[file.0 as usize];
        let len = slot.len.load(Ordering::Acquire);
        if offset >= len {
            return true;
        }
        let n = (len - offset).min(PAGE_SIZE as u64) as usize;
        match slot.file.write_all_at(&data[..n], offset) {
            Ok(()) => true,
            Err(e) => {
                warn!(offset, error = %e, "page write-back failed, frame stays dirty");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Byte-level operations
    // -----------------------------------------------------------------------

    /// Copy exactly `buf.len()` bytes starting at `offset`. Bytes past the
    /// end of the file read as zero.
    pub fn read_bytes(&self, file: FileId, offset: u64, buf: &mut [u8]) {
        let total = buf.len();
        let mut done = 0usize;
        while done < total {
            let pos = offset + done as u64;
            let aligned = pos & !PAGE_MASK;
            let start = (pos - aligned) as usize;
            let n = (PAGE_SIZE - start).min(total - done);
            self.with_frame(file, aligned, |fr| {
                buf[done..done + n].copy_from_slice(&fr.data[start..start + n]);
            });
            done += n;
        }
    }

    /// Write `data` at `offset`, marking every touched frame dirty and
    /// extending the file's logical length. No fsync is issued.
    pub fn set_bytes(&self, file: FileId, offset: u64, data: &[u8]) {
        let total = data.len();
        // Extend the logical length first: an eviction in the middle of this
        // write must not trim the already-written part of the span.
        {
            let files = self.files.read().unwrap();
            files[file.0 as usize].len.fetch_max(offset + total as u64, Ordering::AcqRel);
        }
        let mut done = 0usize;
        while done < total {
            let pos = offset + done as u64;
            let aligned = pos & !PAGE_MASK;
            let start = (pos - aligned) as usize;
            let n = (PAGE_SIZE - start).min(total - done);
            self.with_frame(file, aligned, |fr| {
                fr.data[start..start + n].copy_from_slice(&data[done..done + n]);
                fr.dirty = true;
            });
            done += n;
        }
    }

    /// Big-endian u32 at `offset` (all persistent multi-byte scalars are
    /// big-endian for file portability).
    pub fn u32_at(&self, file: FileId, offset: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(file, offset, &mut buf);
        u32::from_be_bytes(buf)
    }

    /// Big-endian u64 at `offset`.
    pub fn u64_at(&self, file: FileId, offset: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(file, offset, &mut buf);
        u64::from_be_bytes(buf)
    }

    /// Copy bytes from `offset` until the first newline, the first zero byte
    /// (end-of-file sentinel), or `max - 1` bytes, whichever comes first. A
    /// single carriage return before the newline is dropped. Returns the line
    /// and the offset to continue reading from; a return offset equal to the
    /// input offset plus the line length (no newline consumed) means the scan
    /// stopped on the zero sentinel or the cap.
    pub fn read_line(&self, file: FileId, offset: u64, max: usize) -> (Vec<u8>, u64) {
        let mut out = Vec::new();
        let mut pos = offset;
        if max == 0 {
            return (out, pos);
        }
        let mut page = vec![0u8; PAGE_SIZE];
        loop {
            let aligned = pos & !PAGE_MASK;
            let start = (pos - aligned) as usize;
            self.with_frame(file, aligned, |fr| page.copy_from_slice(&fr.data));
            for &b in &page[start..] {
                if b == 0 {
                    return (out, pos);
                }
                if b == b'\n' {
                    if out.last() == Some(&b'\r') {
                        out.pop();
                    }
                    return (out, pos + 1);
                }
                if out.len() + 1 >= max {
                    return (out, pos);
                }
                out.push(b);
                pos += 1;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Flush / invalidate
    // -----------------------------------------------------------------------

    /// Write back dirty frames belonging to `file`.
    pub fn flush_file(&self, file: FileId) {
        self.flush_where(Some(file));
    }

    /// Write back every dirty frame.
    pub fn flush_all(&self) {
        self.flush_where(None);
        let s = self.stats();
        debug!(hits = s.hits, misses = s.misses, evictions = s.evictions, "cache flushed");
    }

    fn flush_where(&self, filter: Option<FileId>) {
        for slot in &self.frames {
            let mut frame = slot.lock().unwrap();
            if !frame.dirty {
                continue;
            }
            if let Some((f, offset)) = frame.tag {
                if filter.map_or(true, |want| want == f) && self.store_page(f, offset, &frame.data) {
                    frame.dirty = false;
                }
            }
        }
    }

    /// Drop frames belonging to `file` without writing them back: pending
    /// writes to that file are discarded.
    pub fn refresh_file(&self, file: FileId) {
        self.refresh_where(Some(file));
    }

    /// Drop every frame without write-back.
    pub fn refresh_all(&self) {
        self.refresh_where(None);
    }

    fn refresh_where(&self, filter: Option<FileId>) {
        let victims: Vec<usize> = {
            let mut ix = self.index.lock().unwrap();
            let mut v = Vec::new();
            for i in 0..self.frames.len() {
                if let Some((f, _)) = ix.assigned[i] {
                    if filter.map_or(true, |want| want == f) {
                        let key = ix.assigned[i].take().unwrap();
                        ix.map.remove(&key);
                        ix.demote(i);
                        v.push(i);
                    }
                }
            }
            v
        };
        for i in victims {
            let mut frame = self.frames[i].lock().unwrap();
            if let Some((f, _)) = frame.tag {
                if filter.map_or(true, |want| want == f) {
                    frame.tag = None;
                    frame.loaded = false;
                    frame.dirty = false;
                }
            }
        }
    }

    /// Flush then evict: the file's cached state reaches disk and the frames
    /// are released.
    pub fn clear_file(&self, file: FileId) {
        self.flush_file(file);
        self.refresh_file(file);
    }

    pub fn clear_all(&self) {
        self.flush_where(None);
        self.refresh_where(None);
    }

    pub fn stats(&self) -> CacheStats {
        let ix = self.index.lock().unwrap();
        CacheStats { hits: ix.hits, misses: ix.misses, evictions: ix.evictions }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(content: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        (dir, path)
    }

    #[test]
    fn reads_match_direct_reads_at_any_capacity() {
        // 5 pages plus a partial tail, patterned bytes.
        let content: Vec<u8> = (0..5 * PAGE_SIZE + 300).map(|i| (i % 251) as u8).collect();
        let (_dir, path) = temp_file(&content);

        for frames in [1, 8, 1024] {
            let cache = PageCache::new(frames);
            let id = cache.register(&path, false).unwrap();
            // Spans chosen to hit page interiors, boundaries, and crossings.
            for (offset, len) in [(0, 10), (1000, 48), (1023, 2), (1024, 1024), (4000, 1400), (0, content.len())] {
                let mut buf = vec![0u8; len];
                cache.read_bytes(id, offset as u64, &mut buf);
                assert_eq!(&buf[..], &content[offset..offset + len], "frames={frames} offset={offset} len={len}");
            }
        }
    }

    #[test]
    fn reads_past_end_of_file_are_zero() {
        let (_dir, path) = temp_file(b"short");
        let cache = PageCache::new(4);
        let id = cache.register(&path, false).unwrap();
        let mut buf = [0xffu8; 16];
        cache.read_bytes(id, 0, &mut buf);
        assert_eq!(&buf[..5], b"short");
        assert!(buf[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn write_back_is_visible_to_fresh_reader() {
        let (_dir, path) = temp_file(&[0u8; 3000]);
        let cache = PageCache::new(8);
        let id = cache.register(&path, true).unwrap();
        cache.set_bytes(id, 1020, b"spans a page boundary");
        cache.flush_file(id);
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(&on_disk[1020..1020 + 21], b"spans a page boundary");
    }

    #[test]
    fn eviction_writes_back_dirty_frames() {
        let (_dir, path) = temp_file(&[0u8; 8 * PAGE_SIZE]);
        let cache = PageCache::new(2);
        let id = cache.register(&path, true).unwrap();
        for page in 0..8u64 {
            cache.set_bytes(id, page * PAGE_SIZE as u64, &[page as u8 + 1; 4]);
        }
        cache.flush_file(id);
        let on_disk = std::fs::read(&path).unwrap();
        for page in 0..8usize {
            assert_eq!(on_disk[page * PAGE_SIZE], page as u8 + 1);
        }
        assert!(cache.stats().evictions > 0);
    }

    #[test]
    fn logical_length_is_not_page_padded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.bin");
        let cache = PageCache::new(4);
        let id = cache.create(&path).unwrap();
        cache.set_bytes(id, 0, &[7u8; 10]);
        cache.flush_file(id);
        assert_eq!(cache.file_len(id), 10);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);
    }

    #[test]
    fn refresh_discards_pending_writes() {
        let (_dir, path) = temp_file(b"original");
        let cache = PageCache::new(4);
        let id = cache.register(&path, true).unwrap();
        cache.set_bytes(id, 0, b"clobber!");
        cache.refresh_file(id);
        cache.flush_file(id);
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
        // And a fresh read through the cache sees the disk content again.
        let mut buf = [0u8; 8];
        cache.read_bytes(id, 0, &mut buf);
        assert_eq!(&buf, b"original");
    }

    #[test]
    fn big_endian_integer_helpers() {
        let (_dir, path) = temp_file(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        let cache = PageCache::new(4);
        let id = cache.register(&path, false).unwrap();
        assert_eq!(cache.u32_at(id, 0), 0x0102_0304);
        assert_eq!(cache.u64_at(id, 0), 0x0102_0304_0506_0708);
    }

    #[test]
    fn read_line_handles_terminators() {
        let (_dir, path) = temp_file(b"plain\r\nnext line\nlast");
        let cache = PageCache::new(4);
        let id = cache.register(&path, false).unwrap();

        let (line, next) = cache.read_line(id, 0, 4096);
        assert_eq!(line, b"plain");
        assert_eq!(next, 7);

        let (line, next) = cache.read_line(id, next, 4096);
        assert_eq!(line, b"next line");
        assert_eq!(next, 17);

        // Unterminated tail stops on the zero sentinel, offset not advanced past it.
        let (line, next) = cache.read_line(id, next, 4096);
        assert_eq!(line, b"last");
        assert_eq!(next, 21);
    }

    #[test]
    fn read_line_caps_at_max() {
        let (_dir, path) = temp_file(b"abcdefghij\n");
        let cache = PageCache::new(4);
        let id = cache.register(&path, false).unwrap();
        let (line, next) = cache.read_line(id, 0, 5);
        assert_eq!(line, b"abcd");
        assert_eq!(next, 4);
    }

    #[test]
    fn read_line_crosses_pages() {
        let mut content = vec![b'x'; PAGE_SIZE + 10];
        content.push(b'\n');
        let (_dir, path) = temp_file(&content);
        let cache = PageCache::new(4);
        let id = cache.register(&path, false).unwrap();
        let (line, next) = cache.read_line(id, 0, 1 << 20);
        assert_eq!(line.len(), PAGE_SIZE + 10);
        assert_eq!(next, content.len() as u64);
    }

    #[test]
    fn set_len_truncates_and_invalidates() {
        let (_dir, path) = temp_file(&[1u8; 2048]);
        let cache = PageCache::new(4);
        let id = cache.register(&path, true).unwrap();
        cache.set_bytes(id, 2000, &[9u8; 8]);
        cache.set_len(id, 100).unwrap();
        assert_eq!(cache.file_len(id), 100);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
        // Reads past the truncation point see zeros.
        let mut buf = [0xaau8; 4];
        cache.read_bytes(id, 200, &mut buf);
        assert_eq!(buf, [0, 0, 0, 0]);
    }
}
