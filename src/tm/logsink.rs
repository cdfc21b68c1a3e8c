//! Bounded, rotating log sink.
//!
//! One sink per captured stream. Appends are serialized by the internal
//! mutex; rotation is the numbered scheme (`base` -> `base.1` -> `base.2`
//! ...), discarding beyond the backup budget. Reads address the logical
//! log: the concatenation of all retained rotated files plus the active
//! file, with offsets that keep growing across rotations.
//!
//! I/O failures never crash the caller. A failed write is recorded and
//! retrievable via [`LogSink::take_error`]; a failed rotation leaves the
//! current file in place and appends continue into it.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug)]
struct Inner {
    path: Option<PathBuf>,
    maxbytes: u64,
    backups: usize,
    file: Option<File>,
    /// Bytes in the active file (as written through this sink).
    cur: u64,
    /// Logical offset of the oldest retained byte: everything before it
    /// was discarded by rotation.
    dropped: u64,
    /// Total bytes ever appended (logical end of the log).
    appended: u64,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct LogSink {
    inner: Mutex<Inner>,
}

impl LogSink {
    /// A sink without a path discards bytes but keeps offsets moving, so
    /// tail/read stay consistent for streams with logging disabled.
    pub fn new(path: Option<PathBuf>, maxbytes: u64, backups: usize) -> Self {
        let mut inner = Inner {
            path,
            maxbytes,
            backups,
            file: None,
            cur: 0,
            dropped: 0,
            appended: 0,
            last_error: None,
        };
        // Pre-existing files from an earlier run count as already-appended
        // bytes so offsets start past them.
        inner.cur = inner
            .path
            .as_ref()
            .and_then(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0);
        inner.appended = Self::retained(&inner);
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .path
            .clone()
    }

    /// Appends bytes, rotating first when the active file would exceed
    /// `maxbytes`. Total: errors are swallowed and recorded.
    pub fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        g.appended += data.len() as u64;
        if g.path.is_none() {
            g.dropped = g.appended;
            return;
        }
        if g.maxbytes > 0 && g.cur > 0 && g.cur + data.len() as u64 > g.maxbytes {
            Self::rotate(&mut g);
        }
        if let Err(e) = Self::write(&mut g, data) {
            g.last_error = Some(e.to_string());
        }
    }

    /// Reads up to `length` bytes of the logical log starting at `offset`.
    /// Offsets before the oldest retained byte are clamped forward.
    pub fn read_log(&self, offset: u64, length: u64) -> String {
        let g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let start = g.dropped;
        let end = start + Self::retained(&g);
        let from = offset.clamp(start, end);
        let len = length.min(end - from);
        Self::read_concat(&g, from, len)
    }

    /// Tail semantics: returns up to `length` bytes ending at the current
    /// logical end. `new_offset` is the logical end (pass it back to keep
    /// following); `overflow` reports that the caller's offset was left
    /// behind, either by rotation discard or by more than `length` new
    /// bytes.
    pub fn tail_log(&self, offset: u64, length: u64) -> (String, u64, bool) {
        let g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let start = g.dropped;
        let end = start + Self::retained(&g);
        let want = end.saturating_sub(length).max(start);
        let overflow = offset < want || offset > end;
        let from = if overflow { want } else { offset };
        let data = Self::read_concat(&g, from, end - from);
        (data, end, overflow)
    }

    /// Deletes all backing files and resets offsets.
    pub fn clear(&self) {
        let mut g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        g.file = None;
        if let Some(path) = g.path.clone() {
            let _ = fs::remove_file(&path);
            for i in 1..=g.backups {
                let _ = fs::remove_file(Self::numbered(&path, i));
            }
        }
        g.cur = 0;
        g.dropped = 0;
        g.appended = 0;
    }

    /// Logical end of the log (total bytes ever appended).
    pub fn logical_end(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).appended
    }

    /// Last write/rotation error, if any, clearing it.
    pub fn take_error(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last_error
            .take()
    }

    fn numbered(base: &PathBuf, k: usize) -> PathBuf {
        PathBuf::from(format!("{}.{}", base.display(), k))
    }

    /// Retained files oldest to newest: `.backups` .. `.1`, then active.
    fn files(g: &Inner) -> Vec<PathBuf> {
        let mut v = Vec::new();
        if let Some(path) = g.path.as_ref() {
            for i in (1..=g.backups).rev() {
                v.push(Self::numbered(path, i));
            }
            v.push(path.clone());
        }
        v
    }

    fn retained(g: &Inner) -> u64 {
        Self::files(g)
            .iter()
            .filter_map(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }

    fn write(g: &mut Inner, data: &[u8]) -> std::io::Result<()> {
        if g.file.is_none() {
            let path = g.path.clone().expect("write requires a path");
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let f = OpenOptions::new().create(true).append(true).open(&path)?;
            g.cur = f.metadata()?.len();
            g.file = Some(f);
        }
        g.file.as_mut().expect("file opened above").write_all(data)?;
        g.cur += data.len() as u64;
        Ok(())
    }

    fn rotate(g: &mut Inner) {
        let Some(path) = g.path.clone() else { return };
        // Close before renaming; reopen happens on the next write.
        g.file = None;
        if g.backups == 0 {
            if fs::remove_file(&path).is_ok() {
                g.dropped += g.cur;
                g.cur = 0;
            }
            return;
        }
        let oldest = Self::numbered(&path, g.backups);
        if let Ok(md) = fs::metadata(&oldest) {
            if fs::remove_file(&oldest).is_ok() {
                g.dropped += md.len();
            }
        }
        for i in (1..g.backups).rev() {
            let from = Self::numbered(&path, i);
            if from.exists() {
                let _ = fs::rename(&from, Self::numbered(&path, i + 1));
            }
        }
        match fs::rename(&path, Self::numbered(&path, 1)) {
            Ok(()) => g.cur = 0,
            Err(e) => {
                // Keep writing into the oversized file rather than lose bytes.
                g.last_error = Some(format!("rotate {}: {e}", path.display()));
            }
        }
    }

    fn read_concat(g: &Inner, from_logical: u64, len: u64) -> String {
        let mut rel = from_logical.saturating_sub(g.dropped);
        let mut remaining = len;
        let mut out: Vec<u8> = Vec::new();
        for path in Self::files(g) {
            if remaining == 0 {
                break;
            }
            let Ok(md) = fs::metadata(&path) else { continue };
            let size = md.len();
            if rel >= size {
                rel -= size;
                continue;
            }
            if let Ok(mut f) = File::open(&path) {
                if f.seek(SeekFrom::Start(rel)).is_ok() {
                    let take = (size - rel).min(remaining);
                    let mut buf = vec![0u8; take as usize];
                    if f.read_exact(&mut buf).is_ok() {
                        out.extend_from_slice(&buf);
                        remaining -= take;
                    }
                }
            }
            rel = 0;
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sink_in(dir: &TempDir, maxbytes: u64, backups: usize) -> LogSink {
        LogSink::new(Some(dir.path().join("app.log")), maxbytes, backups)
    }

    #[test]
    fn append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let sink = sink_in(&dir, 0, 0);
        sink.append(b"hello ");
        sink.append(b"world");
        assert_eq!(sink.read_log(0, 100), "hello world");
        assert_eq!(sink.read_log(6, 5), "world");
        assert_eq!(sink.logical_end(), 11);
    }

    #[test]
    fn rotation_preserves_total_bytes() {
        let dir = TempDir::new().unwrap();
        let sink = sink_in(&dir, 10, 2);
        for _ in 0..10 {
            sink.append(b"abcdefgh"); // 8 bytes, rotates every write after the first
        }
        let base = dir.path().join("app.log");
        let mut on_disk = 0u64;
        for p in [
            base.clone(),
            PathBuf::from(format!("{}.1", base.display())),
            PathBuf::from(format!("{}.2", base.display())),
        ] {
            on_disk += fs::metadata(&p).map(|m| m.len()).unwrap_or(0);
        }
        let g = sink.inner.lock().unwrap();
        assert_eq!(g.dropped + on_disk, g.appended);
        assert_eq!(g.appended, 80);
    }

    #[test]
    fn read_spans_rotated_files() {
        let dir = TempDir::new().unwrap();
        let sink = sink_in(&dir, 6, 3);
        sink.append(b"11111");
        sink.append(b"22222");
        sink.append(b"33333");
        // Nothing dropped yet (3 backups); the logical log is contiguous.
        assert_eq!(sink.read_log(0, 15), "111112222233333");
        assert_eq!(sink.read_log(4, 3), "122");
    }

    #[test]
    fn tail_reports_overflow_when_left_behind() {
        let dir = TempDir::new().unwrap();
        let sink = sink_in(&dir, 6, 1);
        sink.append(b"aaaaa");
        sink.append(b"bbbbb");
        sink.append(b"ccccc"); // "aaaaa" is now discarded
        let (data, new_offset, overflow) = sink.tail_log(0, 100);
        assert!(overflow);
        assert_eq!(new_offset, 15);
        assert_eq!(data, "bbbbbccccc");

        // A caller that kept up sees no overflow.
        let (data, end2, overflow) = sink.tail_log(new_offset, 100);
        assert!(!overflow);
        assert_eq!(end2, new_offset);
        assert_eq!(data, "");
    }

    #[test]
    fn tail_returns_most_recent_window() {
        let dir = TempDir::new().unwrap();
        let sink = sink_in(&dir, 0, 0);
        sink.append(b"0123456789");
        let (data, end, overflow) = sink.tail_log(0, 4);
        assert_eq!(data, "6789");
        assert_eq!(end, 10);
        assert!(overflow); // more than 4 bytes beyond the caller's offset
    }

    #[test]
    fn clear_deletes_backing_files() {
        let dir = TempDir::new().unwrap();
        let sink = sink_in(&dir, 6, 2);
        sink.append(b"aaaaa");
        sink.append(b"bbbbb");
        sink.clear();
        assert_eq!(sink.logical_end(), 0);
        assert_eq!(sink.read_log(0, 100), "");
        assert!(!dir.path().join("app.log").exists());
        sink.append(b"fresh");
        assert_eq!(sink.read_log(0, 100), "fresh");
    }

    #[test]
    fn pathless_sink_discards_but_tracks_offsets() {
        let sink = LogSink::new(None, 0, 0);
        sink.append(b"dropped bytes");
        assert_eq!(sink.logical_end(), 13);
        let (data, end, overflow) = sink.tail_log(0, 100);
        assert_eq!(data, "");
        assert_eq!(end, 13);
        assert!(overflow);
    }
}
