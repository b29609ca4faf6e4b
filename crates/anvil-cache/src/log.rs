use anvil_core::{AnvilError, Digest, ExecPath, Result};
use rustc_hash::FxHashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const MAGIC: &[u8; 4] = b"BACH";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: u64 = 16;

/// One persisted action-cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRecord {
    pub fingerprint: Digest,
    pub action_name: String,
    pub inputs_digest: Digest,
    pub outputs: Vec<(ExecPath, Digest)>,
    pub timestamp_nanos: u64,
}

impl CachedRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(96 + self.outputs.len() * 48);
        buf.extend_from_slice(self.fingerprint.as_bytes());
        buf.extend_from_slice(&(self.action_name.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.action_name.as_bytes());
        buf.extend_from_slice(self.inputs_digest.as_bytes());
        buf.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for (path, digest) in &self.outputs {
            let p = path.as_str().as_bytes();
            buf.extend_from_slice(&(p.len() as u32).to_le_bytes());
            buf.extend_from_slice(p);
            buf.extend_from_slice(digest.as_bytes());
        }
        buf.extend_from_slice(&self.timestamp_nanos.to_le_bytes());
        buf
    }

    fn decode(reader: &mut SliceReader<'_>) -> Result<CachedRecord> {
        let fingerprint = reader.digest()?;
        let name_len = reader.u32()? as usize;
        let action_name = String::from_utf8(reader.bytes(name_len)?.to_vec())
            .map_err(|e| AnvilError::CacheCorrupt(format!("record name not utf-8: {e}")))?;
        let inputs_digest = reader.digest()?;
        let outputs_count = reader.u32()? as usize;
        let mut outputs = Vec::with_capacity(outputs_count);
        for _ in 0..outputs_count {
            let path_len = reader.u32()? as usize;
            let raw = String::from_utf8(reader.bytes(path_len)?.to_vec())
                .map_err(|e| AnvilError::CacheCorrupt(format!("output path not utf-8: {e}")))?;
            let path = ExecPath::new(raw).map_err(AnvilError::CacheCorrupt)?;
            outputs.push((path, reader.digest()?));
        }
        let timestamp_nanos = reader.u64()?;
        Ok(CachedRecord {
            fingerprint,
            action_name,
            inputs_digest,
            outputs,
            timestamp_nanos,
        })
    }
}

struct SliceReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(AnvilError::CacheCorrupt(format!(
                "truncated record at byte {}",
                self.pos
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    fn digest(&mut self) -> Result<Digest> {
        let b = self.bytes(32)?;
        Ok(Digest(b.try_into().unwrap()))
    }
}

/// Exclusive advisory lock serializing writers, held for the duration of an
/// append or compaction. Implemented as a create-new lock file; the guard
/// removes it on drop.
struct WriterLock {
    path: PathBuf,
}

impl WriterLock {
    fn acquire(path: PathBuf) -> Result<WriterLock> {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    let _ = write!(f, "{}", std::process::id());
                    return Ok(WriterLock { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if std::time::Instant::now() >= deadline {
                        return Err(AnvilError::Io(format!(
                            "timed out waiting for cache writer lock {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Append-with-compaction log of `(fingerprint, record)` entries with an
/// append-only `.index` sidecar mapping fingerprint → file offset.
///
/// A later record for the same fingerprint supersedes the earlier one; the
/// superseded bytes are garbage until `compact` rewrites the log.
pub struct CacheLog {
    path: PathBuf,
    index: FxHashMap<Digest, u64>,
    garbage: usize,
}

impl CacheLog {
    pub fn open(path: &Path) -> Result<CacheLog> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            let mut f = File::create(path)?;
            f.write_all(MAGIC)?;
            f.write_all(&FORMAT_VERSION.to_le_bytes())?;
            f.write_all(&[0u8; 8])?;
            f.sync_all()?;
        }
        let mut log = CacheLog {
            path: path.to_path_buf(),
            index: FxHashMap::default(),
            garbage: 0,
        };
        log.load_index()?;
        Ok(log)
    }

    fn index_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".index");
        self.path.with_file_name(name)
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn load_index(&mut self) -> Result<()> {
        self.index.clear();
        self.garbage = 0;
        let log_len = std::fs::metadata(&self.path)?.len();
        if let Ok(raw) = std::fs::read(self.index_path()) {
            if raw.len() % 40 == 0 {
                let mut ok = true;
                let mut index = FxHashMap::default();
                let mut garbage = 0usize;
                for chunk in raw.chunks_exact(40) {
                    let fp = Digest(chunk[..32].try_into().unwrap());
                    let offset = u64::from_le_bytes(chunk[32..].try_into().unwrap());
                    if offset < HEADER_LEN || offset >= log_len {
                        ok = false;
                        break;
                    }
                    if index.insert(fp, offset).is_some() {
                        garbage += 1;
                    }
                }
                if ok {
                    self.index = index;
                    self.garbage = garbage;
                    return Ok(());
                }
                warn!("cache index sidecar inconsistent; rebuilding from log");
            }
        }
        self.rebuild_index_from_log()
    }

    fn rebuild_index_from_log(&mut self) -> Result<()> {
        let data = std::fs::read(&self.path)?;
        self.check_header(&data)?;
        let mut reader = SliceReader::new(&data);
        reader.pos = HEADER_LEN as usize;
        self.index.clear();
        self.garbage = 0;
        while reader.remaining() > 0 {
            let offset = reader.pos as u64;
            let record = CachedRecord::decode(&mut reader)?;
            if self.index.insert(record.fingerprint, offset).is_some() {
                self.garbage += 1;
            }
        }
        self.write_index_sidecar()?;
        debug!(entries = self.index.len(), "cache index rebuilt from log");
        Ok(())
    }

    fn check_header(&self, data: &[u8]) -> Result<()> {
        if data.len() < HEADER_LEN as usize {
            return Err(AnvilError::CacheCorrupt("log shorter than header".to_string()));
        }
        if &data[..4] != MAGIC {
            return Err(AnvilError::CacheCorrupt("bad magic".to_string()));
        }
        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(AnvilError::CacheCorrupt(format!(
                "unsupported cache format version {version}"
            )));
        }
        Ok(())
    }

    fn write_index_sidecar(&self) -> Result<()> {
        let mut buf = Vec::with_capacity(self.index.len() * 40);
        for (fp, offset) in &self.index {
            buf.extend_from_slice(fp.as_bytes());
            buf.extend_from_slice(&offset.to_le_bytes());
        }
        let tmp = self.index_path().with_extension("index.tmp");
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, self.index_path())?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn garbage(&self) -> usize {
        self.garbage
    }

    pub fn contains(&self, fingerprint: &Digest) -> bool {
        self.index.contains_key(fingerprint)
    }

    /// Append one record; supersedes any earlier record for the same
    /// fingerprint. Serialized against other writers via the lock file.
    pub fn append(&mut self, record: &CachedRecord) -> Result<()> {
        let _lock = WriterLock::acquire(self.lock_path())?;
        let mut f = OpenOptions::new().append(true).open(&self.path)?;
        let offset = f.metadata()?.len();
        f.write_all(&record.encode())?;
        f.sync_data()?;

        let mut idx = OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.index_path())?;
        idx.write_all(record.fingerprint.as_bytes())?;
        idx.write_all(&offset.to_le_bytes())?;

        if self.index.insert(record.fingerprint, offset).is_some() {
            self.garbage += 1;
        }
        Ok(())
    }

    /// Read the newest record for a fingerprint from disk.
    pub fn get(&self, fingerprint: &Digest) -> Result<Option<CachedRecord>> {
        let Some(&offset) = self.index.get(fingerprint) else {
            return Ok(None);
        };
        let mut f = File::open(&self.path)?;
        f.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::new();
        f.read_to_end(&mut data)?;
        let mut reader = SliceReader::new(&data);
        let record = CachedRecord::decode(&mut reader)?;
        Ok(Some(record))
    }

    /// All live records (newest per fingerprint), in file order.
    pub fn load_records(&self) -> Result<Vec<CachedRecord>> {
        let data = std::fs::read(&self.path)?;
        self.check_header(&data)?;
        let mut reader = SliceReader::new(&data);
        reader.pos = HEADER_LEN as usize;
        let mut records = Vec::new();
        while reader.remaining() > 0 {
            let offset = reader.pos as u64;
            let record = CachedRecord::decode(&mut reader)?;
            if self.index.get(&record.fingerprint) == Some(&offset) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Whether superseded entries have accumulated past the compaction
    /// threshold (more garbage than half the live entries).
    pub fn wants_compaction(&self) -> bool {
        self.garbage > self.index.len() / 2 && self.garbage > 0
    }

    /// Rewrite the log keeping only the newest record per fingerprint, and
    /// rewrite the index sidecar to match.
    pub fn compact(&mut self) -> Result<()> {
        let _lock = WriterLock::acquire(self.lock_path())?;
        let records = self.load_records()?;
        let tmp = self.path.with_extension("bin.tmp");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(MAGIC)?;
            f.write_all(&FORMAT_VERSION.to_le_bytes())?;
            f.write_all(&[0u8; 8])?;
            let mut offset = HEADER_LEN;
            let mut index = FxHashMap::default();
            for record in &records {
                let bytes = record.encode();
                f.write_all(&bytes)?;
                index.insert(record.fingerprint, offset);
                offset += bytes.len() as u64;
            }
            f.sync_all()?;
            self.index = index;
        }
        std::fs::rename(&tmp, &self.path)?;
        self.garbage = 0;
        self.write_index_sidecar()?;
        info!(entries = self.index.len(), "action cache compacted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tag: u8, outputs: &[(&str, u8)]) -> CachedRecord {
        CachedRecord {
            fingerprint: Digest::of_bytes(&[tag]),
            action_name: format!("Action{tag}"),
            inputs_digest: Digest::of_bytes(&[tag, tag]),
            outputs: outputs
                .iter()
                .map(|(p, t)| (ExecPath::new(*p).unwrap(), Digest::of_bytes(&[*t])))
                .collect(),
            timestamp_nanos: 1_700_000_000_000_000_000 + tag as u64,
        }
    }

    #[test]
    fn write_then_read_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let mut log = CacheLog::open(&path).unwrap();
        let r1 = record(1, &[("out/a", 10), ("out/b", 11)]);
        let r2 = record(2, &[]);
        log.append(&r1).unwrap();
        log.append(&r2).unwrap();

        let got1 = log.get(&r1.fingerprint).unwrap().unwrap();
        let got2 = log.get(&r2.fingerprint).unwrap().unwrap();
        assert_eq!(got1, r1);
        assert_eq!(got2, r2);
        assert_eq!(got1.encode(), r1.encode());
    }

    #[test]
    fn index_sidecar_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        {
            let mut log = CacheLog::open(&path).unwrap();
            log.append(&record(1, &[("out/a", 10)])).unwrap();
            log.append(&record(2, &[("out/b", 20)])).unwrap();
        }
        let log = CacheLog::open(&path).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(
            log.get(&record(2, &[]).fingerprint).unwrap().unwrap().outputs[0].0,
            ExecPath::new("out/b").unwrap()
        );
    }

    #[test]
    fn missing_sidecar_rebuilds_from_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        {
            let mut log = CacheLog::open(&path).unwrap();
            log.append(&record(1, &[("out/a", 10)])).unwrap();
        }
        std::fs::remove_file(dir.path().join("cache.bin.index")).unwrap();
        let log = CacheLog::open(&path).unwrap();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn later_records_supersede_and_compaction_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let mut log = CacheLog::open(&path).unwrap();
        let old = record(1, &[("out/a", 10)]);
        let mut new = record(1, &[("out/a", 99)]);
        new.timestamp_nanos += 5;
        log.append(&old).unwrap();
        log.append(&record(2, &[])).unwrap();
        log.append(&new).unwrap();
        assert_eq!(log.garbage(), 1);
        assert!(log.wants_compaction());

        log.compact().unwrap();
        assert_eq!(log.garbage(), 0);
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(&old.fingerprint).unwrap().unwrap(), new);

        // Reopen after compaction: index still consistent.
        drop(log);
        let log = CacheLog::open(&path).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(&old.fingerprint).unwrap().unwrap(), new);
    }

    #[test]
    fn corrupt_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        std::fs::write(&path, b"WRONGMAGIC0123456789").unwrap();
        assert!(matches!(
            CacheLog::open(&path),
            Err(AnvilError::CacheCorrupt(_))
        ));
    }
}
