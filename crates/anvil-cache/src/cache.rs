use crate::fingerprint::combined_inputs_digest;
use crate::log::{CacheLog, CachedRecord};
use anvil_core::{Digest, ExecPath, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Cache performance counters for the build summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Default)]
struct StatsInner {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Outcome of a cache probe: either a trusted record, or a completion token
/// obliging the caller to execute and then `commit` (or drop, releasing
/// waiting probers).
pub enum Probe {
    Hit(Arc<CachedRecord>),
    Miss(CompletionToken),
}

struct CacheInner {
    entries: DashMap<Digest, Arc<CachedRecord>>,
    /// Fingerprints being built right now; the receiver resolves when the
    /// winner commits or abandons. At most one completion token is
    /// outstanding per fingerprint per build.
    in_build: DashMap<Digest, watch::Receiver<bool>>,
    log: Mutex<CacheLog>,
    stats: StatsInner,
}

/// The token returned by a probe miss. Carries what is needed to complete
/// the entry after execution; dropping it without committing wakes waiting
/// probers so one of them can claim the build instead.
pub struct CompletionToken {
    fingerprint: Digest,
    inner: Arc<CacheInner>,
    done: watch::Sender<bool>,
}

impl CompletionToken {
    pub fn fingerprint(&self) -> Digest {
        self.fingerprint
    }

    /// Publish the record to the in-memory table and the on-disk log, then
    /// release waiters. The record may carry a different fingerprint than
    /// the probe that produced this token: an input-discovering action's
    /// final fingerprint covers inputs it only learned about by running.
    /// Compaction runs opportunistically when superseded entries have
    /// accumulated.
    pub fn commit(self, record: CachedRecord) -> Result<()> {
        let record = Arc::new(record);
        self.inner
            .entries
            .insert(record.fingerprint, Arc::clone(&record));
        let mut log = self.inner.log.lock();
        log.append(&record)?;
        if log.wants_compaction() {
            log.compact()?;
        }
        Ok(())
        // Drop wakes the waiters.
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        self.inner.in_build.remove(&self.fingerprint);
        let _ = self.done.send(true);
    }
}

/// Fingerprint-indexed cache of prior action results, persistent across
/// server restarts, with in-build deduplication of concurrent builders of
/// the same fingerprint.
pub struct ActionCache {
    inner: Arc<CacheInner>,
}

impl ActionCache {
    pub fn open(path: &Path) -> Result<ActionCache> {
        let log = CacheLog::open(path)?;
        let entries = DashMap::new();
        for record in log.load_records()? {
            entries.insert(record.fingerprint, Arc::new(record));
        }
        info!(entries = entries.len(), "action cache opened");
        Ok(ActionCache {
            inner: Arc::new(CacheInner {
                entries,
                in_build: DashMap::new(),
                log: Mutex::new(log),
                stats: StatsInner::default(),
            }),
        })
    }

    /// Look up `fingerprint`, re-verifying the recorded input digests
    /// against `current_inputs` before trusting a record. Returns a hit, or
    /// a completion token; a prober that loses the claim race waits for the
    /// winner and then re-probes.
    pub async fn probe(
        &self,
        fingerprint: Digest,
        current_inputs: &BTreeMap<ExecPath, Digest>,
    ) -> Probe {
        loop {
            if let Some(record) = self.lookup_valid(&fingerprint, current_inputs) {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Probe::Hit(record);
            }
            let waiter = match self.inner.in_build.entry(fingerprint) {
                Entry::Vacant(slot) => {
                    let (tx, rx) = watch::channel(false);
                    slot.insert(rx);
                    self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return Probe::Miss(CompletionToken {
                        fingerprint,
                        inner: Arc::clone(&self.inner),
                        done: tx,
                    });
                }
                Entry::Occupied(slot) => slot.get().clone(),
            };
            let mut waiter = waiter;
            // Winner committed or abandoned; either way, re-probe.
            let _ = waiter.changed().await;
        }
    }

    fn lookup_valid(
        &self,
        fingerprint: &Digest,
        current_inputs: &BTreeMap<ExecPath, Digest>,
    ) -> Option<Arc<CachedRecord>> {
        let record = self.inner.entries.get(fingerprint)?.clone();
        if record.inputs_digest == combined_inputs_digest(current_inputs) {
            return Some(record);
        }
        // Stale: the inputs on disk no longer match what the record was
        // built from. Evict and treat as a miss.
        self.inner.entries.remove(fingerprint);
        self.inner.stats.evictions.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = %fingerprint, "stale cache record evicted");
        None
    }

    /// Drop a record whose on-disk outputs turned out to be unrestorable;
    /// the next probe of the fingerprint misses and re-executes.
    pub fn evict(&self, fingerprint: &Digest) {
        if self.inner.entries.remove(fingerprint).is_some() {
            self.inner.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.stats.hits.load(Ordering::Relaxed),
            misses: self.inner.stats.misses.load(Ordering::Relaxed),
            evictions: self.inner.stats.evictions.load(Ordering::Relaxed),
            entries: self.inner.entries.len(),
        }
    }

    /// Per-build teardown: any in-build claims left behind (crashed or
    /// cancelled builders) are dropped so the next build can claim them.
    pub fn finish_build(&self) {
        self.inner.in_build.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn inputs(pairs: &[(&str, &[u8])]) -> BTreeMap<ExecPath, Digest> {
        pairs
            .iter()
            .map(|(p, c)| (ExecPath::new(*p).unwrap(), Digest::of_bytes(c)))
            .collect()
    }

    fn record(fp: Digest, ins: &BTreeMap<ExecPath, Digest>) -> CachedRecord {
        CachedRecord {
            fingerprint: fp,
            action_name: "Compile".to_string(),
            inputs_digest: combined_inputs_digest(ins),
            outputs: vec![(ExecPath::new("out/a.o").unwrap(), Digest::of_bytes(b"obj"))],
            timestamp_nanos: 1,
        }
    }

    #[tokio::test]
    async fn miss_then_commit_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ActionCache::open(&dir.path().join("cache.bin")).unwrap();
        let ins = inputs(&[("src/a.c", b"int main;")]);
        let fp = Digest::of_bytes(b"fp1");

        match cache.probe(fp, &ins).await {
            Probe::Miss(token) => token.commit(record(fp, &ins)).unwrap(),
            Probe::Hit(_) => panic!("unexpected hit"),
        }
        match cache.probe(fp, &ins).await {
            Probe::Hit(rec) => assert_eq!(rec.action_name, "Compile"),
            Probe::Miss(_) => panic!("expected hit"),
        }
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn changed_inputs_invalidate_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ActionCache::open(&dir.path().join("cache.bin")).unwrap();
        let fp = Digest::of_bytes(b"fp1");
        let ins = inputs(&[("src/a.c", b"v1")]);
        match cache.probe(fp, &ins).await {
            Probe::Miss(token) => token.commit(record(fp, &ins)).unwrap(),
            Probe::Hit(_) => panic!("unexpected hit"),
        }

        let changed = inputs(&[("src/a.c", b"v2")]);
        match cache.probe(fp, &changed).await {
            Probe::Miss(_token) => {}
            Probe::Hit(_) => panic!("stale record must not hit"),
        }
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn hits_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let ins = inputs(&[("src/a.c", b"v1")]);
        let fp = Digest::of_bytes(b"fp1");
        {
            let cache = ActionCache::open(&path).unwrap();
            match cache.probe(fp, &ins).await {
                Probe::Miss(token) => token.commit(record(fp, &ins)).unwrap(),
                Probe::Hit(_) => panic!("unexpected hit"),
            }
        }
        let cache = ActionCache::open(&path).unwrap();
        assert!(matches!(cache.probe(fp, &ins).await, Probe::Hit(_)));
    }

    #[tokio::test]
    async fn concurrent_probers_deduplicate() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ActionCache::open(&dir.path().join("cache.bin")).unwrap());
        let ins = inputs(&[("src/a.c", b"v1")]);
        let fp = Digest::of_bytes(b"fp1");

        let token = match cache.probe(fp, &ins).await {
            Probe::Miss(token) => token,
            Probe::Hit(_) => panic!("unexpected hit"),
        };

        // A second prober must wait for the winner rather than build.
        let waiter = {
            let cache = Arc::clone(&cache);
            let ins = ins.clone();
            tokio::spawn(async move { matches!(cache.probe(fp, &ins).await, Probe::Hit(_)) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        token.commit(record(fp, &ins)).unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn abandoned_token_releases_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ActionCache::open(&dir.path().join("cache.bin")).unwrap());
        let ins = inputs(&[("src/a.c", b"v1")]);
        let fp = Digest::of_bytes(b"fp1");

        let token = match cache.probe(fp, &ins).await {
            Probe::Miss(token) => token,
            Probe::Hit(_) => panic!("unexpected hit"),
        };
        let waiter = {
            let cache = Arc::clone(&cache);
            let ins = ins.clone();
            tokio::spawn(async move { matches!(cache.probe(fp, &ins).await, Probe::Miss(_)) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(token); // builder failed without committing
        assert!(waiter.await.unwrap());
    }
}
