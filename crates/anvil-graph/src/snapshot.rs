use crate::node::{DirtyState, Node};
use crate::store::GraphStore;
use anvil_core::{AnvilError, Key, Result, Value, Version};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Serialize, Deserialize)]
struct SnapshotNode {
    key: Key,
    value: Value,
    deps: Vec<Key>,
    computed_at: Version,
    changed_at: Version,
}

/// A serialized dump of the graph's reusable state: hermetic nodes with
/// values, plus the version counter. Errors, dirty marks and non-hermetic
/// values are deliberately not persisted.
#[derive(Serialize, Deserialize)]
pub struct GraphSnapshot {
    version: Version,
    nodes: Vec<SnapshotNode>,
}

impl GraphSnapshot {
    pub fn capture(store: &GraphStore) -> GraphSnapshot {
        let mut nodes = Vec::new();
        store.for_each_node(|key, node| {
            if !node.hermetic || node.dirty != DirtyState::Clean {
                return;
            }
            if let Some(value) = &node.value {
                nodes.push(SnapshotNode {
                    key: key.clone(),
                    value: value.clone(),
                    deps: node.deps.clone(),
                    computed_at: node.computed_at,
                    changed_at: node.changed_at,
                });
            }
        });
        GraphSnapshot {
            version: store.current_version(),
            nodes,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| AnvilError::Serialization(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        info!(nodes = self.nodes.len(), path = %path.display(), "graph snapshot saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<GraphSnapshot> {
        let bytes = std::fs::read(path)?;
        let (snapshot, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| AnvilError::Serialization(e.to_string()))?;
        Ok(snapshot)
    }

    /// Rebuild a store from the snapshot, restoring reverse edges from the
    /// recorded forward edges.
    pub fn restore(self) -> GraphStore {
        let store = GraphStore::new();
        store.set_version(self.version);
        for sn in &self.nodes {
            let node = Node {
                value: Some(sn.value.clone()),
                error: None,
                deps: sn.deps.clone(),
                rdeps: Default::default(),
                computed_at: sn.computed_at,
                checked_at: sn.computed_at,
                changed_at: sn.changed_at,
                dirty: DirtyState::Clean,
                hermetic: true,
            };
            store.install_restored(sn.key.clone(), node);
        }
        for sn in &self.nodes {
            for dep in &sn.deps {
                store.add_rdep(dep, sn.key.clone());
            }
        }
        store
    }
}

/// Load a persisted graph, degrading to a cold store when the snapshot is
/// missing or unreadable. A stale or corrupt snapshot must never fail the
/// build.
pub fn load_or_cold(path: &Path) -> Arc<GraphStore> {
    match GraphSnapshot::load(path) {
        Ok(snapshot) => {
            info!(nodes = snapshot.node_count(), "graph snapshot loaded");
            Arc::new(snapshot.restore())
        }
        Err(AnvilError::Io(_)) => Arc::new(GraphStore::new()),
        Err(e) => {
            warn!(error = %e, "graph snapshot unreadable; starting cold");
            Arc::new(GraphStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::{Digest, ExecPath, FileStateValue};

    fn key(name: &str) -> Key {
        Key::artifact(ExecPath::new(name).unwrap())
    }

    fn val(tag: u8) -> Value {
        Value::FileState(FileStateValue {
            digest: Digest::of_bytes(&[tag]),
            size: tag as u64,
            mtime_nanos: 0,
            exists: true,
        })
    }

    #[test]
    fn snapshot_round_trips_values_and_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph").join("snapshot.bin");

        let store = GraphStore::new();
        let v1 = store.begin_build();
        store.write_value(&key("leaf"), val(1), vec![], v1, true);
        store.write_value(&key("top"), val(2), vec![key("leaf")], v1, true);

        GraphSnapshot::capture(&store).save(&path).unwrap();
        let restored = GraphSnapshot::load(&path).unwrap().restore();

        assert_eq!(restored.current_version(), v1);
        assert_eq!(restored.value(&key("top")), Some(val(2)));
        assert_eq!(restored.deps(&key("top")), vec![key("leaf")]);
        assert_eq!(restored.rdeps(&key("leaf")), vec![key("top")]);
        assert_eq!(restored.changed_at(&key("leaf")), Some(v1));
    }

    #[test]
    fn non_hermetic_nodes_are_not_persisted() {
        let store = GraphStore::new();
        let v1 = store.begin_build();
        store.write_value(&key("hermetic"), val(1), vec![], v1, true);
        store.write_value(&key("volatile"), val(2), vec![], v1, false);
        let snapshot = GraphSnapshot::capture(&store);
        assert_eq!(snapshot.node_count(), 1);
    }

    #[test]
    fn missing_snapshot_degrades_to_cold_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = load_or_cold(&dir.path().join("nope.bin"));
        assert!(store.is_empty());
    }

    #[test]
    fn corrupt_snapshot_degrades_to_cold_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        std::fs::write(&path, b"not a snapshot").unwrap();
        let store = load_or_cold(&path);
        assert!(store.is_empty());
    }
}
