use anvil_core::{
    Action, AnvilError, Artifact, ArtifactKind, ArtifactValue, Digest, DigestWriter, ExecPath,
    Result,
};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use tracing::debug;

/// Striped mutexes serializing the output-directory preparation walk.
/// Two actions whose outputs share ancestor directories hash the parent
/// path onto the same stripe and take turns; unrelated parents proceed in
/// parallel.
pub struct StripedLocks {
    stripes: Vec<Mutex<()>>,
}

impl StripedLocks {
    pub fn new(stripe_count: usize) -> Self {
        StripedLocks {
            stripes: (0..stripe_count.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe_for(&self, path: &ExecPath) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        path.as_str().hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }
}

/// Ensure the parent directory of every declared output exists. A
/// non-directory squatting anywhere on the path is deleted, walking upward
/// until a real directory is reached, then the intended directories are
/// created. The walk per parent is serialized through the striped locks.
pub fn prepare_output_dirs(root: &Path, action: &Action, locks: &StripedLocks) -> Result<()> {
    let mut prepared: FxHashSet<ExecPath> = FxHashSet::default();
    for output in action.all_outputs() {
        let Some(parent) = output.path.parent() else {
            continue;
        };
        if !prepared.insert(parent.clone()) {
            continue;
        }
        let _guard = locks.stripe_for(&parent).lock();
        let dir = parent.under(root);
        clear_non_directories(&dir)?;
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}

fn clear_non_directories(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => {
            debug!(path = %path.display(), "removing non-directory on output path");
            std::fs::remove_file(path)?;
            Ok(())
        }
        // NotFound: nothing here, check the parent. ENOTDIR: a file is
        // squatting on an ancestor, clear it the same way.
        Err(e)
            if e.kind() == std::io::ErrorKind::NotFound || e.raw_os_error() == Some(20) =>
        {
            match path.parent() {
                Some(parent) => clear_non_directories(parent),
                None => Ok(()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Check that every mandatory declared output exists after execution and
/// digest it. Missing files, dangling symlinks and absent tree directories
/// are reported distinctly, with the owning rule in the error. Optional
/// outputs that were not produced are skipped.
pub fn validate_outputs(root: &Path, action: &Action) -> Result<BTreeMap<ExecPath, ArtifactValue>> {
    let mut produced = BTreeMap::new();
    for output in action.mandatory_outputs() {
        let value = digest_output(root, action, output)?;
        produced.insert(output.path.clone(), value);
    }
    for output in &action.optional_outputs {
        let on_disk = output.path.under(root);
        if std::fs::symlink_metadata(&on_disk).is_ok() {
            let value = digest_output(root, action, output)?;
            produced.insert(output.path.clone(), value);
        }
    }
    Ok(produced)
}

fn digest_output(root: &Path, action: &Action, output: &Artifact) -> Result<ArtifactValue> {
    let on_disk = output.path.under(root);
    let meta = match std::fs::symlink_metadata(&on_disk) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let detail = match output.kind {
                ArtifactKind::Tree => " (tree output missing entirely)",
                _ => "",
            };
            return Err(AnvilError::OutputMissing {
                action: action.action_ref(),
                path: output.path.clone(),
                detail: detail.to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    if meta.file_type().is_symlink() && std::fs::metadata(&on_disk).is_err() {
        return Err(AnvilError::OutputMissing {
            action: action.action_ref(),
            path: output.path.clone(),
            detail: " (symlink points nowhere)".to_string(),
        });
    }

    if std::fs::metadata(&on_disk)?.is_dir() {
        return digest_tree(&on_disk);
    }
    let digest = Digest::of_file(&on_disk)?;
    let size = std::fs::metadata(&on_disk)?.len();
    Ok(ArtifactValue::derived(digest, size))
}

/// A tree artifact's digest covers its sorted `(relative path, content
/// digest)` entries; its size is the sum of entry sizes.
fn digest_tree(dir: &Path) -> Result<ArtifactValue> {
    let mut entries: Vec<(String, Digest, u64)> = Vec::new();
    collect_tree_entries(dir, dir, &mut entries)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let mut w = DigestWriter::new();
    let mut total = 0u64;
    w.u32(entries.len() as u32);
    for (rel, digest, size) in &entries {
        w.str(rel).digest(digest);
        total += size;
    }
    Ok(ArtifactValue::derived(w.finish(), total))
}

fn collect_tree_entries(
    base: &Path,
    dir: &Path,
    out: &mut Vec<(String, Digest, u64)>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_tree_entries(base, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(base)
                .map_err(|e| AnvilError::Internal(format!("tree entry outside base: {e}")))?
                .to_string_lossy()
                .replace('\\', "/");
            let size = entry.metadata()?.len();
            out.push((rel, Digest::of_file(&path)?, size));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::ActionOwner;

    fn action_with_outputs(outputs: &[&str]) -> Action {
        let mut iter = outputs.iter();
        let primary = Artifact::file(ExecPath::new(*iter.next().unwrap()).unwrap());
        let rest: Vec<Artifact> = iter
            .map(|p| Artifact::file(ExecPath::new(*p).unwrap()))
            .collect();
        Action::new(
            ActionOwner::new("//pkg:t", Digest::of_bytes(b"cfg")),
            0,
            "Test",
            primary,
        )
        .with_outputs(rest)
        .with_command(["true"])
    }

    #[test]
    fn prepare_creates_nested_parents() {
        let dir = tempfile::tempdir().unwrap();
        let locks = StripedLocks::new(64);
        let action = action_with_outputs(&["out/deep/nested/a.o"]);
        prepare_output_dirs(dir.path(), &action, &locks).unwrap();
        assert!(dir.path().join("out/deep/nested").is_dir());
    }

    #[test]
    fn prepare_replaces_file_squatting_on_directory_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        std::fs::write(dir.path().join("out/deep"), b"in the way").unwrap();
        let locks = StripedLocks::new(64);
        let action = action_with_outputs(&["out/deep/a.o"]);
        prepare_output_dirs(dir.path(), &action, &locks).unwrap();
        assert!(dir.path().join("out/deep").is_dir());
    }

    #[test]
    fn missing_output_names_rule_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let action = action_with_outputs(&["out/a.o"]);
        let err = validate_outputs(dir.path(), &action).unwrap_err();
        match err {
            AnvilError::OutputMissing { path, detail, .. } => {
                assert_eq!(path.as_str(), "out/a.o");
                assert!(detail.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_tree_output_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = action_with_outputs(&["out/tree"]);
        action.primary_output = Artifact::tree(ExecPath::new("out/tree").unwrap());
        let err = validate_outputs(dir.path(), &action).unwrap_err();
        match err {
            AnvilError::OutputMissing { detail, .. } => {
                assert!(detail.contains("tree output missing"), "{detail}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_output_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        std::os::unix::fs::symlink("nowhere", dir.path().join("out/link")).unwrap();
        let mut action = action_with_outputs(&["out/link"]);
        action.primary_output = Artifact::symlink(ExecPath::new("out/link").unwrap());
        let err = validate_outputs(dir.path(), &action).unwrap_err();
        match err {
            AnvilError::OutputMissing { detail, .. } => {
                assert!(detail.contains("symlink points nowhere"), "{detail}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn produced_outputs_are_digested() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        std::fs::write(dir.path().join("out/a.o"), b"object").unwrap();
        let action = action_with_outputs(&["out/a.o"]);
        let produced = validate_outputs(dir.path(), &action).unwrap();
        let value = &produced[&ExecPath::new("out/a.o").unwrap()];
        assert_eq!(value.digest, Digest::of_bytes(b"object"));
        assert_eq!(value.size, 6);
    }

    #[test]
    fn absent_optional_outputs_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        std::fs::write(dir.path().join("out/a.o"), b"object").unwrap();
        let mut action = action_with_outputs(&["out/a.o"]);
        action.optional_outputs = vec![Artifact::symlink(ExecPath::new("out/iface").unwrap())];
        let produced = validate_outputs(dir.path(), &action).unwrap();
        assert_eq!(produced.len(), 1);
    }

    #[test]
    fn tree_digest_covers_entries() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("out/tree");
        std::fs::create_dir_all(tree.join("sub")).unwrap();
        std::fs::write(tree.join("a.txt"), b"a").unwrap();
        std::fs::write(tree.join("sub/b.txt"), b"b").unwrap();
        let mut action = action_with_outputs(&["out/tree"]);
        action.primary_output = Artifact::tree(ExecPath::new("out/tree").unwrap());
        let first = validate_outputs(dir.path(), &action).unwrap();

        std::fs::write(tree.join("sub/b.txt"), b"changed").unwrap();
        let second = validate_outputs(dir.path(), &action).unwrap();
        let p = ExecPath::new("out/tree").unwrap();
        assert_ne!(first[&p].digest, second[&p].digest);
    }
}
