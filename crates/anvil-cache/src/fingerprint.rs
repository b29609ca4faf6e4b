use anvil_core::{Digest, DigestWriter, ExecPath, Result};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::Path;

/// The cache request fingerprint: a digest of the action's identity, the
/// digests of its declared inputs, the environment subset and the execution
/// requirements. Linear in the input count; all maps are ordered, so the
/// encoding is canonical.
pub fn request_fingerprint(
    action_key: &Digest,
    inputs: &BTreeMap<ExecPath, Digest>,
    env: &BTreeMap<String, String>,
    execution_requirements: &BTreeMap<String, String>,
) -> Digest {
    let mut w = DigestWriter::new();
    w.digest(action_key);
    w.u32(inputs.len() as u32);
    for (path, digest) in inputs {
        w.str(path.as_str()).digest(digest);
    }
    w.u32(env.len() as u32);
    for (k, v) in env {
        w.str(k).str(v);
    }
    w.u32(execution_requirements.len() as u32);
    for (k, v) in execution_requirements {
        w.str(k).str(v);
    }
    w.finish()
}

/// Combined digest over the input set, stored in each cache record and
/// re-verified against the current inputs before a hit is trusted.
pub fn combined_inputs_digest(inputs: &BTreeMap<ExecPath, Digest>) -> Digest {
    let mut w = DigestWriter::new();
    w.u32(inputs.len() as u32);
    for (path, digest) in inputs {
        w.str(path.as_str()).digest(digest);
    }
    w.finish()
}

/// Digest many files in parallel. Used when fingerprinting large input sets
/// from disk; results come back in the argument order.
pub fn digest_files(root: &Path, paths: &[ExecPath]) -> Result<Vec<(ExecPath, Digest)>> {
    paths
        .par_iter()
        .map(|p| {
            let digest = Digest::of_file(&p.under(root))?;
            Ok((p.clone(), digest))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(name: &str) -> ExecPath {
        ExecPath::new(name).unwrap()
    }

    #[test]
    fn zero_input_action_fingerprints_by_action_key_alone() {
        let key_a = Digest::of_bytes(b"a");
        let key_b = Digest::of_bytes(b"b");
        let empty = BTreeMap::new();
        let fp_a = request_fingerprint(&key_a, &empty, &BTreeMap::new(), &BTreeMap::new());
        let fp_b = request_fingerprint(&key_b, &empty, &BTreeMap::new(), &BTreeMap::new());
        assert_ne!(fp_a, fp_b);
        assert_eq!(
            fp_a,
            request_fingerprint(&key_a, &empty, &BTreeMap::new(), &BTreeMap::new())
        );
    }

    #[test]
    fn fingerprint_changes_with_any_component() {
        let key = Digest::of_bytes(b"k");
        let mut inputs = BTreeMap::new();
        inputs.insert(p("src/a"), Digest::of_bytes(b"1"));
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/bin".to_string());
        let reqs = BTreeMap::new();

        let base = request_fingerprint(&key, &inputs, &env, &reqs);

        let mut inputs2 = inputs.clone();
        inputs2.insert(p("src/a"), Digest::of_bytes(b"2"));
        assert_ne!(base, request_fingerprint(&key, &inputs2, &env, &reqs));

        let mut env2 = env.clone();
        env2.insert("PATH".to_string(), "/usr/bin".to_string());
        assert_ne!(base, request_fingerprint(&key, &inputs, &env2, &reqs));

        let mut reqs2 = reqs.clone();
        reqs2.insert("no-remote".to_string(), "1".to_string());
        assert_ne!(base, request_fingerprint(&key, &inputs, &env, &reqs2));
    }

    #[test]
    fn large_input_sets_fingerprint_quickly() {
        // Linearity guard: ten thousand inputs must be far from quadratic.
        let key = Digest::of_bytes(b"k");
        let mut inputs = BTreeMap::new();
        for i in 0..10_000u32 {
            inputs.insert(
                p(&format!("gen/input-{i}")),
                Digest::of_bytes(&i.to_le_bytes()),
            );
        }
        let started = std::time::Instant::now();
        let fp = request_fingerprint(&key, &inputs, &BTreeMap::new(), &BTreeMap::new());
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert_ne!(fp, Digest::ZERO);
    }
}
