use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub type BuildId = Uuid;

/// 32-byte SHA-256 content digest. The single digest type used for file
/// contents, action keys and cache request fingerprints.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub const ZERO: Digest = Digest([0u8; 32]);

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut h = Sha256::new();
        h.update(bytes);
        Digest(h.finalize().into())
    }

    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        use std::io::Read;
        let mut f = std::fs::File::open(path)?;
        let mut h = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            h.update(&buf[..n]);
        }
        Ok(Digest(h.finalize().into()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Digest(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental SHA-256 writer with length-prefixed framing, so that
/// `("ab","c")` and `("a","bc")` never collide. Shared by action keys and
/// cache fingerprints.
pub struct DigestWriter {
    inner: Sha256,
}

impl DigestWriter {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.u64(b.len() as u64);
        self.inner.update(b);
        self
    }

    pub fn str(&mut self, s: &str) -> &mut Self {
        self.bytes(s.as_bytes())
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.inner.update(v.to_le_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.inner.update(v.to_le_bytes());
        self
    }

    pub fn digest(&mut self, d: &Digest) -> &mut Self {
        self.inner.update(d.0);
        self
    }

    pub fn finish(self) -> Digest {
        Digest(self.inner.finalize().into())
    }
}

impl Default for DigestWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonically increasing build version. Bumped once per build; node
/// freshness is decided by comparing versions, never wall time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Version(pub u64);

impl Version {
    pub const ZERO: Version = Version(0);

    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Normalized, relative, `/`-separated path identifying an artifact inside
/// the execution root. Component-aware prefix tests are what the
/// prefix-conflict invariant is checked with; plain string prefixes would
/// falsely match `a/bc` against `a/b`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecPath(String);

impl ExecPath {
    pub fn new(path: impl Into<String>) -> Result<Self, String> {
        let raw: String = path.into();
        if raw.is_empty() {
            return Err("exec path must not be empty".to_string());
        }
        if raw.starts_with('/') {
            return Err(format!("exec path must be relative: {raw}"));
        }
        let mut parts = Vec::new();
        for comp in raw.split('/') {
            match comp {
                "" | "." => continue,
                ".." => return Err(format!("exec path must not contain '..': {raw}")),
                c => parts.push(c),
            }
        }
        if parts.is_empty() {
            return Err(format!("exec path has no components: {raw}"));
        }
        Ok(ExecPath(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn parent(&self) -> Option<ExecPath> {
        self.0.rfind('/').map(|i| ExecPath(self.0[..i].to_string()))
    }

    /// True iff `self` is a proper path-prefix of `other` on component
    /// boundaries: `a/b` prefixes `a/b/c` but not `a/bc`.
    pub fn is_path_prefix_of(&self, other: &ExecPath) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    pub fn join(&self, child: &str) -> ExecPath {
        ExecPath(format!("{}/{}", self.0, child))
    }

    /// Resolve against an on-disk execution root.
    pub fn under(&self, root: &Path) -> PathBuf {
        let mut p = root.to_path_buf();
        for comp in self.components() {
            p.push(comp);
        }
        p
    }
}

impl fmt::Debug for ExecPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecPath({})", self.0)
    }
}

impl fmt::Display for ExecPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ExecPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecPath::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_hex_round_trip() {
        let d = Digest::of_bytes(b"hello");
        let back = Digest::from_hex(&d.to_hex()).unwrap();
        assert_eq!(d, back);
    }

    #[test]
    fn digest_writer_framing() {
        let a = {
            let mut w = DigestWriter::new();
            w.str("ab").str("c");
            w.finish()
        };
        let b = {
            let mut w = DigestWriter::new();
            w.str("a").str("bc");
            w.finish()
        };
        assert_ne!(a, b);
    }

    #[test]
    fn exec_path_normalization() {
        assert_eq!(ExecPath::new("a//b/./c").unwrap().as_str(), "a/b/c");
        assert!(ExecPath::new("/abs").is_err());
        assert!(ExecPath::new("a/../b").is_err());
        assert!(ExecPath::new("").is_err());
    }

    #[test]
    fn exec_path_prefix_is_component_aware() {
        let a = ExecPath::new("a/b").unwrap();
        let b = ExecPath::new("a/b/c").unwrap();
        let c = ExecPath::new("a/bc").unwrap();
        assert!(a.is_path_prefix_of(&b));
        assert!(!a.is_path_prefix_of(&c));
        assert!(!a.is_path_prefix_of(&a));
        assert!(!b.is_path_prefix_of(&a));
    }

    #[test]
    fn exec_path_parent() {
        let p = ExecPath::new("out/pkg/lib.a").unwrap();
        assert_eq!(p.parent().unwrap().as_str(), "out/pkg");
        assert_eq!(ExecPath::new("lib.a").unwrap().parent(), None);
    }
}
