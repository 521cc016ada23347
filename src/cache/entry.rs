//! On-disk record formats of the action and target caches.
//!
//! Both entries use a compact binary layout: a 1-byte format version,
//! length-prefixed UTF-8 strings (u32 big-endian lengths), raw 32-byte
//! hashes, u32 big-endian element counts and u64 big-endian timestamps.
//! Decoding is strict; any inconsistency surfaces as
//! [`BuildError::CorruptCacheEntry`] so the caller can quarantine the file.

use crate::{
    error::{BuildError, Result},
    hash::{CompositeHasher, ContentHash},
    target::{ActionKind, TargetId},
};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// Format version of action entries.
pub const ACTION_ENTRY_VERSION: u8 = 1;

/// Format version of target entries.
pub const TARGET_ENTRY_VERSION: u8 = 1;

/// Composite key of one action.
///
/// `sub_id` distinguishes multiple actions of the same kind within a target,
/// e.g. per-source-file compiles.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId {
    pub target: TargetId,
    pub kind: ActionKind,
    pub input_hash: ContentHash,
    pub sub_id: String,
}

impl ActionId {
    pub fn new(
        target: TargetId,
        kind: ActionKind,
        input_hash: ContentHash,
        sub_id: impl Into<String>,
    ) -> Self {
        Self { target, kind, input_hash, sub_id: sub_id.into() }
    }

    /// Stable hex digest used as the entry file name.
    pub fn digest(&self) -> String {
        let mut hasher = CompositeHasher::new();
        hasher
            .update(self.target.as_str())
            .update([self.kind.as_u8()])
            .update_hash(&self.input_hash)
            .update(&self.sub_id);
        hasher.finish().to_hex()
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.target, self.kind)?;
        if !self.sub_id.is_empty() {
            write!(f, "/{}", self.sub_id)?;
        }
        Ok(())
    }
}

/// A fine-grained cache record for one action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionEntry {
    pub id: ActionId,
    /// Exact free parameters that affect outputs (compiler, flags, triple…).
    pub metadata: BTreeMap<String, String>,
    pub outputs: Vec<PathBuf>,
    pub success: bool,
    pub timestamp_ms: u64,
}

impl ActionEntry {
    /// Hash over the ordered input content hashes plus canonical metadata.
    pub fn inputs_hash(&self) -> &ContentHash {
        &self.id.input_hash
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u8(ACTION_ENTRY_VERSION);
        w.str(self.id.target.as_str());
        w.u8(self.id.kind.as_u8());
        w.hash(&self.id.input_hash);
        w.str(&self.id.sub_id);
        w.u32(self.metadata.len() as u32);
        for (key, value) in &self.metadata {
            w.str(key);
            w.str(value);
        }
        w.u32(self.outputs.len() as u32);
        for output in &self.outputs {
            w.str(&output.to_string_lossy());
        }
        w.u8(self.success as u8);
        w.u64(self.timestamp_ms);
        w.out
    }

    pub fn decode(bytes: &[u8], path: &Path) -> Result<Self> {
        let mut r = Reader::new(bytes, path);
        let version = r.u8()?;
        if version != ACTION_ENTRY_VERSION {
            return Err(r.corrupt(format!("unsupported action entry version {version}")));
        }
        let target = TargetId::parse(&r.str()?, "")
            .map_err(|err| r.corrupt(format!("bad target id: {err}")))?;
        let kind = ActionKind::from_u8(r.u8()?)
            .ok_or_else(|| r.corrupt("bad action kind byte"))?;
        let input_hash = r.hash()?;
        let sub_id = r.str()?;
        let metadata_len = r.u32()? as usize;
        let mut metadata = BTreeMap::new();
        for _ in 0..metadata_len {
            let key = r.str()?;
            let value = r.str()?;
            metadata.insert(key, value);
        }
        let outputs_len = r.u32()? as usize;
        let mut outputs = Vec::with_capacity(outputs_len.min(1024));
        for _ in 0..outputs_len {
            outputs.push(PathBuf::from(r.str()?));
        }
        let success = r.u8()? != 0;
        let timestamp_ms = r.u64()?;
        r.finish()?;
        Ok(Self {
            id: ActionId { target, kind, input_hash, sub_id },
            metadata,
            outputs,
            success,
            timestamp_ms,
        })
    }
}

/// A coarse cache record for one target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetEntry {
    pub target: TargetId,
    pub sources_hash: ContentHash,
    pub deps_hash: ContentHash,
    pub output_hash: ContentHash,
    pub outputs: Vec<PathBuf>,
    pub timestamp_ms: u64,
}

impl TargetEntry {
    /// Serializes the entry followed by an integrity signature over the body.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u8(TARGET_ENTRY_VERSION);
        w.str(self.target.as_str());
        w.hash(&self.sources_hash);
        w.hash(&self.deps_hash);
        w.hash(&self.output_hash);
        w.u32(self.outputs.len() as u32);
        for output in &self.outputs {
            w.str(&output.to_string_lossy());
        }
        w.u64(self.timestamp_ms);
        let signature = ContentHash::of(&w.out);
        w.hash(&signature);
        w.out
    }

    /// Decodes and validates the integrity signature.
    pub fn decode(bytes: &[u8], path: &Path) -> Result<Self> {
        if bytes.len() < 32 {
            return Err(BuildError::CorruptCacheEntry {
                path: path.to_path_buf(),
                message: "truncated target entry".into(),
            });
        }
        let (body, signature) = bytes.split_at(bytes.len() - 32);
        if ContentHash::of(body).as_bytes() != signature {
            return Err(BuildError::CorruptCacheEntry {
                path: path.to_path_buf(),
                message: "integrity signature mismatch".into(),
            });
        }

        let mut r = Reader::new(body, path);
        let version = r.u8()?;
        if version != TARGET_ENTRY_VERSION {
            return Err(r.corrupt(format!("unsupported target entry version {version}")));
        }
        let target = TargetId::parse(&r.str()?, "")
            .map_err(|err| r.corrupt(format!("bad target id: {err}")))?;
        let sources_hash = r.hash()?;
        let deps_hash = r.hash()?;
        let output_hash = r.hash()?;
        let outputs_len = r.u32()? as usize;
        let mut outputs = Vec::with_capacity(outputs_len.min(1024));
        for _ in 0..outputs_len {
            outputs.push(PathBuf::from(r.str()?));
        }
        let timestamp_ms = r.u64()?;
        r.finish()?;
        Ok(Self { target, sources_hash, deps_hash, output_hash, outputs, timestamp_ms })
    }
}

// ---- little codec helpers ----

#[derive(Default)]
struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, value: u8) {
        self.out.push(value);
    }

    fn u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    fn str(&mut self, value: &str) {
        self.u32(value.len() as u32);
        self.out.extend_from_slice(value.as_bytes());
    }

    fn hash(&mut self, hash: &ContentHash) {
        self.out.extend_from_slice(hash.as_bytes());
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
    path: &'a Path,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], path: &'a Path) -> Self {
        Self { bytes, offset: 0, path }
    }

    fn corrupt(&self, message: impl Into<String>) -> BuildError {
        BuildError::CorruptCacheEntry { path: self.path.to_path_buf(), message: message.into() }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.offset + len > self.bytes.len() {
            return Err(self.corrupt("unexpected end of entry"));
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.corrupt("invalid utf-8 string"))
    }

    fn hash(&mut self) -> Result<ContentHash> {
        Ok(ContentHash(self.take(32)?.try_into().unwrap()))
    }

    fn finish(&self) -> Result<()> {
        if self.offset != self.bytes.len() {
            return Err(self.corrupt("trailing bytes after entry"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn action_entry() -> ActionEntry {
        ActionEntry {
            id: ActionId::new(
                TargetId::parse("//svc:api", "").unwrap(),
                ActionKind::Compile,
                ContentHash::of(b"inputs"),
                "api.py",
            ),
            metadata: BTreeMap::from([
                ("compiler".to_string(), "pyc 3.12".to_string()),
                ("opt".to_string(), "2".to_string()),
            ]),
            outputs: vec![PathBuf::from("out/api.pyc"), PathBuf::from("out/api.meta")],
            success: true,
            timestamp_ms: 1_720_000_000_123,
        }
    }

    #[test]
    fn action_entry_round_trips() {
        let entry = action_entry();
        let decoded = ActionEntry::decode(&entry.encode(), Path::new("e")).unwrap();
        assert_eq!(decoded, entry);
        // ordering of outputs must survive
        assert_eq!(decoded.outputs[0], PathBuf::from("out/api.pyc"));
    }

    #[test]
    fn target_entry_round_trips() {
        let entry = TargetEntry {
            target: TargetId::parse("//svc:api", "").unwrap(),
            sources_hash: ContentHash::of(b"s"),
            deps_hash: ContentHash::of(b"d"),
            output_hash: ContentHash::of(b"o"),
            outputs: vec![PathBuf::from("bin/api")],
            timestamp_ms: 42,
        };
        let decoded = TargetEntry::decode(&entry.encode(), Path::new("e")).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn tampering_breaks_target_integrity() {
        let entry = TargetEntry {
            target: TargetId::parse("//svc:api", "").unwrap(),
            sources_hash: ContentHash::of(b"s"),
            deps_hash: ContentHash::of(b"d"),
            output_hash: ContentHash::of(b"o"),
            outputs: vec![],
            timestamp_ms: 42,
        };
        let mut bytes = entry.encode();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        let err = TargetEntry::decode(&bytes, Path::new("e")).unwrap_err();
        assert!(matches!(err, BuildError::CorruptCacheEntry { .. }), "{err}");
    }

    #[test]
    fn truncated_action_entry_is_corrupt() {
        let bytes = action_entry().encode();
        let err = ActionEntry::decode(&bytes[..bytes.len() - 3], Path::new("e")).unwrap_err();
        assert!(matches!(err, BuildError::CorruptCacheEntry { .. }), "{err}");
    }

    #[test]
    fn version_byte_is_enforced() {
        let mut bytes = action_entry().encode();
        bytes[0] = 99;
        let err = ActionEntry::decode(&bytes, Path::new("e")).unwrap_err();
        assert!(err.to_string().contains("version"), "{err}");
    }

    #[test]
    fn digest_distinguishes_sub_ids() {
        let base = action_entry().id;
        let mut other = base.clone();
        other.sub_id = "other.py".into();
        assert_ne!(base.digest(), other.digest());
    }
}
