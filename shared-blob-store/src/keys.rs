//! Key and TTL policy.
//!
//! The store never builds backend keys by hand: every key and every default
//! expiration comes from a [`KeyPolicy`], so applications sharing one cluster
//! can namespace their blobs.

use std::fmt::Debug;
use std::time::Duration;

use crate::types::BlobId;

/// Classes of keys the store writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Blob metadata records and chunks.
    File,
    /// Throwaway probe keys used to verify a node accepts writes.
    Canary,
}

impl KeyKind {
    pub fn namespace(&self) -> &'static str {
        match self {
            KeyKind::File => "file",
            KeyKind::Canary => "canary",
        }
    }
}

pub trait KeyPolicy: Send + Sync + Debug {
    /// Key for a blob, optionally qualified by a suffix (`meta`, `chunk:<offset>`).
    fn create_file_key(&self, blob_id: &BlobId, suffix: Option<&str>) -> String;

    /// Expiration applied when the caller does not supply one.
    fn expiration_for_key_type(&self, kind: KeyKind) -> Duration;

    /// Generic namespaced key.
    fn create_key(&self, namespace: &str, id: &str) -> String;

    /// Glob pattern matching every key of the given class.
    fn key_pattern_for_entity_type(&self, kind: KeyKind) -> String;

    fn metadata_key(&self, blob_id: &BlobId) -> String {
        self.create_file_key(blob_id, Some(META_SUFFIX))
    }

    fn chunk_key(&self, blob_id: &BlobId, offset: u64) -> String {
        self.create_file_key(blob_id, Some(&format!("{CHUNK_SUFFIX}:{offset}")))
    }

    /// Glob pattern matching the metadata record and all chunks of one blob.
    fn blob_key_pattern(&self, blob_id: &BlobId) -> String {
        self.create_file_key(blob_id, Some("*"))
    }

    /// Recovers the blob id from a metadata key, `None` for any other key.
    fn blob_id_from_metadata_key(&self, key: &str) -> Option<BlobId> {
        let prefix = self.create_key(KeyKind::File.namespace(), "");
        key.strip_prefix(&prefix)?
            .strip_suffix(&format!(":{META_SUFFIX}"))?
            .parse()
            .ok()
    }
}

pub const META_SUFFIX: &str = "meta";
pub const CHUNK_SUFFIX: &str = "chunk";

pub const DEFAULT_KEY_PREFIX: &str = "blobs";
pub const DEFAULT_FILE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_CANARY_TTL: Duration = Duration::from_secs(10);

/// `{prefix}:{namespace}:{id}` key layout.
#[derive(Debug, Clone)]
pub struct PrefixedKeyPolicy {
    prefix: String,
    file_ttl: Duration,
    canary_ttl: Duration,
}

impl PrefixedKeyPolicy {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            file_ttl: DEFAULT_FILE_TTL,
            canary_ttl: DEFAULT_CANARY_TTL,
        }
    }

    pub fn with_file_ttl(mut self, ttl: Duration) -> Self {
        self.file_ttl = ttl;
        self
    }

    pub fn with_canary_ttl(mut self, ttl: Duration) -> Self {
        self.canary_ttl = ttl;
        self
    }
}

impl Default for PrefixedKeyPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl KeyPolicy for PrefixedKeyPolicy {
    fn create_file_key(&self, blob_id: &BlobId, suffix: Option<&str>) -> String {
        let base = self.create_key(KeyKind::File.namespace(), &blob_id.to_string());
        match suffix {
            Some(suffix) => format!("{base}:{suffix}"),
            None => base,
        }
    }

    fn expiration_for_key_type(&self, kind: KeyKind) -> Duration {
        match kind {
            KeyKind::File => self.file_ttl,
            KeyKind::Canary => self.canary_ttl,
        }
    }

    fn create_key(&self, namespace: &str, id: &str) -> String {
        format!("{}:{}:{}", self.prefix, namespace, id)
    }

    fn key_pattern_for_entity_type(&self, kind: KeyKind) -> String {
        format!("{}:{}:*", self.prefix, kind.namespace())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let policy = PrefixedKeyPolicy::new("app");
        let id: BlobId = "0f0e0d0c0b0a09080706050403020100".parse().unwrap();

        assert_eq!(
            policy.metadata_key(&id),
            "app:file:0f0e0d0c0b0a09080706050403020100:meta"
        );
        assert_eq!(
            policy.chunk_key(&id, 1_048_576),
            "app:file:0f0e0d0c0b0a09080706050403020100:chunk:1048576"
        );
        assert_eq!(
            policy.blob_key_pattern(&id),
            "app:file:0f0e0d0c0b0a09080706050403020100:*"
        );
        assert_eq!(policy.key_pattern_for_entity_type(KeyKind::File), "app:file:*");
        assert_eq!(policy.create_key("canary", "x"), "app:canary:x");
    }

    #[test]
    fn test_blob_id_from_metadata_key() {
        let policy = PrefixedKeyPolicy::default();
        let id = BlobId::new();

        assert_eq!(policy.blob_id_from_metadata_key(&policy.metadata_key(&id)), Some(id));
        assert_eq!(policy.blob_id_from_metadata_key(&policy.chunk_key(&id, 0)), None);
        assert_eq!(policy.blob_id_from_metadata_key("other:file:abc:meta"), None);
    }

    #[test]
    fn test_expirations() {
        let policy = PrefixedKeyPolicy::default().with_file_ttl(Duration::from_secs(60));
        assert_eq!(policy.expiration_for_key_type(KeyKind::File), Duration::from_secs(60));
        assert_eq!(policy.expiration_for_key_type(KeyKind::Canary), DEFAULT_CANARY_TTL);
    }
}
