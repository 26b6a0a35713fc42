//! Data model: refs, packs, update records and delta chains
//!
//! Oids are opaque strings; the empty string means "the ref does not exist
//! yet". All wire-facing types serialize with camelCase field names.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix of every pack id
pub const PACK_ID_PREFIX: &str = "raw-";

/// Suffix of every pack id
pub const PACK_ID_SUFFIX: &str = ".pack";

/// Derive the pack id for a byte sequence.
///
/// Pack ids are content addressed: identical bytes always map to the same
/// id, so re-uploading a pack is idempotent.
pub fn pack_id_for(data: &[u8]) -> (String, String) {
    let sha256 = hex::encode(Sha256::digest(data));
    (format!("{}{}{}", PACK_ID_PREFIX, sha256, PACK_ID_SUFFIX), sha256)
}

/// Check that `id` has the shape `raw-<64 lowercase hex>.pack`.
pub fn is_valid_pack_id(id: &str) -> bool {
    let Some(hash) = id
        .strip_prefix(PACK_ID_PREFIX)
        .and_then(|rest| rest.strip_suffix(PACK_ID_SUFFIX))
    else {
        return false;
    };
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Metadata of a stored pack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackInfo {
    pub pack_id: String,
    pub sha256: String,
    pub size: u64,
}

/// Current state of one ref
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefEntry {
    pub name: String,
    pub oid: String,
    /// Pack whose application produced `oid`
    pub pack_id: String,
}

/// One proposed ref transition within a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefUpdate {
    pub name: String,
    #[serde(default)]
    pub old_oid: String,
    pub new_oid: String,
    pub pack_id: String,
    /// Optional client assertion of the pack length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Optional client assertion of the pack digest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl RefUpdate {
    pub fn new(
        name: impl Into<String>,
        old_oid: impl Into<String>,
        new_oid: impl Into<String>,
        pack_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            old_oid: old_oid.into(),
            new_oid: new_oid.into(),
            pack_id: pack_id.into(),
            size: None,
            sha256: None,
        }
    }
}

/// An accepted ref transition, as kept in the update log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRecord {
    /// Position in the repository-wide log, starting at 1
    pub seq: u64,
    pub name: String,
    pub old_oid: String,
    pub new_oid: String,
    pub pack_id: String,
    pub size: u64,
    pub sha256: String,
    /// Commit time (Unix seconds, UTC)
    pub timestamp: i64,
}

/// Record contents before the log assigns a sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUpdateRecord {
    pub name: String,
    pub old_oid: String,
    pub new_oid: String,
    pub pack_id: String,
    pub size: u64,
    pub sha256: String,
    pub timestamp: i64,
}

impl NewUpdateRecord {
    pub fn into_record(self, seq: u64) -> UpdateRecord {
        UpdateRecord {
            seq,
            name: self.name,
            old_oid: self.old_oid,
            new_oid: self.new_oid,
            pack_id: self.pack_id,
            size: self.size,
            sha256: self.sha256,
            timestamp: self.timestamp,
        }
    }
}

/// Packs a client must apply, in order, to reach `final_oid`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaChain {
    pub packs: Vec<String>,
    pub final_oid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_id_for_is_content_addressed() {
        let (id1, sha1) = pack_id_for(b"PACK\x00\x00\x00\x02");
        let (id2, sha2) = pack_id_for(b"PACK\x00\x00\x00\x02");
        assert_eq!(id1, id2);
        assert_eq!(sha1, sha2);
        assert_eq!(id1, format!("raw-{}.pack", sha1));
        assert!(is_valid_pack_id(&id1));
    }

    #[test]
    fn test_pack_id_for_empty_input() {
        let (_, sha) = pack_id_for(b"");
        assert_eq!(
            sha,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_invalid_pack_ids() {
        assert!(!is_valid_pack_id(""));
        assert!(!is_valid_pack_id("raw-.pack"));
        assert!(!is_valid_pack_id("raw-abc.pack"));
        assert!(!is_valid_pack_id("../refs.json"));
        let upper = format!("raw-{}.pack", "A".repeat(64));
        assert!(!is_valid_pack_id(&upper));
        let traversal = format!("raw-{}/../x.pack", "a".repeat(58));
        assert!(!is_valid_pack_id(&traversal));
    }

    #[test]
    fn test_ref_update_json_shape() {
        let json = r#"{"name":"main","newOid":"c1","packId":"p"}"#;
        let update: RefUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.old_oid, "");
        assert_eq!(update.size, None);

        let out = serde_json::to_value(RefUpdate::new("main", "a", "b", "p")).unwrap();
        assert_eq!(out["oldOid"], "a");
        assert!(out.get("sha256").is_none());
    }
}
