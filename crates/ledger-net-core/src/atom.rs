//! Signed atoms as seen by the network layer.
//!
//! The ledger data model is opaque here: an atom is a signed payload plus
//! the routing keys it touches.

use std::collections::BTreeSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::types::{AtomId, Shard};

/// An opaque signed unit of ledger change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAtom {
    /// Content id of `payload`.
    pub aid: AtomId,
    /// Routing keys of every address the atom touches.
    pub shards: BTreeSet<Shard>,
    /// Encoded, signed atom.
    #[serde(with = "hex_bytes")]
    pub payload: Bytes,
}

impl SignedAtom {
    /// Wrap an encoded atom, computing its id.
    pub fn new(payload: impl Into<Bytes>, shards: impl IntoIterator<Item = Shard>) -> Result<Self> {
        let payload = payload.into();
        let shards: BTreeSet<Shard> = shards.into_iter().collect();
        if shards.is_empty() {
            return Err(CoreError::AtomWithoutShards);
        }
        Ok(Self {
            aid: AtomId::of(&payload),
            shards,
            payload,
        })
    }

    /// Check that the declared id matches the payload.
    pub fn verify_id(&self) -> Result<()> {
        let computed = AtomId::of(&self.payload);
        if computed != self.aid {
            return Err(CoreError::AtomIdMismatch {
                declared: self.aid.to_hex(),
                computed: computed.to_hex(),
            });
        }
        Ok(())
    }
}

mod hex_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_atom_requires_shards() {
        let err = SignedAtom::new(b"payload".to_vec(), []).unwrap_err();
        assert!(matches!(err, CoreError::AtomWithoutShards));
    }

    #[test]
    fn test_atom_json_shape() {
        let atom = SignedAtom::new(vec![0xde, 0xad], [Shard(-4), Shard(9)]).unwrap();
        let json = serde_json::to_value(&atom).unwrap();

        assert_eq!(json["payload"], "dead");
        assert_eq!(json["shards"], serde_json::json!([-4, 9]));
        assert_eq!(json["aid"], atom.aid.to_hex());

        let back: SignedAtom = serde_json::from_value(json).unwrap();
        assert_eq!(back, atom);
        back.verify_id().unwrap();
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let mut atom = SignedAtom::new(b"original".to_vec(), [Shard(1)]).unwrap();
        atom.payload = Bytes::from_static(b"tampered");
        assert!(matches!(
            atom.verify_id(),
            Err(CoreError::AtomIdMismatch { .. })
        ));
    }
}
