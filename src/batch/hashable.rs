//! Structural hashing for deterministic cache key generation.
//!
//! Cache keys for the collate and forward stages are hex-encoded SHA-256
//! hashes of the input structure. Hashing recurses through mapping keys and
//! values and through ordered sequences; opaque leaves hash by their
//! identity token. A structure containing a token-less opaque leaf has no
//! key at all, and callers treat the computation as uncacheable rather than
//! failing.

use sha2::{Digest, Sha256};

use crate::batch::Feature;
use crate::component::trainable::TensorMap;

/// Trait for values that may produce a deterministic content hash.
///
/// Implementations must ensure that structurally equal values produce the
/// same hash, and may return `None` when no stable key exists.
pub trait ContentHashable {
    /// A hex-encoded SHA-256 hash of this content, if one can be computed.
    fn content_hash(&self) -> Option<String>;
}

impl ContentHashable for Feature {
    fn content_hash(&self) -> Option<String> {
        let mut hasher = Sha256::new();
        if !update(&mut hasher, self) {
            return None;
        }
        Some(hex_encode(hasher.finalize()))
    }
}

impl ContentHashable for [Feature] {
    fn content_hash(&self) -> Option<String> {
        let mut hasher = Sha256::new();
        hasher.update(b"column");
        hasher.update((self.len() as u64).to_le_bytes());
        for item in self {
            if !update(&mut hasher, item) {
                return None;
            }
        }
        Some(hex_encode(hasher.finalize()))
    }
}

impl ContentHashable for TensorMap {
    fn content_hash(&self) -> Option<String> {
        let mut hasher = Sha256::new();
        hasher.update(b"tensors");
        hasher.update((self.tensors.len() as u64).to_le_bytes());
        for (key, tensor) in &self.tensors {
            hasher.update((key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            hasher.update((tensor.shape.len() as u64).to_le_bytes());
            for dim in &tensor.shape {
                hasher.update((*dim as u64).to_le_bytes());
            }
            for value in &tensor.data {
                hasher.update(value.to_bits().to_le_bytes());
            }
        }
        Some(hex_encode(hasher.finalize()))
    }
}

/// Feed one feature value into the hasher. Returns false when the value
/// contains an unhashable opaque leaf.
fn update(hasher: &mut Sha256, feature: &Feature) -> bool {
    match feature {
        Feature::Null => hasher.update([0u8]),
        Feature::Bool(v) => {
            hasher.update([1u8]);
            hasher.update([*v as u8]);
        },
        Feature::Int(v) => {
            hasher.update([2u8]);
            hasher.update(v.to_le_bytes());
        },
        Feature::Float(v) => {
            hasher.update([3u8]);
            hasher.update(v.to_bits().to_le_bytes());
        },
        Feature::Str(v) => {
            hasher.update([4u8]);
            hasher.update((v.len() as u64).to_le_bytes());
            hasher.update(v.as_bytes());
        },
        Feature::Ints(v) => {
            hasher.update([5u8]);
            hasher.update((v.len() as u64).to_le_bytes());
            for item in v {
                hasher.update(item.to_le_bytes());
            }
        },
        Feature::Floats(v) => {
            hasher.update([6u8]);
            hasher.update((v.len() as u64).to_le_bytes());
            for item in v {
                hasher.update(item.to_bits().to_le_bytes());
            }
        },
        Feature::Seq(items) => {
            hasher.update([7u8]);
            hasher.update((items.len() as u64).to_le_bytes());
            for item in items {
                if !update(hasher, item) {
                    return false;
                }
            }
        },
        Feature::Map(map) => {
            hasher.update([8u8]);
            hasher.update((map.len() as u64).to_le_bytes());
            for (key, value) in map {
                hasher.update((key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                if !update(hasher, value) {
                    return false;
                }
            }
        },
        Feature::Opaque(leaf) => match leaf.token() {
            Some(token) => {
                hasher.update([9u8]);
                hasher.update(token.to_le_bytes());
            },
            None => return false,
        },
    }
    true
}

// hex encoding helper (avoiding a dependency)
fn hex_encode(bytes: impl AsRef<[u8]>) -> String {
    bytes
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::OpaqueFeature;

    #[test]
    fn test_equal_structures_hash_equal() {
        let mut a = Feature::map();
        a.insert("tokens", Feature::Ints(vec![1, 2]));
        let mut b = Feature::map();
        b.insert("tokens", Feature::Ints(vec![1, 2]));
        assert_eq!(a.content_hash(), b.content_hash());
        assert!(a.content_hash().is_some());
    }

    #[test]
    fn test_different_structures_hash_differently() {
        let a = Feature::Ints(vec![1, 2]);
        let b = Feature::Ints(vec![2, 1]);
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_scalar_and_sequence_do_not_collide() {
        // [1] as a sequence must not hash like the scalar 1
        let scalar = Feature::Int(1);
        let seq = Feature::Seq(vec![Feature::Int(1)]);
        assert_ne!(scalar.content_hash(), seq.content_hash());
    }

    #[test]
    fn test_unhashable_opaque_leaf() {
        let mut payload = Feature::map();
        payload.insert("handle", Feature::Opaque(OpaqueFeature::new(())));
        assert_eq!(payload.content_hash(), None);
    }

    #[test]
    fn test_tokened_opaque_leaf_is_hashable() {
        let a = Feature::Opaque(OpaqueFeature::with_token((), 42));
        let b = Feature::Opaque(OpaqueFeature::with_token((), 42));
        assert_eq!(a.content_hash(), b.content_hash());
        assert!(a.content_hash().is_some());
    }

    #[test]
    fn test_column_hash_depends_on_order() {
        let column_a = [Feature::Int(1), Feature::Int(2)];
        let column_b = [Feature::Int(2), Feature::Int(1)];
        assert_ne!(column_a.content_hash(), column_b.content_hash());
    }
}
