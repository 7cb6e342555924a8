//! Feature payloads and batches.
//!
//! A trainable component's `preprocess` produces one [`Feature`] per
//! document: a nested mapping from string keys to scalars, sequences or
//! further mappings. Two payloads are identical if and only if they are
//! structurally equal, independent of which document produced them; this is
//! the property the batch compressor and the stage caches rely on.

pub mod compress;
pub mod hashable;

use std::any::Any;
use std::sync::Arc;

use indexmap::IndexMap;

pub use compress::{CompressedBatch, CompressedColumn};
pub use hashable::ContentHashable;

/// A batch of feature payloads: component name to one payload per document,
/// order-preserving.
pub type FeatureBatch = IndexMap<String, Vec<Feature>>;

/// An opaque leaf value inside a feature payload.
///
/// Opaque leaves compare by identity, not by content. A leaf may carry an
/// explicit identity token; leaves without one cannot participate in
/// structural hashing, which silently disables caching for payloads that
/// contain them.
#[derive(Clone)]
pub struct OpaqueFeature {
    value: Arc<dyn Any + Send + Sync>,
    token: Option<u64>,
}

impl OpaqueFeature {
    /// Wrap a value with no identity token (unhashable).
    pub fn new(value: impl Any + Send + Sync) -> Self {
        Self {
            value: Arc::new(value),
            token: None,
        }
    }

    /// Wrap a value with a stable identity token.
    pub fn with_token(value: impl Any + Send + Sync, token: u64) -> Self {
        Self {
            value: Arc::new(value),
            token: Some(token),
        }
    }

    /// The identity token, if any.
    pub fn token(&self) -> Option<u64> {
        self.token
    }

    /// Downcast the wrapped value.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl PartialEq for OpaqueFeature {
    fn eq(&self, other: &Self) -> bool {
        // Identity comparison: same allocation, or same explicit token.
        Arc::ptr_eq(&self.value, &other.value)
            || matches!((self.token, other.token), (Some(a), Some(b)) if a == b)
    }
}

impl std::fmt::Debug for OpaqueFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpaqueFeature")
            .field("token", &self.token)
            .finish()
    }
}

/// A nested feature value produced by `preprocess` for one document.
#[derive(Debug, Clone)]
pub enum Feature {
    /// Absent value.
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// Float scalar. Compared and hashed by bit pattern.
    Float(f64),
    /// String scalar.
    Str(String),
    /// Dense integer sequence (token ids, offsets).
    Ints(Vec<i64>),
    /// Dense float sequence.
    Floats(Vec<f32>),
    /// Ordered sequence of nested values.
    Seq(Vec<Feature>),
    /// Nested mapping, in insertion order.
    Map(IndexMap<String, Feature>),
    /// Opaque leaf, compared by identity.
    Opaque(OpaqueFeature),
}

impl Feature {
    /// An empty nested mapping.
    pub fn map() -> Feature {
        Feature::Map(IndexMap::new())
    }

    /// Insert into a `Map` value. Returns whether the value was stored;
    /// non-map variants reject the insertion.
    pub fn insert(&mut self, key: impl Into<String>, value: Feature) -> bool {
        if let Feature::Map(map) = self {
            map.insert(key.into(), value);
            true
        } else {
            false
        }
    }

    /// Look up a key in a `Map` value.
    pub fn get(&self, key: &str) -> Option<&Feature> {
        match self {
            Feature::Map(map) => map.get(key),
            _ => None,
        }
    }
}

impl PartialEq for Feature {
    fn eq(&self, other: &Self) -> bool {
        use Feature::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            // Bit-pattern comparison keeps the compression round trip exact
            // even for NaN payloads.
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Str(a), Str(b)) => a == b,
            (Ints(a), Ints(b)) => a == b,
            (Floats(a), Floats(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
            },
            (Seq(a), Seq(b)) => a == b,
            (Map(a), Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va == vb)
            },
            (Opaque(a), Opaque(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i64> for Feature {
    fn from(v: i64) -> Self {
        Feature::Int(v)
    }
}

impl From<f64> for Feature {
    fn from(v: f64) -> Self {
        Feature::Float(v)
    }
}

impl From<&str> for Feature {
    fn from(v: &str) -> Self {
        Feature::Str(v.to_string())
    }
}

impl From<Vec<i64>> for Feature {
    fn from(v: Vec<i64>) -> Self {
        Feature::Ints(v)
    }
}

impl From<Vec<f32>> for Feature {
    fn from(v: Vec<f32>) -> Self {
        Feature::Floats(v)
    }
}
