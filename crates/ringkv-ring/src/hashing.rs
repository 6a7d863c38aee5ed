//! Hash functions that place keys and nodes on the ring.

use ringkv_core::{Error, NodeId, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Prefix used when hash values travel as command arguments
pub const HEX_PREFIX: &str = "0x";

/// Maps byte strings onto a fixed-width ring position.
pub trait HashAlgorithm: Send + Sync {
    /// Position of an arbitrary byte string
    fn hash(&self, bytes: &[u8]) -> u128;

    /// Largest position this algorithm produces
    fn max(&self) -> u128;

    /// Width of the hash space in bits
    fn bits(&self) -> u32;

    /// Position of a user key
    fn hash_key(&self, key: &str) -> u128 {
        self.hash(key.as_bytes())
    }

    /// Position of a node, computed from its `address:port` form
    fn hash_node(&self, node: &NodeId) -> u128 {
        self.hash(node.to_string().as_bytes())
    }

    /// Number of hex digits needed for the largest position
    fn hex_width(&self) -> usize {
        self.bits().div_ceil(4) as usize
    }
}

/// 128-bit MD5 placement. This is the algorithm every production node uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Md5Hash;

impl HashAlgorithm for Md5Hash {
    fn hash(&self, bytes: &[u8]) -> u128 {
        u128::from_be_bytes(md5::compute(bytes).0)
    }

    fn max(&self) -> u128 {
        u128::MAX
    }

    fn bits(&self) -> u32 {
        128
    }
}

/// Placement algorithm chosen at runtime and shared between components
pub type SharedHasher = Arc<dyn HashAlgorithm>;

impl<H: HashAlgorithm + ?Sized> HashAlgorithm for Arc<H> {
    fn hash(&self, bytes: &[u8]) -> u128 {
        (**self).hash(bytes)
    }

    fn max(&self) -> u128 {
        (**self).max()
    }

    fn bits(&self) -> u32 {
        (**self).bits()
    }

    fn hash_key(&self, key: &str) -> u128 {
        (**self).hash_key(key)
    }

    fn hash_node(&self, node: &NodeId) -> u128 {
        (**self).hash_node(node)
    }
}

/// Small, predictable hash space for tests and local experiments.
///
/// Strings registered with [`DebugHash::with`] map to their pinned position,
/// decimal strings map to their value modulo the space size, and anything
/// else falls back to MD5 folded into the space.
#[derive(Debug, Clone, Default)]
pub struct DebugHash {
    max: u128,
    pinned: HashMap<String, u128>,
}

impl DebugHash {
    /// Hash space `[0, max]`
    pub fn new(max: u128) -> Self {
        Self {
            max,
            pinned: HashMap::new(),
        }
    }

    /// Pin `input` to `position`
    pub fn with(mut self, input: impl Into<String>, position: u128) -> Self {
        self.pinned.insert(input.into(), position.min(self.max));
        self
    }

    /// Pin a node's `address:port` form to `position`
    pub fn with_node(self, node: &NodeId, position: u128) -> Self {
        self.with(node.to_string(), position)
    }

    fn fold(&self, value: u128) -> u128 {
        match self.max.checked_add(1) {
            Some(size) => value % size,
            None => value,
        }
    }
}

impl HashAlgorithm for DebugHash {
    fn hash(&self, bytes: &[u8]) -> u128 {
        let text = String::from_utf8_lossy(bytes);
        if let Some(position) = self.pinned.get(text.as_ref()) {
            return *position;
        }
        if let Ok(value) = text.parse::<u128>() {
            return self.fold(value);
        }
        self.fold(u128::from_be_bytes(md5::compute(bytes).0))
    }

    fn max(&self) -> u128 {
        self.max
    }

    fn bits(&self) -> u32 {
        128 - self.max.leading_zeros()
    }
}

/// Lower-case hex without padding or prefix
pub fn to_hex(value: u128) -> String {
    format!("{:x}", value)
}

/// Lower-case hex, zero-padded to `width` digits
///
/// Padded hashes sort lexicographically in numeric order, which the
/// key-value layer relies on for range scans.
pub fn to_hex_padded(value: u128, width: usize) -> String {
    format!("{:0width$x}", value, width = width)
}

/// Lower-case hex with the `0x` prefix
pub fn to_hex_prefixed(value: u128) -> String {
    format!("{}{:x}", HEX_PREFIX, value)
}

/// Parse hex with or without the `0x` prefix
pub fn parse_hex(text: &str) -> Result<u128> {
    let digits = text.trim();
    let digits = digits.strip_prefix(HEX_PREFIX).unwrap_or(digits);
    if digits.is_empty() {
        return Err(Error::MalformedMetadata(format!(
            "Empty hash value '{}'",
            text
        )));
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| Error::MalformedMetadata(format!("Invalid hash value '{}': {}", text, e)))
}
