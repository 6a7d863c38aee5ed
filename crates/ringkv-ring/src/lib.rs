//! # RingKV Ring
//!
//! Consistent hashing for RingKV: placement of keys and nodes on a circular
//! hash space, arithmetic over arcs of that space, and the text encoding of
//! ring membership that servers, the coordinator and clients exchange.
//!
//! ## ⚠️ Internal Implementation Detail
//!
//! **This crate is an internal implementation detail of RingKV.**
//!
//! Users should depend on the main `ringkv` crate instead. This crate's API
//! may change without notice between minor versions.
//!
//! ---
//!
//! ```text
//!            0
//!        ┌───────┐
//!   C ●  │       │  ● A      A owns (C, A]
//!        │ ring  │           B owns (A, B]
//!        └───────┘           C owns (B, C]
//!            ● B
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hashing;
pub mod range;
pub mod ring;

pub use hashing::{DebugHash, HashAlgorithm, Md5Hash, SharedHasher};
pub use range::RingRange;
pub use ring::HashRing;
