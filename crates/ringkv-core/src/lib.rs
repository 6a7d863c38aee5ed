//! # RingKV Core
//!
//! Core types shared by every RingKV crate.
//!
//! ## ⚠️ Internal Implementation Detail
//!
//! **This crate is an internal implementation detail of RingKV.**
//!
//! Users should depend on the main `ringkv` crate instead, which provides the
//! server, coordinator and client. This crate's API may change without notice
//! between minor versions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod format_version;
pub mod node;

pub use error::{Error, Result};
pub use node::NodeId;
