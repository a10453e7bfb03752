//! Shared foundational types used across the opcache workspace.
//!
//! This crate provides the two hashing primitives the cache relies on: a fast
//! non-cryptographic [`ContentHash`] for integrity checks on stored payloads, and
//! a cryptographic [`FileDigest`] used to build content-addressed cache keys.

#![warn(missing_docs)]

pub mod digest;
pub mod hash;

pub use digest::FileDigest;
pub use hash::ContentHash;
