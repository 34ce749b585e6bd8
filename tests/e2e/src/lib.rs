//! End-to-end test support for the remanence workspace
//!
//! The harness provides a deterministic encoder (no model download, no
//! network) and tempdir-backed service instances so every journey test
//! runs in isolation.

pub mod harness;
