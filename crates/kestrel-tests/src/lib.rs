//! Shared helpers for the Kestrel integration and property tests.

pub mod helpers;
