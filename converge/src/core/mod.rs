//! Deterministic, pure logic shared by the reconciliation engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod differ;
pub mod facts;
pub mod inventory;
pub mod operations;
pub mod parsers;
pub mod registry;
pub mod shell;
pub mod template;
pub mod threshold;
pub mod types;
