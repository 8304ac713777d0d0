//! LENDBOT: loan harvesting and bidding agent for a P2P lending marketplace.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod api;
pub mod config;
pub mod engine;
pub mod marketplace;
pub mod storage;
pub mod totp;
pub mod types;
