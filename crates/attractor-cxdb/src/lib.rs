//! CXDB HTTP client for Attractor.
//!
//! Implements the consumed half of the CXDB HTTP surface: context creation,
//! idempotent turn append, turn listing for resume, registry-bundle publish,
//! and the health probe. The client also implements
//! [`attractor_journal::TurnStore`], so the journal writer and the resume
//! engine address local and remote stores through one trait.

pub mod client;

pub use client::{AppendTurnResponse, CxdbClient, CxdbClientError, DEFAULT_CXDB_HTTP_BASE_URL};
