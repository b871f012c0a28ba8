//! # fiscal-core: Pure Fiscalization Rules
//!
//! Types and rules of the fiscal receipt pipeline with zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Fiscal Pipeline Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │        Host application (sale completed) / Connector agents     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ dispatch / HTTP                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    fiscal-connector                             │   │
//! │  │   Router ─ Queue ─ Pairing ─ Reclaimer ─ RetryScheduler         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ fiscal-core (THIS CRATE) ★                      │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐   │   │
//! │  │   │   types   │  │ lifecycle │  │   retry   │  │ validation│   │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘   │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    fiscal-db (SQLite)                           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Receipt, device, pairing code, compliance profile
//! - [`lifecycle`] - Status transition table and push disposition
//! - [`retry`] - Attempt ceiling and dead-letter decision
//! - [`validation`] - Connector push / pairing input checks
//! - [`error`] - Domain error types

pub mod error;
pub mod lifecycle;
pub mod retry;
pub mod types;
pub mod validation;

pub use error::{CoreError, CoreResult, ValidationError};
pub use lifecycle::PushDisposition;
pub use retry::{RetryDecision, RetryPolicy};
pub use types::*;
pub use validation::{PushOutcome, ResultPush, ValidatedPush};

/// Default lease granted to a connector on pull (seconds).
pub const DEFAULT_LEASE_SECS: i64 = 120;

/// Window in which a device poll counts as "online" (seconds).
pub const DEFAULT_ONLINE_WINDOW_SECS: i64 = 120;
