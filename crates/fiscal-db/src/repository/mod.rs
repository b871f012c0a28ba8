//! # Repository Module
//!
//! One repository per table, each a thin owner of a cloned `SqlitePool`.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Service (fiscal-connector)                                             │
//! │       │  db.receipts().claim_batch(store, device, 10, lease, 5)         │
//! │       ▼                                                                 │
//! │  ReceiptRepository ── guarded UPDATE ... RETURNING *                    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite (WAL)                                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`ReceiptRepository`](receipt::ReceiptRepository) - Fiscal attempts and their transitions
//! - [`DeviceRepository`](device::DeviceRepository) - Paired connector agents
//! - [`PairingCodeRepository`](pairing::PairingCodeRepository) - Single-use codes, redemption
//! - [`ComplianceRepository`](compliance::ComplianceRepository) - Store fiscal settings

pub mod compliance;
pub mod device;
pub mod pairing;
pub mod receipt;
