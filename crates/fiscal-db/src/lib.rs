//! # fiscal-db: Persistence for the Fiscal Pipeline
//!
//! SQLite storage behind sqlx. Every cross-request transition (claim, push,
//! reclaim, dead-letter, code redemption) is a single guarded statement or a
//! single transaction, so any number of server instances can share one
//! database.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  fiscal-connector services                                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   fiscal-db (THIS CRATE)                        │   │
//! │  │   Database (pool.rs) ── Repositories ── Migrations (embedded)   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (WAL)                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fiscal_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("fiscal.db")).await?;
//! let open = db.receipts().open_for_sale("sale-42").await?;
//! ```

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::compliance::ComplianceRepository;
pub use repository::device::DeviceRepository;
pub use repository::pairing::{NewDevice, PairingCodeRepository};
pub use repository::receipt::{CreateOutcome, NewAttempt, ReceiptRepository};
