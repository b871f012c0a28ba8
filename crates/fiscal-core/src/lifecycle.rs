//! # Receipt Lifecycle
//!
//! Allowed status transitions of a [`FiscalReceipt`](crate::FiscalReceipt).
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Transition Table                                   │
//! │                                                                         │
//! │   from \ to     QUEUED     PROCESSING     SENT      FAILED              │
//! │   ──────────    ──────     ──────────     ────      ──────              │
//! │   QUEUED          -        claim          push      push / dead-letter  │
//! │   PROCESSING    reclaim       -           push      push / dead-letter  │
//! │   SENT            -           -             -         -                 │
//! │   FAILED          -           -             -         -                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The database enforces the same table through `WHERE status = ...` guards.
//! [`push_disposition`] reads it to decide whether a connector report is
//! applied or acknowledged as a no-op.

use crate::types::FiscalStatus;

/// Whether `from → to` is a legal move.
pub fn can_transition(from: FiscalStatus, to: FiscalStatus) -> bool {
    use FiscalStatus::*;

    matches!(
        (from, to),
        (Queued, Processing)
            | (Processing, Queued)
            | (Queued, Sent)
            | (Queued, Failed)
            | (Processing, Sent)
            | (Processing, Failed)
    )
}

/// What to do with a connector's result report given the receipt's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDisposition {
    /// Apply the reported terminal status.
    Apply,
    /// Already terminal: acknowledge, change nothing.
    AlreadyResolved,
}

/// Decides how a push reporting `reported` is handled.
///
/// Late pushes against a reclaimed (QUEUED) receipt are still honored: the
/// agent finished real work on the hardware.
pub fn push_disposition(current: FiscalStatus, reported: FiscalStatus) -> PushDisposition {
    if can_transition(current, reported) {
        PushDisposition::Apply
    } else {
        PushDisposition::AlreadyResolved
    }
}
