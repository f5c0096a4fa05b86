//! Dual-Control Escrow
//!
//! Withdrawals at or above `dual_control_withdrawal_threshold` need two
//! distinct admins. The first approve opens an escrow holding a snapshot of
//! the withdrawal; the second admin's approve performs the payout. Lock
//! order is escrow row, then withdrawal row, then user row.
//!
//! Expiry only closes the escrow. The debited withdrawal stays PENDING
//! until an admin rejects it or starts a new approval.

pub mod error;
pub mod service;

pub use error::EscrowError;
pub use service::{ApprovalOutcome, EscrowApproval, EscrowService};
