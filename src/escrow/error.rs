use thiserror::Error;

use crate::core_types::{AdminId, EscrowId};
use crate::models::EscrowStatus;
use crate::store::StoreError;
use crate::withdrawal::WithdrawalError;

#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("Escrow not found: {0}")]
    NotFound(EscrowId),

    #[error("Admin {admin_id} cannot approve escrow {escrow_id} they initiated")]
    SelfApproval {
        escrow_id: EscrowId,
        admin_id: AdminId,
    },

    #[error("Escrow {escrow_id} already processed: {status}")]
    AlreadyProcessed {
        escrow_id: EscrowId,
        status: EscrowStatus,
    },

    #[error("Escrow {0} has expired")]
    Expired(EscrowId),

    #[error("Escrow {0} is already being processed")]
    AlreadyProcessing(EscrowId),

    #[error("Escrow {0} snapshot does not match the withdrawal")]
    SnapshotMismatch(EscrowId),

    #[error("Invalid escrow operation data: {0}")]
    InvalidOperationData(#[from] serde_json::Error),

    #[error("Withdrawal error: {0}")]
    Withdrawal(#[from] WithdrawalError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl EscrowError {
    pub fn code(&self) -> &'static str {
        match self {
            EscrowError::NotFound(_) => "ESCROW_NOT_FOUND",
            EscrowError::SelfApproval { .. } => "SELF_APPROVAL",
            EscrowError::AlreadyProcessed { .. } => "ESCROW_ALREADY_PROCESSED",
            EscrowError::Expired(_) => "ESCROW_EXPIRED",
            EscrowError::AlreadyProcessing(_) => "ESCROW_BUSY",
            EscrowError::SnapshotMismatch(_) => "ESCROW_SNAPSHOT_MISMATCH",
            EscrowError::InvalidOperationData(_) => "INTERNAL_ERROR",
            EscrowError::Withdrawal(e) => e.code(),
            EscrowError::Store(_) => "INTERNAL_ERROR",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            EscrowError::NotFound(_) => "Approval request not found.".to_string(),
            EscrowError::SelfApproval { .. } => {
                "You cannot approve an operation you initiated. A second admin must approve it."
                    .to_string()
            }
            EscrowError::AlreadyProcessed { status, .. } => {
                format!("This approval request was already processed ({}).", status)
            }
            EscrowError::Expired(_) => {
                "This approval request has expired. Please start a new one.".to_string()
            }
            EscrowError::AlreadyProcessing(_) => {
                "Another admin is processing this request right now.".to_string()
            }
            EscrowError::SnapshotMismatch(_) => {
                "The withdrawal changed after this approval was requested. Please review it again."
                    .to_string()
            }
            EscrowError::Withdrawal(e) => e.user_message(),
            EscrowError::InvalidOperationData(_) | EscrowError::Store(_) => {
                "Something went wrong. Please try again later.".to_string()
            }
        }
    }
}

impl crate::backoff::LockConflict for EscrowError {
    fn is_lock_conflict(&self) -> bool {
        match self {
            EscrowError::Store(e) => e.is_lock_unavailable(),
            EscrowError::Withdrawal(e) => crate::backoff::LockConflict::is_lock_conflict(e),
            _ => false,
        }
    }
}
