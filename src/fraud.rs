//! Fraud-risk scoring seam
//!
//! Scoring lives in a separate component; this crate only asks for a 0-100
//! score per withdrawal request and compares it to the block threshold.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::core_types::UserId;

#[derive(Debug, Error)]
#[error("Fraud scoring unavailable: {0}")]
pub struct FraudError(pub String);

#[async_trait]
pub trait FraudDetector: Send + Sync {
    /// Risk score in `0..=100`
    async fn risk_score(&self, user_id: UserId, amount: Decimal) -> Result<u8, FraudError>;
}

/// Scores everyone 0
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledFraudDetector;

#[async_trait]
impl FraudDetector for DisabledFraudDetector {
    async fn risk_score(&self, _user_id: UserId, _amount: Decimal) -> Result<u8, FraudError> {
        Ok(0)
    }
}

/// Fixed per-user scores, for tests and manual overrides
#[derive(Debug, Default)]
pub struct StaticFraudDetector {
    scores: Mutex<HashMap<UserId, Result<u8, String>>>,
}

impl StaticFraudDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_score(&self, user_id: UserId, score: u8) {
        self.scores
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(user_id, Ok(score.min(100)));
    }

    pub fn set_unavailable(&self, user_id: UserId, reason: &str) {
        self.scores
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(user_id, Err(reason.to_string()));
    }
}

#[async_trait]
impl FraudDetector for StaticFraudDetector {
    async fn risk_score(&self, user_id: UserId, _amount: Decimal) -> Result<u8, FraudError> {
        match self
            .scores
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&user_id)
        {
            Some(Ok(score)) => Ok(*score),
            Some(Err(reason)) => Err(FraudError(reason.clone())),
            None => Ok(0),
        }
    }
}
