use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

use crate::chain::events::EventKind;
use crate::payout::models::PayoutExecResult;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Off-ramp error: {0}")]
    Offramp(#[from] OfframpError),

    #[error("Data integrity violation: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Payout error: {0}")]
    Payout(#[from] PayoutError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized")]
    Unauthorized,
}

/// Ledger client failures. Always transient from the indexer's point of view.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("RPC transport failed: {0}")]
    Transport(String),

    #[error("RPC returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("{method} timed out after {secs}s")]
    Timeout { method: &'static str, secs: u64 },

    #[error("Malformed RPC response: {0}")]
    InvalidResponse(String),
}

/// Off-ramp provider failures
#[derive(Error, Debug)]
pub enum OfframpError {
    #[error("Off-ramp provider unreachable: {0}")]
    Unavailable(String),

    #[error("Off-ramp call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Off-ramp rejected settlement: {0}")]
    Rejected(String),

    #[error("Unsupported fiat currency: {0}")]
    UnsupportedCurrency(String),

    #[error("Amount cannot be converted: {0}")]
    InvalidAmount(String),
}

impl OfframpError {
    /// Provider trouble that may clear on its own; rejections and bad input won't
    pub fn is_transient(&self) -> bool {
        matches!(self, OfframpError::Unavailable(_) | OfframpError::Timeout { .. })
    }
}

/// Decode and invariant violations. Fatal for the current chunk or update.
#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("Failed to decode {kind:?} log in tx {tx_hash}: {reason}")]
    Decode {
        kind: EventKind,
        tx_hash: String,
        reason: String,
    },

    #[error("Allocation for event {event_id} sums to {total_bps} bps, expected 10000")]
    InvalidSplitSum { event_id: u64, total_bps: u64 },

    #[error("Allocation for event {event_id} is malformed: {reason}")]
    MalformedAllocation { event_id: u64, reason: String },

    #[error("{field} value {value} is out of range")]
    ValueOutOfRange { field: &'static str, value: String },

    #[error("Payout of {requested} wei for event {event_id} exceeds undistributed {available} wei")]
    OverDistribution {
        event_id: u64,
        requested: String,
        available: String,
    },

    #[error("Stored amount is not a valid uint256: {0}")]
    InvalidAmount(String),

    #[error("Payout {id} cannot move from {from} to {to}")]
    InvalidPayoutTransition { id: i64, from: String, to: String },
}

/// Business outcomes of a payout request
#[derive(Error, Debug)]
pub enum PayoutError {
    #[error("No donations for event {0}")]
    NoFunds(u64),

    #[error("All funds already paid out for event {0}")]
    AlreadyDistributed(u64),

    #[error("No allocation or donations to derive a split for event {0}")]
    NoAllocationOrDonations(u64),

    #[error("Event {event_id} has unreconciled in-flight payouts {payout_ids:?}")]
    SettlementInFlight { event_id: u64, payout_ids: Vec<i64> },

    #[error(
        "Partial settlement for event {}: {} share(s) failed, {} completed",
        .0.event_id, .0.failures.len(), .0.payouts.len()
    )]
    PartialSettlement(Box<PayoutExecResult>),
}

/// Error classes the scheduler and API layer act on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientIo,
    DataIntegrity,
    Domain,
    PartialSettlement,
    Internal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Ledger(_) => ErrorKind::TransientIo,
            AppError::Offramp(e) if e.is_transient() => ErrorKind::TransientIo,
            AppError::Offramp(OfframpError::InvalidAmount(_)) => ErrorKind::DataIntegrity,
            AppError::Offramp(_) => ErrorKind::Domain,
            AppError::Integrity(_) => ErrorKind::DataIntegrity,
            AppError::Payout(PayoutError::PartialSettlement(_)) => ErrorKind::PartialSettlement,
            AppError::Payout(_) | AppError::NotFound(_) | AppError::InvalidInput(_) => {
                ErrorKind::Domain
            }
            AppError::Unauthorized => ErrorKind::Domain,
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether calling again later can succeed without operator action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientIo | ErrorKind::PartialSettlement
        ) || matches!(self, AppError::Database(_))
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let (status, error_code, message, details) = match &self {
            AppError::Payout(PayoutError::NoFunds(event_id)) => (
                StatusCode::BAD_REQUEST,
                "NO_FUNDS",
                self.to_string(),
                Some(serde_json::json!({ "event_id": event_id })),
            ),
            AppError::Payout(PayoutError::AlreadyDistributed(event_id)) => (
                StatusCode::CONFLICT,
                "ALREADY_DISTRIBUTED",
                self.to_string(),
                Some(serde_json::json!({ "event_id": event_id })),
            ),
            AppError::Payout(PayoutError::NoAllocationOrDonations(event_id)) => (
                StatusCode::BAD_REQUEST,
                "NO_ALLOCATION_OR_DONATIONS",
                self.to_string(),
                Some(serde_json::json!({ "event_id": event_id })),
            ),
            AppError::Payout(PayoutError::SettlementInFlight { event_id, payout_ids }) => (
                StatusCode::CONFLICT,
                "SETTLEMENT_IN_FLIGHT",
                self.to_string(),
                Some(serde_json::json!({ "event_id": event_id, "payout_ids": payout_ids })),
            ),
            AppError::Payout(PayoutError::PartialSettlement(result)) => (
                StatusCode::BAD_GATEWAY,
                "PARTIAL_SETTLEMENT",
                self.to_string(),
                serde_json::to_value(result.as_ref()).ok(),
            ),
            AppError::Integrity(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "DATA_INTEGRITY",
                self.to_string(),
                None,
            ),
            AppError::Ledger(_) => (
                StatusCode::BAD_GATEWAY,
                "LEDGER_UNAVAILABLE",
                self.to_string(),
                None,
            ),
            AppError::Offramp(e) if e.is_transient() => (
                StatusCode::BAD_GATEWAY,
                "OFFRAMP_UNAVAILABLE",
                self.to_string(),
                None,
            ),
            AppError::Offramp(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "OFFRAMP_REJECTED",
                self.to_string(),
                None,
            ),
            AppError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                self.to_string(),
                None,
            ),
            AppError::InvalidInput(_) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                self.to_string(),
                None,
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                self.to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            AppError::Config(_) | AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            kind,
            details,
        });

        (status, body).into_response()
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transient: AppError = LedgerError::Timeout {
            method: "eth_getLogs",
            secs: 10,
        }
        .into();
        assert_eq!(transient.kind(), ErrorKind::TransientIo);
        assert!(transient.is_retryable());

        let integrity: AppError = IntegrityError::InvalidSplitSum {
            event_id: 1,
            total_bps: 9999,
        }
        .into();
        assert_eq!(integrity.kind(), ErrorKind::DataIntegrity);
        assert!(!integrity.is_retryable());

        let domain: AppError = PayoutError::AlreadyDistributed(7).into();
        assert_eq!(domain.kind(), ErrorKind::Domain);
        assert!(!domain.is_retryable());
    }

    #[test]
    fn test_offramp_rejections_are_not_retried() {
        let unavailable: AppError = OfframpError::Unavailable("503".to_string()).into();
        assert_eq!(unavailable.kind(), ErrorKind::TransientIo);
        assert!(unavailable.is_retryable());

        let timeout: AppError = OfframpError::Timeout { secs: 30 }.into();
        assert!(timeout.is_retryable());

        let unsupported: AppError = OfframpError::UnsupportedCurrency("XYZ".to_string()).into();
        assert_eq!(unsupported.kind(), ErrorKind::Domain);
        assert!(!unsupported.is_retryable());

        let rejected: AppError = OfframpError::Rejected("account closed".to_string()).into();
        assert_eq!(rejected.kind(), ErrorKind::Domain);
        assert!(!rejected.is_retryable());
        assert_eq!(
            rejected.into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );

        let bad_amount: AppError = OfframpError::InvalidAmount("2^256".to_string()).into();
        assert_eq!(bad_amount.kind(), ErrorKind::DataIntegrity);
    }

    #[test]
    fn test_partial_settlement_is_retryable() {
        let result = PayoutExecResult {
            event_id: 3,
            total_wei: alloy_primitives::U256::from(10u64),
            payouts: vec![],
            failures: vec![],
            held: vec![],
        };
        let err: AppError = PayoutError::PartialSettlement(Box::new(result)).into();
        assert_eq!(err.kind(), ErrorKind::PartialSettlement);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("event 3"));
    }
}
