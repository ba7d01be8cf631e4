// =============================================================================
// Typed failure taxonomy for order execution and position management
// =============================================================================
//
// I/O errors are converted into these variants at the boundary; no raw error
// crosses a loop boundary. Every loop iteration is a failure domain — one
// market's failure never halts the others.
// =============================================================================

use thiserror::Error;

use crate::risk::VetoReason;

/// Failures that can surface from the order executor and the close path.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Exchange unreachable, timed out, or returned a non-2xx without a
    /// parseable rejection. The caller must not mutate state.
    #[error("exchange transport failure: {0}")]
    Transport(String),

    /// The exchange refused the order (insufficient balance, below minimum,
    /// market suspended). Not retryable.
    #[error("order rejected by exchange: {0}")]
    OrderRejected(String),

    /// Order status could not be read back before the deadline; the position
    /// stays in CLOSING for the next monitor tick to reconcile.
    #[error("order verification failed: {0}")]
    VerificationFailed(String),

    /// Order accepted but executed volume is zero.
    #[error("order executed zero volume (order {0})")]
    ZeroFill(String),

    /// The risk gate denied admission. Never retried within the same tick.
    #[error("risk veto: {0}")]
    RiskVeto(VetoReason),

    /// A circuit breaker is open; wait out the cooldown.
    #[error("circuit breaker open: {0}")]
    CircuitBreakerOpen(String),

    /// Impossible internal state (negative quantity, stale id). Logged at
    /// error level and surfaced to operators.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl ExecutionError {
    /// True when the failure came from the transport layer and the operation
    /// may be retried after backoff.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Machine-readable tag for lifecycle event messages and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "TRANSPORT",
            Self::OrderRejected(_) => "ORDER_REJECTED",
            Self::VerificationFailed(_) => "VERIFICATION_FAILED",
            Self::ZeroFill(_) => "ZERO_FILL",
            Self::RiskVeto(_) => "RISK_VETO",
            Self::CircuitBreakerOpen(_) => "CIRCUIT_BREAKER_OPEN",
            Self::InvariantViolation(_) => "INVARIANT_VIOLATION",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        let err = ExecutionError::Transport("connection refused".into());
        assert!(err.is_transport());
        assert_eq!(err.kind(), "TRANSPORT");
    }

    #[test]
    fn veto_formatting_carries_reason() {
        let err = ExecutionError::RiskVeto(VetoReason::TradeCooldown);
        assert!(err.to_string().contains("TRADE_COOLDOWN"));
        assert!(!err.is_transport());
    }
}
