// =============================================================================
// Position model — one open exposure managed by a single strategy
// =============================================================================
//
// Status machine:
//   OPEN -> CLOSING -> CLOSED
//   OPEN -> CLOSING -> FAILED
//   CLOSING -> OPEN   (only on an exchange-side cancel / transport revert)
//   OPEN -> FAILED    (invalid data guard)
//
// `close_attempt_count` is strictly non-decreasing; `exit_time` is set iff
// the status is terminal. The repository owns every position; monitors hold
// the id and re-read state before any transition.
// =============================================================================

pub mod manager;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Side, StrategyCode};

/// Lifecycle status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
    Failed,
}

impl PositionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "OPEN" => Some(Self::Open),
            "CLOSING" => Some(Self::Closing),
            "CLOSED" => Some(Self::Closed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Why a position left (or failed to leave) the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    Timeout,
    InvalidPosition,
    MaxAttempts,
    MinAmount,
    AlreadyGone,
    SignalExit,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::StopLoss => "STOP_LOSS",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::TrailingStop => "TRAILING_STOP",
            Self::Timeout => "TIMEOUT",
            Self::InvalidPosition => "INVALID_POSITION",
            Self::MaxAttempts => "MAX_ATTEMPTS",
            Self::MinAmount => "MIN_AMOUNT",
            Self::AlreadyGone => "ALREADY_GONE",
            Self::SignalExit => "SIGNAL_EXIT",
            Self::Manual => "MANUAL",
        };
        write!(f, "{tag}")
    }
}

impl ExitReason {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "STOP_LOSS" => Some(Self::StopLoss),
            "TAKE_PROFIT" => Some(Self::TakeProfit),
            "TRAILING_STOP" => Some(Self::TrailingStop),
            "TIMEOUT" => Some(Self::Timeout),
            "INVALID_POSITION" => Some(Self::InvalidPosition),
            "MAX_ATTEMPTS" => Some(Self::MaxAttempts),
            "MIN_AMOUNT" => Some(Self::MinAmount),
            "ALREADY_GONE" => Some(Self::AlreadyGone),
            "SIGNAL_EXIT" => Some(Self::SignalExit),
            "MANUAL" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// A single tracked position. Money fields are decimals; percentages are
/// doubles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub strategy: StrategyCode,
    pub market: String,
    pub side: Side,
    pub status: PositionStatus,
    pub entry_price: Decimal,
    pub filled_quantity: Decimal,
    pub target_quantity: Decimal,
    pub average_exit_price: Option<Decimal>,
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
    pub trailing_active: bool,
    pub trailing_peak_price: Option<Decimal>,
    pub timeout_at: DateTime<Utc>,
    pub exit_reason: Option<ExitReason>,
    pub exit_order_id: Option<String>,
    pub last_close_attempt_at: Option<DateTime<Utc>>,
    pub close_attempt_count: u32,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub realized_pnl: Option<Decimal>,
    pub realized_pnl_percent: Option<f64>,
}

/// Parameters for opening a position from a finalized entry fill.
pub struct PositionOpen {
    pub strategy: StrategyCode,
    pub market: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub filled_quantity: Decimal,
    pub target_quantity: Decimal,
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
    pub timeout_at: DateTime<Utc>,
}

/// Verdict of the close-attempt guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseGate {
    /// Attempt the close now.
    Proceed,
    /// A recent attempt is still in its backoff window.
    Backoff,
    /// Attempt budget exhausted; mark FAILED and stop.
    Exhausted,
}

impl Position {
    pub fn open(params: PositionOpen) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            strategy: params.strategy,
            market: crate::types::normalize_market(&params.market),
            side: params.side,
            status: PositionStatus::Open,
            entry_price: params.entry_price,
            filled_quantity: params.filled_quantity,
            target_quantity: params.target_quantity,
            average_exit_price: None,
            stop_loss_percent: params.stop_loss_percent,
            take_profit_percent: params.take_profit_percent,
            trailing_active: false,
            trailing_peak_price: None,
            timeout_at: params.timeout_at,
            exit_reason: None,
            exit_order_id: None,
            last_close_attempt_at: None,
            close_attempt_count: 0,
            entry_time: Utc::now(),
            exit_time: None,
            realized_pnl: None,
            realized_pnl_percent: None,
        }
    }

    /// Signed PnL percentage at `current_price`, guarded against a
    /// non-positive entry price.
    pub fn pnl_percent(&self, current_price: Decimal) -> f64 {
        if self.entry_price <= Decimal::ZERO {
            return 0.0;
        }
        let raw = ((current_price - self.entry_price) / self.entry_price
            * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0);
        raw * self.side.direction()
    }

    pub fn holding_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_time).num_seconds()
    }

    /// Validate a status transition against the monotone machine.
    pub fn can_transition(&self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        matches!(
            (self.status, next),
            (Open, Closing) | (Open, Failed) | (Closing, Closed) | (Closing, Failed) | (Closing, Open)
        )
    }

    /// Close-attempt guard: backoff while CLOSING with a recent attempt, hard
    /// stop once the attempt budget is spent.
    pub fn close_gate(&self, now: DateTime<Utc>, backoff_secs: i64, max_attempts: u32) -> CloseGate {
        if self.close_attempt_count >= max_attempts {
            return CloseGate::Exhausted;
        }
        if self.status == PositionStatus::Closing {
            if let Some(last) = self.last_close_attempt_at {
                if (now - last).num_seconds() < backoff_secs {
                    return CloseGate::Backoff;
                }
            }
        }
        CloseGate::Proceed
    }

    /// Apply a terminal exit in place.
    pub fn finalize_exit(
        &mut self,
        status: PositionStatus,
        reason: ExitReason,
        exit_price: Option<Decimal>,
        realized_pnl: Option<Decimal>,
    ) {
        self.status = status;
        self.exit_reason = Some(reason);
        self.average_exit_price = exit_price;
        self.realized_pnl = realized_pnl;
        self.realized_pnl_percent = exit_price.map(|p| self.pnl_percent(p));
        self.exit_time = Some(Utc::now());
    }
}

// =============================================================================
// Tests
// =============================================================================
