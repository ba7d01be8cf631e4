// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Quote currencies recognized when normalizing market codes.
const KNOWN_QUOTES: &[&str] = &["USDT", "USDC", "KRW", "USD", "EUR", "BTC"];

// ---------------------------------------------------------------------------
// Market codes
// ---------------------------------------------------------------------------

/// Normalize any of the accepted textual encodings of a market code into the
/// canonical `BASE-QUOTE` form.
///
/// Accepted inputs: `btc-usdt`, `BTC/USDT`, `BTC_USDT`, the quote-first form
/// `USDT-BTC`, and the concatenated exchange symbol `BTCUSDT`.
pub fn normalize_market(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    let unified = upper.replace(['/', '_'], "-");

    if let Some((first, second)) = unified.split_once('-') {
        // Quote-first encoding: swap so the base leads.
        if KNOWN_QUOTES.contains(&first) && !KNOWN_QUOTES.contains(&second) {
            return format!("{second}-{first}");
        }
        return format!("{first}-{second}");
    }

    // Concatenated symbol: split on a known quote suffix.
    for quote in KNOWN_QUOTES {
        if let Some(base) = unified.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{base}-{quote}");
            }
        }
    }

    unified
}

/// Convert a canonical `BASE-QUOTE` market code into the exchange's
/// concatenated symbol form (`BTCUSDT`).
pub fn to_exchange_symbol(market: &str) -> String {
    normalize_market(market).replace('-', "")
}

/// The base currency of a canonical market code (`BTC` in `BTC-USDT`).
pub fn base_currency(market: &str) -> String {
    normalize_market(market)
        .split_once('-')
        .map(|(b, _)| b.to_string())
        .unwrap_or_else(|| market.to_uppercase())
}

/// The quote currency of a canonical market code (`USDT` in `BTC-USDT`).
pub fn quote_currency(market: &str) -> String {
    normalize_market(market)
        .split_once('-')
        .map(|(_, q)| q.to_string())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Order primitives
// ---------------------------------------------------------------------------

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

impl Side {
    /// Sign multiplier for PnL math: +1 for longs, −1 for shorts.
    pub fn direction(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

/// Execution style of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "LIMIT"),
            Self::Market => write!(f, "MARKET"),
        }
    }
}

/// Exchange-side lifecycle state of a submitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    /// Resting, not (fully) filled yet.
    Wait,
    /// Fully executed.
    Done,
    /// Cancelled or rejected by the exchange.
    Cancel,
}

// ---------------------------------------------------------------------------
// Strategy taxonomy
// ---------------------------------------------------------------------------

/// Coarse origin label attached to every lifecycle event, used for
/// operator-facing aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyGroup {
    Manual,
    Guided,
    AutopilotExternal,
    CoreEngine,
}

impl std::fmt::Display for StrategyGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "MANUAL"),
            Self::Guided => write!(f, "GUIDED"),
            Self::AutopilotExternal => write!(f, "AUTOPILOT_EXTERNAL"),
            Self::CoreEngine => write!(f, "CORE_ENGINE"),
        }
    }
}

impl StrategyGroup {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "MANUAL" => Some(Self::Manual),
            "GUIDED" => Some(Self::Guided),
            "AUTOPILOT_EXTERNAL" => Some(Self::AutopilotExternal),
            "CORE_ENGINE" => Some(Self::CoreEngine),
            _ => None,
        }
    }
}

/// The pluggable analyzer engines the selector can route a market to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyCode {
    Breakout,
    Dca,
    Grid,
    VolatilitySurvival,
}

impl StrategyCode {
    /// Stable lowercase code used in configuration keys and persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Breakout => "breakout",
            Self::Dca => "dca",
            Self::Grid => "grid",
            Self::VolatilitySurvival => "volatility_survival",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "breakout" => Some(Self::Breakout),
            "dca" => Some(Self::Dca),
            "grid" => Some(Self::Grid),
            "volatility_survival" => Some(Self::VolatilitySurvival),
            _ => None,
        }
    }

    pub fn all() -> [StrategyCode; 4] {
        [
            Self::Breakout,
            Self::Dca,
            Self::Grid,
            Self::VolatilitySurvival,
        ]
    }
}

impl std::fmt::Display for StrategyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Market-local clock
// ---------------------------------------------------------------------------

/// Wall clock pinned to the exchange's local zone. Daily rollups, the
/// daily-loss limit, and the optimizer schedule all reset at this zone's
/// midnight; UTC is used everywhere else for durations and storage.
#[derive(Debug, Clone, Copy)]
pub struct MarketClock {
    offset: FixedOffset,
}

impl MarketClock {
    /// Build from a whole-hour UTC offset (positive = east of Greenwich).
    pub fn from_offset_hours(hours: i32) -> Self {
        let offset = FixedOffset::east_opt(hours * 3600)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
        Self { offset }
    }

    /// Read `MARKET_TZ_OFFSET_HOURS` from the environment, defaulting to +9.
    pub fn from_env() -> Self {
        let hours = std::env::var("MARKET_TZ_OFFSET_HOURS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(9);
        Self::from_offset_hours(hours)
    }

    /// Today's calendar date in the market's local zone.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset).date_naive()
    }

    /// The UTC instant of the most recent local midnight.
    pub fn local_midnight_utc(&self) -> DateTime<Utc> {
        let local_now = Utc::now().with_timezone(&self.offset);
        let midnight = local_now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time");
        self.offset
            .from_local_datetime(&midnight)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    }

    /// Seconds from now until the next `hour`:00 local time.
    pub fn seconds_until_local_hour(&self, hour: u32) -> u64 {
        let local_now = Utc::now().with_timezone(&self.offset);
        let today_target = local_now
            .date_naive()
            .and_hms_opt(hour, 0, 0)
            .expect("valid local time");
        let target = if local_now.naive_local() < today_target {
            today_target
        } else {
            today_target + chrono::Duration::days(1)
        };
        (target - local_now.naive_local()).num_seconds().max(0) as u64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
