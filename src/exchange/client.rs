// =============================================================================
// Exchange REST client — HMAC-SHA256 signed requests over a shared reqwest
// client with token-bucket back-pressure
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry the API key as a header plus a timestamped, HMAC-signed query string.
// Every call has a 10 s deadline; a deadline or connection failure surfaces
// as `ExchangeError::Transport` and the caller decides retry/abandon.
// =============================================================================

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::exchange::rate_limit::TokenBucket;
use crate::exchange::{
    Balance, ExchangeApi, ExchangeError, OrderRequest, OrderSnapshot, Orderbook, OrderbookLevel,
    Ticker,
};
use crate::market_data::Candle;
use crate::types::{to_exchange_symbol, OrderState, OrderType, Side};


/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Per-call HTTP deadline.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// REST client for the spot exchange.
pub struct RestExchangeClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    /// Public + signed requests share one bucket sized to the exchange's
    /// per-second request cap.
    request_bucket: TokenBucket,
    /// Order placement has its own, tighter cap.
    order_bucket: TokenBucket,
}

impl RestExchangeClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-API-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        let base_url = std::env::var("EXCHANGE_BASE_URL")
            .unwrap_or_else(|_| "https://api.binance.com".to_string());

        debug!(base_url = %base_url, "exchange client initialised");

        Self {
            api_key,
            secret,
            base_url,
            client,
            request_bucket: TokenBucket::new(10, 10),
            order_bucket: TokenBucket::new(5, 5),
        }
    }

    // -------------------------------------------------------------------------
    // Request signing
    // -------------------------------------------------------------------------

    /// Assemble the query string for an authenticated call: the caller's
    /// key/value pairs, then the timestamp and recv window, then a signature
    /// over everything before it.
    fn authed_query(&self, params: &[(&str, String)]) -> String {
        let mut parts: Vec<String> = params
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        parts.push(format!("timestamp={}", Utc::now().timestamp_millis()));
        parts.push(format!("recvWindow={RECV_WINDOW}"));

        let unsigned = parts.join("&");
        let signature = hmac_sha256_hex(&self.secret, &unsigned);
        format!("{unsigned}&signature={signature}")
    }

    // -------------------------------------------------------------------------
    // Transport helpers
    // -------------------------------------------------------------------------

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, ExchangeError> {
        self.request_bucket.acquire().await;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transport(format!("body parse: {e}")))?;

        if !status.is_success() {
            return Err(classify_http_failure(status, &body));
        }
        Ok(body)
    }

    /// Parse a JSON value that may be a string or a number into `Decimal`.
    fn parse_decimal(val: &serde_json::Value, name: &str) -> Result<Decimal, ExchangeError> {
        let parsed = match val {
            serde_json::Value::String(s) => Decimal::from_str(s).ok(),
            serde_json::Value::Number(n) => n.as_f64().and_then(Decimal::from_f64_retain),
            _ => None,
        };
        parsed.ok_or_else(|| ExchangeError::Transport(format!("field {name} is not a decimal: {val}")))
    }
}

/// Non-2xx responses carrying an exchange error payload are rejections; all
/// other failures are transport problems.
fn classify_http_failure(status: reqwest::StatusCode, body: &serde_json::Value) -> ExchangeError {
    let message = body
        .get("msg")
        .and_then(|m| m.as_str())
        .map(|m| m.to_string())
        .unwrap_or_else(|| body.to_string());

    if status.is_client_error() {
        ExchangeError::Rejected(format!("{status}: {message}"))
    } else {
        ExchangeError::Transport(format!("{status}: {message}"))
    }
}

/// Map the exchange's order status vocabulary onto the engine's three states.
fn map_order_state(raw: &str) -> OrderState {
    match raw {
        "NEW" | "PARTIALLY_FILLED" | "PENDING_NEW" => OrderState::Wait,
        "FILLED" => OrderState::Done,
        _ => OrderState::Cancel,
    }
}

#[async_trait]
impl ExchangeApi for RestExchangeClient {
    /// GET /api/v3/klines (public).
    #[instrument(skip(self), name = "exchange::get_candles")]
    async fn get_candles(
        &self,
        market: &str,
        interval: &str,
        count: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let symbol = to_exchange_symbol(market);
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, count
        );

        let body = self.get_json(&url).await?;
        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Transport("klines response is not an array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 6 => a,
                _ => {
                    warn!("skipping malformed kline entry");
                    continue;
                }
            };

            let open_time = arr[0].as_i64().unwrap_or(0);
            candles.push(Candle {
                timestamp: chrono::DateTime::from_timestamp_millis(open_time)
                    .unwrap_or_else(chrono::Utc::now),
                open: Self::parse_decimal(&arr[1], "open")?,
                high: Self::parse_decimal(&arr[2], "high")?,
                low: Self::parse_decimal(&arr[3], "low")?,
                close: Self::parse_decimal(&arr[4], "close")?,
                volume: Self::parse_decimal(&arr[5], "volume")?,
            });
        }

        debug!(market, interval, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    /// GET /api/v3/ticker/price (public).
    #[instrument(skip(self), name = "exchange::get_ticker")]
    async fn get_ticker(&self, market: &str) -> Result<Ticker, ExchangeError> {
        let symbol = to_exchange_symbol(market);
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);

        let body = self.get_json(&url).await?;
        let last_price = Self::parse_decimal(&body["price"], "price")?;

        Ok(Ticker {
            market: crate::types::normalize_market(market),
            last_price,
        })
    }

    /// GET /api/v3/depth (public).
    #[instrument(skip(self), name = "exchange::get_orderbook")]
    async fn get_orderbook(&self, market: &str, depth: usize) -> Result<Orderbook, ExchangeError> {
        let symbol = to_exchange_symbol(market);
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.base_url, symbol, depth
        );

        let body = self.get_json(&url).await?;

        let parse_side = |name: &str| -> Result<Vec<OrderbookLevel>, ExchangeError> {
            body[name]
                .as_array()
                .ok_or_else(|| ExchangeError::Transport(format!("depth missing {name}")))?
                .iter()
                .map(|lvl| {
                    let pair = lvl.as_array().filter(|a| a.len() >= 2).ok_or_else(|| {
                        ExchangeError::Transport(format!("malformed {name} level"))
                    })?;
                    Ok(OrderbookLevel {
                        price: Self::parse_decimal(&pair[0], "level price")?,
                        quantity: Self::parse_decimal(&pair[1], "level quantity")?,
                    })
                })
                .collect()
        };

        Ok(Orderbook {
            market: crate::types::normalize_market(market),
            bids: parse_side("bids")?,
            asks: parse_side("asks")?,
        })
    }

    /// GET /api/v3/account (signed).
    #[instrument(skip(self), name = "exchange::get_balances")]
    async fn get_balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        let qs = self.authed_query(&[]);
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);

        let body = self.get_json(&url).await?;
        let raw = body["balances"]
            .as_array()
            .ok_or_else(|| ExchangeError::Transport("account response missing balances".into()))?;

        let mut balances = Vec::new();
        for b in raw {
            let currency = b["asset"].as_str().unwrap_or("").to_string();
            let available = Self::parse_decimal(&b["free"], "free").unwrap_or(Decimal::ZERO);
            let locked = Self::parse_decimal(&b["locked"], "locked").unwrap_or(Decimal::ZERO);
            if available > Decimal::ZERO || locked > Decimal::ZERO {
                balances.push(Balance {
                    currency,
                    available,
                    locked,
                    avg_buy_price: None,
                });
            }
        }

        debug!(count = balances.len(), "balances retrieved");
        Ok(balances)
    }

    /// POST /api/v3/order (signed).
    #[instrument(skip(self, request), name = "exchange::place_order", fields(market = %request.market, side = %request.side))]
    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        self.order_bucket.acquire().await;

        let symbol = to_exchange_symbol(&request.market);
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", symbol),
            ("side", request.side.to_string()),
            ("type", request.order_type.to_string()),
        ];

        match request.order_type {
            OrderType::Limit => {
                let price = request.price.ok_or_else(|| {
                    ExchangeError::Rejected("limit order requires a price".into())
                })?;
                let quantity = request.quantity.ok_or_else(|| {
                    ExchangeError::Rejected("limit order requires a quantity".into())
                })?;
                params.push(("price", price.to_string()));
                params.push(("quantity", quantity.to_string()));
                params.push(("timeInForce", "GTC".to_string()));
            }
            OrderType::Market => match (request.side, request.quantity, request.amount) {
                // Market buys spend quote units; market sells dispose base units.
                (Side::Buy, _, Some(amount)) => {
                    params.push(("quoteOrderQty", amount.to_string()));
                }
                (_, Some(quantity), _) => {
                    params.push(("quantity", quantity.to_string()));
                }
                _ => {
                    return Err(ExchangeError::Rejected(
                        "market order requires quantity or amount".into(),
                    ))
                }
            },
        }

        params.push(("newClientOrderId", request.client_token.clone()));

        let qs = self.authed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        self.request_bucket.acquire().await;
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transport(format!("body parse: {e}")))?;

        if !status.is_success() {
            return Err(classify_http_failure(status, &body));
        }

        let raw_id = body["orderId"]
            .as_u64()
            .map(|id| id.to_string())
            .or_else(|| body["orderId"].as_str().map(|s| s.to_string()))
            .ok_or_else(|| ExchangeError::Transport("order response missing orderId".into()))?;

        // Stored ids carry the symbol so later lookups need no extra state.
        let order_id = compose_order_id(&request.market, &raw_id);
        debug!(order_id = %order_id, "order placed");
        Ok(order_id)
    }

    /// GET /api/v3/order (signed).
    #[instrument(skip(self), name = "exchange::get_order")]
    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, ExchangeError> {
        // The exchange keys order lookups by (symbol, orderId); the engine
        // stores ids as "SYMBOL:id" to keep the trait surface market-free.
        let (symbol, raw_id) = split_order_id(order_id);
        let qs = self.authed_query(&[
            ("symbol", symbol.to_string()),
            ("orderId", raw_id.to_string()),
        ]);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let body = self.get_json(&url).await?;

        let executed = Self::parse_decimal(&body["executedQty"], "executedQty")?;
        let orig = Self::parse_decimal(&body["origQty"], "origQty").unwrap_or(Decimal::ZERO);
        let cumulative_quote =
            Self::parse_decimal(&body["cummulativeQuoteQty"], "cummulativeQuoteQty")
                .unwrap_or(Decimal::ZERO);

        let avg_fill_price = if executed > Decimal::ZERO && cumulative_quote > Decimal::ZERO {
            Some(cumulative_quote / executed)
        } else {
            None
        };

        let price = Self::parse_decimal(&body["price"], "price")
            .ok()
            .filter(|p| *p > Decimal::ZERO);

        let state = map_order_state(body["status"].as_str().unwrap_or(""));

        Ok(OrderSnapshot {
            order_id: order_id.to_string(),
            state,
            price,
            avg_fill_price,
            executed_volume: executed,
            remaining_volume: (orig - executed).max(Decimal::ZERO),
            paid_fee: Decimal::ZERO,
        })
    }

    /// DELETE /api/v3/order (signed).
    #[instrument(skip(self), name = "exchange::cancel_order")]
    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let (symbol, raw_id) = split_order_id(order_id);
        let qs = self.authed_query(&[
            ("symbol", symbol.to_string()),
            ("orderId", raw_id.to_string()),
        ]);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        self.request_bucket.acquire().await;
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            return Err(classify_http_failure(status, &body));
        }

        debug!(order_id, "order cancelled");
        Ok(())
    }
}

/// Hex-encoded HMAC-SHA256 of `payload` keyed with `secret`.
fn hmac_sha256_hex(secret: &str, payload: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac key length is unrestricted");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Split a stored `SYMBOL:id` order id; a bare id maps to an empty symbol.
fn split_order_id(order_id: &str) -> (&str, &str) {
    order_id.split_once(':').unwrap_or(("", order_id))
}

/// Compose the stored form of an exchange order id.
pub fn compose_order_id(market: &str, raw_id: &str) -> String {
    format!("{}:{}", to_exchange_symbol(market), raw_id)
}

impl std::fmt::Debug for RestExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestExchangeClient")
            .field("api_key_set", &!self.api_key.is_empty())
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_state_mapping() {
        assert_eq!(map_order_state("NEW"), OrderState::Wait);
        assert_eq!(map_order_state("PARTIALLY_FILLED"), OrderState::Wait);
        assert_eq!(map_order_state("FILLED"), OrderState::Done);
        assert_eq!(map_order_state("CANCELED"), OrderState::Cancel);
        assert_eq!(map_order_state("REJECTED"), OrderState::Cancel);
    }

    #[test]
    fn order_id_composition_roundtrip() {
        let id = compose_order_id("BTC-USDT", "12345");
        assert_eq!(id, "BTCUSDT:12345");
        assert_eq!(split_order_id(&id), ("BTCUSDT", "12345"));
        assert_eq!(split_order_id("999"), ("", "999"));
    }

    #[test]
    fn hmac_helper_is_deterministic_hex() {
        let a = hmac_sha256_hex("secret", "symbol=BTCUSDT&side=BUY");
        let b = hmac_sha256_hex("secret", "symbol=BTCUSDT&side=BUY");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        // A different payload or key moves the signature.
        assert_ne!(a, hmac_sha256_hex("secret", "symbol=ETHUSDT&side=BUY"));
        assert_ne!(a, hmac_sha256_hex("other", "symbol=BTCUSDT&side=BUY"));
    }

    #[test]
    fn authed_query_signs_everything_before_the_signature() {
        let client = RestExchangeClient::new("key", "secret");
        let qs = client.authed_query(&[("symbol", "BTCUSDT".to_string())]);

        assert!(qs.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(qs.contains(&format!("&recvWindow={RECV_WINDOW}&")));

        let (unsigned, signature) = qs.rsplit_once("&signature=").unwrap();
        assert_eq!(signature, hmac_sha256_hex("secret", unsigned));
    }

    #[test]
    fn http_failure_classification() {
        let body = serde_json::json!({ "code": -2010, "msg": "insufficient balance" });
        let err = classify_http_failure(reqwest::StatusCode::BAD_REQUEST, &body);
        assert!(matches!(err, ExchangeError::Rejected(_)));

        let err = classify_http_failure(reqwest::StatusCode::BAD_GATEWAY, &body);
        assert!(matches!(err, ExchangeError::Transport(_)));
    }
}
