//! Broker trait and the REST-backed reference implementation.
//!
//! The client shape (a `reqwest::Client` built once with a bounded timeout
//! and reused across calls, status-checked responses that fold a non-2xx
//! body into the error) follows `scrapers/dome_rest.rs`. Request signing
//! follows the HMAC-SHA256 idiom in `vault/execution.rs`'s CLOB adapter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

use crate::models::OrderSide;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: f64,
    pub side: OrderSide,
    pub trail_price: Option<f64>,
    pub trail_percent: Option<f64>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, qty: f64, side: OrderSide) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side,
            trail_price: None,
            trail_percent: None,
        }
    }

    pub fn trailing_stop_sell(symbol: impl Into<String>, qty: f64, trail_price: Option<f64>, trail_percent: Option<f64>) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side: OrderSide::Sell,
            trail_price,
            trail_percent,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerOrder {
    pub id: String,
    pub symbol: String,
    pub status: OrderState,
    pub filled_qty: f64,
    pub filled_avg_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    New,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Other,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: f64,
    pub unrealized_plpc: Option<f64>,
}

/// Error returned by a [`Broker`] call. Critical/non-critical classification
/// in the executor is a pure function of `Http.status`, never of message
/// text.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker http error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// HTTP statuses the executor treats as evidence of a systemic outage
    /// rather than a one-off rejected order.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            BrokerError::Http { status, .. }
                if matches!(status, 401 | 403 | 500 | 502 | 503 | 504)
        )
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn submit_order(&self, req: OrderRequest) -> Result<BrokerOrder, BrokerError>;
    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder, BrokerError>;
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;
    async fn list_orders(&self, symbol: &str) -> Result<Vec<BrokerOrder>, BrokerError>;
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;
    async fn get_position(&self, symbol: &str) -> Result<Option<BrokerPosition>, BrokerError>;
}

/// REST-backed broker client. Builds one `reqwest::Client` at construction
/// and reuses it for the executor's lifetime.
pub struct RestBroker {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    secret_key: String,
}

impl RestBroker {
    pub fn new(base_url: String, key_id: String, secret_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .pool_max_idle_per_host(4)
            .build()
            .context("failed to build broker http client")?;
        Ok(Self {
            client,
            base_url,
            key_id,
            secret_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// HMAC-SHA256 request signature over `method|path|body`, hex-encoded.
    fn sign(&self, method: &str, path: &str, body: &str) -> Result<String> {
        let message = format!("{method}|{path}|{body}");
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .context("invalid broker secret key")?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn map_status(status: reqwest::StatusCode, body: String) -> BrokerError {
        BrokerError::Http {
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
impl Broker for RestBroker {
    async fn submit_order(&self, req: OrderRequest) -> Result<BrokerOrder, BrokerError> {
        let path = "/v2/orders";
        let body = serde_json::json!({
            "symbol": req.symbol,
            "qty": req.qty,
            "side": req.side.as_str(),
            "type": if req.trail_price.is_some() || req.trail_percent.is_some() { "trailing_stop" } else { "market" },
            "time_in_force": "day",
            "trail_price": req.trail_price,
            "trail_percent": req.trail_percent,
        })
        .to_string();
        let signature = self
            .sign("POST", path, &body)
            .map_err(|e| BrokerError::Other(e.to_string()))?;

        let resp = self
            .client
            .post(self.url(path))
            .header("APCA-API-KEY-ID", &self.key_id)
            .header("APCA-API-SIGNATURE", signature)
            .body(body)
            .send()
            .await
            .map_err(|e| BrokerError::Other(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, text));
        }
        resp.json::<BrokerOrder>()
            .await
            .map_err(|e| BrokerError::Other(e.to_string()))
    }

    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder, BrokerError> {
        let path = format!("/v2/orders/{order_id}");
        let resp = self
            .client
            .get(self.url(&path))
            .header("APCA-API-KEY-ID", &self.key_id)
            .send()
            .await
            .map_err(|e| BrokerError::Other(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, text));
        }
        resp.json::<BrokerOrder>()
            .await
            .map_err(|e| BrokerError::Other(e.to_string()))
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let resp = self
            .client
            .get(self.url("/v2/positions"))
            .header("APCA-API-KEY-ID", &self.key_id)
            .send()
            .await
            .map_err(|e| BrokerError::Other(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, text));
        }
        resp.json::<Vec<BrokerPosition>>()
            .await
            .map_err(|e| BrokerError::Other(e.to_string()))
    }

    async fn list_orders(&self, symbol: &str) -> Result<Vec<BrokerOrder>, BrokerError> {
        let resp = self
            .client
            .get(self.url("/v2/orders"))
            .query(&[("symbols", symbol), ("status", "open")])
            .header("APCA-API-KEY-ID", &self.key_id)
            .send()
            .await
            .map_err(|e| BrokerError::Other(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, text));
        }
        resp.json::<Vec<BrokerOrder>>()
            .await
            .map_err(|e| BrokerError::Other(e.to_string()))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let path = format!("/v2/orders/{order_id}");
        let resp = self
            .client
            .delete(self.url(&path))
            .header("APCA-API-KEY-ID", &self.key_id)
            .send()
            .await
            .map_err(|e| BrokerError::Other(e.to_string()))?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, text));
        }
        Ok(())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<BrokerPosition>, BrokerError> {
        let path = format!("/v2/positions/{symbol}");
        let resp = self
            .client
            .get(self.url(&path))
            .header("APCA-API-KEY-ID", &self.key_id)
            .send()
            .await
            .map_err(|e| BrokerError::Other(e.to_string()))?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, text));
        }
        resp.json::<BrokerPosition>()
            .await
            .map(Some)
            .map_err(|e| BrokerError::Other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_status_codes_trip_the_breaker() {
        for status in [401, 403, 500, 502, 503, 504] {
            let err = BrokerError::Http {
                status,
                body: String::new(),
            };
            assert!(err.is_critical(), "{status} should be critical");
        }
    }

    #[test]
    fn non_critical_status_codes_do_not_trip_the_breaker() {
        for status in [400, 404, 409, 422] {
            let err = BrokerError::Http {
                status,
                body: String::new(),
            };
            assert!(!err.is_critical(), "{status} should not be critical");
        }
    }

    #[test]
    fn other_errors_are_never_critical() {
        assert!(!BrokerError::Other("timeout".into()).is_critical());
    }
}
