//! USDⓈ-M futures REST client for order execution.
//!
//! Private endpoints are signed: parameters are URL-encoded in a fixed
//! order, an HMAC-SHA256 digest of that query string is computed with the
//! API secret, and the hex digest is appended as `signature`. The API key
//! travels in the `X-MBX-APIKEY` header.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Url};
use rust_decimal::Decimal;
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::models::Side;

use super::exchange::Exchange;
use super::types::*;

type HmacSha256 = Hmac<Sha256>;

/// Futures API base URL
pub const FUTURES_URL: &str = "https://fapi.binance.com";

const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Signed REST client for a futures account.
pub struct FuturesClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl FuturesClient {
    /// Create a new futures client.
    ///
    /// # Arguments
    /// * `api_key` - Public key identifier sent with every private request
    /// * `api_secret` - Secret used to sign request parameters
    /// * `base_url` - REST endpoint, e.g. [`FUTURES_URL`]
    pub fn new(api_key: &str, api_secret: &str, base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        })
    }

    /// Create from environment variables:
    /// - BINANCE_API_KEY
    /// - BINANCE_API_SECRET
    /// - BINANCE_BASE_URL (defaults to the production endpoint)
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("BINANCE_API_KEY").context("BINANCE_API_KEY not set")?;
        let api_secret =
            std::env::var("BINANCE_API_SECRET").context("BINANCE_API_SECRET not set")?;
        let base_url =
            std::env::var("BINANCE_BASE_URL").unwrap_or_else(|_| FUTURES_URL.to_string());

        Self::new(&api_key, &api_secret, &base_url)
    }

    /// URL-encode parameters in the given order.
    pub fn encode_params(params: &[(&str, String)]) -> Result<String> {
        let url = Url::parse_with_params("http://localhost/", params)?;
        Ok(url.query().unwrap_or_default().to_string())
    }

    /// Hex HMAC-SHA256 of `query` keyed with `secret`.
    pub fn sign_query(secret: &str, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| anyhow!("Invalid signing key: {}", e))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Encode `params`, stamp them with the current time and append the signature.
    fn signed_query(&self, mut params: Vec<(&str, String)>) -> Result<String> {
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query = Self::encode_params(&params)?;
        let signature = Self::sign_query(&self.api_secret, &query)?;
        Ok(format!("{}&signature={}", query, signature))
    }

    /// Send a signed request and decode the JSON response.
    async fn send_signed<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params)?);
        debug!(path = %path, "Sending signed request");

        let resp = self
            .http
            .request(method, &url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", path))?;

        Self::decode(resp, path).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response, path: &str) -> Result<T> {
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            let msg = serde_json::from_str::<ApiErrorBody>(&text)
                .map(|body| format!("{} (code {})", body.msg, body.code))
                .unwrap_or(text);
            return Err(anyhow!("{} failed: {} - {}", path, status, msg));
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse {} response", path))
    }
}

#[async_trait]
impl Exchange for FuturesClient {
    async fn price(&self, symbol: &str) -> Result<Decimal> {
        let url = format!("{}/fapi/v1/ticker/price", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("symbol", symbol)])
            .send()
            .await
            .context("Failed to fetch price")?;

        let ticker: TickerPrice = Self::decode(resp, "/fapi/v1/ticker/price").await?;
        Decimal::from_str(ticker.price.trim())
            .map_err(|e| anyhow!("Non-numeric price {:?} for {}: {}", ticker.price, symbol, e))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let resp: LeverageResponse = self
            .send_signed(
                Method::POST,
                "/fapi/v1/leverage",
                vec![("symbol", symbol.to_string()), ("leverage", leverage.to_string())],
            )
            .await?;

        debug!(symbol = %resp.symbol, leverage = resp.leverage, "Leverage acknowledged");
        Ok(())
    }

    async fn market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderResponse> {
        let client_order_id = uuid::Uuid::new_v4().simple().to_string();

        self.send_signed(
            Method::POST,
            "/fapi/v1/order",
            vec![
                ("symbol", symbol.to_string()),
                ("side", side.order_side().to_string()),
                ("type", "MARKET".to_string()),
                ("quantity", quantity.normalize().to_string()),
                ("reduceOnly", reduce_only.to_string()),
                ("newClientOrderId", client_order_id),
            ],
        )
        .await
    }

    async fn position_amount(&self, symbol: &str) -> Result<Decimal> {
        let positions: Vec<PositionRisk> = self
            .send_signed(
                Method::GET,
                "/fapi/v2/positionRisk",
                vec![("symbol", symbol.to_string())],
            )
            .await?;

        Ok(positions
            .iter()
            .find(|p| p.symbol == symbol)
            .map(|p| p.position_amt)
            .unwrap_or(Decimal::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> FuturesClient {
        FuturesClient::new("test-key", "test-secret", &server.uri()).unwrap()
    }

    #[test]
    fn test_sign_query_known_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            FuturesClient::sign_query(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_encode_params_keeps_order() {
        let query = FuturesClient::encode_params(&[
            ("symbol", "ETHUSDT".to_string()),
            ("side", "SELL".to_string()),
            ("note", "a b&c".to_string()),
        ])
        .unwrap();
        assert_eq!(query, "symbol=ETHUSDT&side=SELL&note=a+b%26c");
    }

    #[tokio::test]
    async fn test_price() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/ticker/price"))
            .and(query_param("symbol", "ETHUSDT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "ETHUSDT",
                "price": "2000.50",
                "time": 1700000000000i64
            })))
            .mount(&server)
            .await;

        assert_eq!(client(&server).price("ETHUSDT").await.unwrap(), dec!(2000.50));
    }

    #[tokio::test]
    async fn test_non_numeric_price_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/ticker/price"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "ETHUSDT",
                "price": "n/a"
            })))
            .mount(&server)
            .await;

        assert!(client(&server).price("ETHUSDT").await.is_err());
    }

    #[tokio::test]
    async fn test_market_order_is_signed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .and(header("X-MBX-APIKEY", "test-key"))
            .and(query_param("symbol", "ETHUSDT"))
            .and(query_param("side", "SELL"))
            .and(query_param("type", "MARKET"))
            .and(query_param("quantity", "0.02"))
            .and(query_param("reduceOnly", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderId": 42,
                "symbol": "ETHUSDT",
                "status": "NEW",
                "clientOrderId": "abc",
                "side": "SELL",
                "origQty": "0.020",
                "avgPrice": "0.00"
            })))
            .mount(&server)
            .await;

        let resp = client(&server)
            .market_order("ETHUSDT", Side::Sell, dec!(0.020), true)
            .await
            .unwrap();
        assert_eq!(resp.order_id, 42);

        let requests = server.received_requests().await.unwrap();
        let query = requests[0].url.query().unwrap().to_string();
        let (unsigned, signature) = query.rsplit_once("&signature=").unwrap();
        assert!(unsigned.contains("timestamp="));
        assert_eq!(
            signature,
            FuturesClient::sign_query("test-secret", unsigned).unwrap()
        );
    }

    #[tokio::test]
    async fn test_order_rejection_carries_exchange_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": -4164,
                "msg": "Order's notional must be no smaller than 20"
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .market_order("ETHUSDT", Side::Buy, dec!(0.001), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("notional must be no smaller than 20"));
    }

    #[tokio::test]
    async fn test_position_amount() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v2/positionRisk"))
            .and(query_param("symbol", "ETHUSDT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "symbol": "BTCUSDT", "positionAmt": "0.100" },
                { "symbol": "ETHUSDT", "positionAmt": "-0.020", "entryPrice": "2000.0" }
            ])))
            .mount(&server)
            .await;

        assert_eq!(
            client(&server).position_amount("ETHUSDT").await.unwrap(),
            dec!(-0.020)
        );
    }

    #[tokio::test]
    async fn test_missing_position_is_flat() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v2/positionRisk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        assert_eq!(
            client(&server).position_amount("ETHUSDT").await.unwrap(),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_set_leverage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/leverage"))
            .and(query_param("leverage", "20"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "ETHUSDT",
                "leverage": 20,
                "maxNotionalValue": "1000000"
            })))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).set_leverage("ETHUSDT", 20).await.unwrap();
    }
}
