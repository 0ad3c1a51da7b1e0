//! JSON-over-HTTP implementation of [`MeterApi`].
//!
//! ## Endpoints
//!
//! | Call | Request |
//! |------|---------|
//! | measure | `GET {base}/measure` |
//! | consumption | `GET {base}/historical/consumption?start=YYYY-MM-DD&end=YYYY-MM-DD` |
//! | generation | `GET {base}/historical/generation?start=YYYY-MM-DD&end=YYYY-MM-DD` |
//! | power demand | `GET {base}/historical/power-demand` |
//!
//! Non-2xx answers and `{"success": false, ...}` envelopes are protocol
//! errors; bodies that do not match the expected shape are decoding errors.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use super::MeterApi;
use crate::error::{FetchError, Result};
use crate::models::{ApiConfig, HistoricalSeries, Measure, PowerDemandPeak};
use crate::utils::http::{create_async_client, parse_base_url};
use crate::utils::log::Logger;

/// Longest slice of an error body kept in a protocol error.
const MAX_ERROR_BODY: usize = 200;

/// Metering API client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpMeterApi {
    client: Client,
    base: Url,
    log: Logger,
}

impl HttpMeterApi {
    /// Create a client from configuration.
    pub fn new(config: &ApiConfig, log: Logger) -> Result<Self> {
        let client = create_async_client(config)?;
        let base = parse_base_url(&config.base_url)?;
        Ok(Self { client, base, log })
    }

    /// Create a client around an existing reqwest client.
    pub fn with_client(client: Client, base: Url, log: Logger) -> Self {
        Self { client, base, log }
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, FetchError> {
        self.base.join(path).map_err(FetchError::unclassified)
    }

    fn range_endpoint(
        &self,
        path: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> std::result::Result<Url, FetchError> {
        let mut url = self.endpoint(path)?;
        url.query_pairs_mut()
            .append_pair("start", &start.format("%Y-%m-%d").to_string())
            .append_pair("end", &end.format("%Y-%m-%d").to_string());
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> std::result::Result<T, FetchError> {
        self.log.debug(&format!("GET {url}"));
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if !status.is_success() {
            // The status alone classifies the failure; the body is best effort.
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let body = response.text().await?;
        decode_body(&body)
    }
}

#[async_trait]
impl MeterApi for HttpMeterApi {
    async fn get_measure(&self) -> std::result::Result<Measure, FetchError> {
        self.get_json(self.endpoint("measure")?).await
    }

    async fn get_historical_consumption(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> std::result::Result<HistoricalSeries, FetchError> {
        let url = self.range_endpoint("historical/consumption", start, end)?;
        self.get_json(url).await
    }

    async fn get_historical_generation(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> std::result::Result<HistoricalSeries, FetchError> {
        let url = self.range_endpoint("historical/generation", start, end)?;
        self.get_json(url).await
    }

    async fn get_historical_power_demand(
        &self,
    ) -> std::result::Result<Vec<PowerDemandPeak>, FetchError> {
        self.get_json(self.endpoint("historical/power-demand")?)
            .await
    }
}

/// Decode a 2xx body, rejecting `{"success": false}` envelopes.
fn decode_body<T: DeserializeOwned>(body: &str) -> std::result::Result<T, FetchError> {
    let value: Value = serde_json::from_str(body)?;

    if value.get("success").and_then(Value::as_bool) == Some(false) {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("command rejected by upstream");
        return Err(FetchError::protocol(None, message));
    }

    Ok(serde_json::from_value(value)?)
}

fn status_error(status: StatusCode, body: &str) -> FetchError {
    let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("no body").to_string()
    } else {
        truncate(body, MAX_ERROR_BODY)
    };
    FetchError::protocol(Some(status.as_u16()), message)
}

fn truncate(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn api() -> HttpMeterApi {
        let config = ApiConfig {
            base_url: "https://meter.example.com/v1".to_string(),
            ..ApiConfig::default()
        };
        HttpMeterApi::new(&config, Logger::default()).unwrap()
    }

    /// Serve one canned response on a local port.
    fn serve_once(response: &'static [u8]) -> (String, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}/", listener.local_addr().unwrap());
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request);
            stream.write_all(response).unwrap();
        });
        (base_url, server)
    }

    #[tokio::test]
    async fn test_error_status_with_truncated_body_is_protocol_error() {
        let (base_url, server) = serve_once(
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 100\r\nConnection: close\r\n\r\nbusy",
        );
        let config = ApiConfig {
            base_url,
            ..ApiConfig::default()
        };
        let api = HttpMeterApi::new(&config, Logger::default()).unwrap();

        let err = api.get_measure().await.unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, FetchError::Protocol { status: Some(503), .. }));
    }

    #[test]
    fn test_status_error_message() {
        assert_eq!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, "  "),
            FetchError::protocol(Some(503), "Service Unavailable")
        );
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            FetchError::protocol(Some(429), "slow down")
        );
    }

    #[test]
    fn test_range_endpoint_query() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 8).unwrap();
        let url = api()
            .range_endpoint("historical/consumption", start, end)
            .unwrap();

        assert_eq!(
            url.as_str(),
            "https://meter.example.com/v1/historical/consumption?start=2024-03-01&end=2024-03-08"
        );
    }

    #[test]
    fn test_decode_measure() {
        let measure: Measure = decode_body(r#"{"accumulate": 1520.25, "instant": 410.0}"#).unwrap();
        assert_eq!(measure.accumulate, 1520.25);
        assert_eq!(measure.instant, 410.0);
    }

    #[test]
    fn test_decode_rejected_envelope_is_protocol_error() {
        let err = decode_body::<Measure>(r#"{"success": false, "message": "meter busy"}"#)
            .unwrap_err();
        assert_eq!(err, FetchError::protocol(None, "meter busy"));
    }

    #[test]
    fn test_decode_wrong_shape_is_decoding_error() {
        let err = decode_body::<Measure>(r#"{"accumulate": "n/a"}"#).unwrap_err();
        assert!(matches!(err, FetchError::Decoding(_)));

        let err = decode_body::<Measure>("<html>maintenance</html>").unwrap_err();
        assert!(matches!(err, FetchError::Decoding(_)));
    }

    #[test]
    fn test_decode_power_demand() {
        let peaks: Vec<PowerDemandPeak> =
            decode_body(r#"[{"dt": "2024-02-01T18:15:00Z", "value": 4300.0}]"#).unwrap();
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].value, 4300.0);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("  short  ", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
