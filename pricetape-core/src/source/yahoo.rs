//! Yahoo Finance intraday source.
//!
//! Pulls 1-minute closes from the v8 chart API for the requested window and
//! appends the regular-market live price as a final sample. One HTTP attempt
//! per call: retries, pacing and backoff belong to the orchestrator.
//!
//! Yahoo has no official API and changes format without notice; any body we
//! cannot interpret is reported as `Malformed` rather than guessed at.

use super::{SampleSource, SourceError};
use crate::model::{FetchWindow, Instrument, RawSample, SourceTag};
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: ChartMeta,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    regular_market_price: Option<f64>,
    regular_market_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    close: Vec<Option<f64>>,
}

pub struct YahooSource {
    client: reqwest::blocking::Client,
    base_url: Url,
    request_timeout: Duration,
}

impl YahooSource {
    pub fn new(request_timeout: Duration) -> Result<Self, SourceError> {
        Self::with_base_url("https://query2.finance.yahoo.com", request_timeout)
    }

    /// Point the source at a different host (mirrors, test servers).
    pub fn with_base_url(base_url: &str, request_timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| SourceError::Network(format!("failed to build HTTP client: {e}")))?;

        let base_url = Url::parse(base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| SourceError::Network(format!("invalid base URL: {base_url}")))?;

        Ok(Self {
            client,
            base_url,
            request_timeout,
        })
    }

    /// The instrument goes in as a single percent-encoded path segment.
    fn chart_url(&self, instrument: &Instrument, window: &FetchWindow) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v8", "finance", "chart", instrument.as_str()]);
        }
        url.query_pairs_mut()
            .append_pair("period1", &window.start.timestamp().to_string())
            .append_pair("period2", &window.end.timestamp().to_string())
            .append_pair("interval", "1m")
            .append_pair("includePrePost", "false");
        url
    }

    fn parse_response(
        instrument: &Instrument,
        window: &FetchWindow,
        resp: ChartResponse,
    ) -> Result<Vec<RawSample>, SourceError> {
        let result = resp.chart.result.ok_or_else(|| match resp.chart.error {
            Some(err) if err.code == "Not Found" => SourceError::NotFound {
                instrument: instrument.clone(),
            },
            Some(err) => SourceError::Malformed(format!("{}: {}", err.code, err.description)),
            None => SourceError::Malformed("empty result with no error".into()),
        })?;

        let data = result
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::Malformed("result array is empty".into()))?;

        let mut samples = Vec::new();

        // Minutes with no trades come back as nulls; a chart with no timestamps
        // at all is a closed market, not an error.
        if let Some(timestamps) = data.timestamp {
            let closes = data
                .indicators
                .quote
                .into_iter()
                .next()
                .map(|q| q.close)
                .unwrap_or_default();

            for (ts, close) in timestamps.iter().zip(closes) {
                let Some(price) = close else { continue };
                let timestamp = to_utc(*ts)?;
                if window.contains(timestamp) {
                    samples.push(RawSample {
                        instrument: instrument.clone(),
                        timestamp,
                        price,
                    });
                }
            }
        }

        if let (Some(price), Some(ts)) = (
            data.meta.regular_market_price,
            data.meta.regular_market_time,
        ) {
            let timestamp = to_utc(ts)?;
            if window.contains(timestamp) && !samples.iter().any(|s| s.timestamp == timestamp) {
                samples.push(RawSample {
                    instrument: instrument.clone(),
                    timestamp,
                    price,
                });
            }
        }

        Ok(samples)
    }
}

fn to_utc(ts: i64) -> Result<DateTime<Utc>, SourceError> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| SourceError::Malformed(format!("invalid timestamp: {ts}")))
}

impl SampleSource for YahooSource {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn tag(&self) -> SourceTag {
        SourceTag::Live
    }

    fn fetch(
        &self,
        instrument: &Instrument,
        window: &FetchWindow,
    ) -> Result<Vec<RawSample>, SourceError> {
        let url = self.chart_url(instrument, window);

        let resp = self.client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout {
                    after: self.request_timeout,
                }
            } else {
                SourceError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(SourceError::RateLimited { retry_after });
        }
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(SourceError::Blocked);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound {
                instrument: instrument.clone(),
            });
        }
        if !status.is_success() {
            return Err(SourceError::Network(format!("HTTP {status} for {instrument}")));
        }

        let chart: ChartResponse = resp
            .json()
            .map_err(|e| SourceError::Malformed(format!("failed to parse response for {instrument}: {e}")))?;

        Self::parse_response(instrument, window, chart)
    }
}
