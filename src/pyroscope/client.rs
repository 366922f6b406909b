use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use serde_json::json;
use url::Url;

use crate::error::ProbeError;
use crate::http_probe::transport::{InstrumentedClient, ProbeResponse};

const TENANT_HEADER: HeaderName = HeaderName::from_static("x-scope-orgid");
const QUERIER_SERVICE: &str = "/querier.v1.QuerierService/";

/// The synthetic series every cycle writes and reads back.
const SERIES_NAME: &str = "canary.exporter.cpu";
const PROFILE_TYPE_ID: &str = "canary.exporter.cpu:samples:count::";

/// How far around the logical cycle timestamp the query probes look.
const QUERY_LOOKBACK_SECONDS: i64 = 300;
const QUERY_LOOKAHEAD_SECONDS: i64 = 60;

/// Client for one probe execution against a Pyroscope-compatible backend.
/// Every method is one named probe operation: a transport or non-2xx failure
/// is the probe's failure. Bodies are always drained by the transport so the
/// transfer phase and the body-size gauge stay meaningful.
pub struct PyroscopeClient {
    base: Url,
    tenant_id: Option<String>,
    hostname: String,
    http: InstrumentedClient,
}

impl PyroscopeClient {
    pub fn new(
        base: Url,
        tenant_id: Option<String>,
        hostname: String,
        http: InstrumentedClient,
    ) -> Self {
        Self {
            base,
            tenant_id,
            hostname,
            http,
        }
    }

    /// Pushes one synthetic profile in folded format, stamped with the
    /// logical cycle timestamp so the query probes can find it again.
    pub async fn ingest_profile(&self, now: DateTime<Utc>) -> Result<(), ProbeError> {
        let at = now.timestamp().to_string();
        let mut url = self.base.join("/ingest")?;
        url.query_pairs_mut()
            .append_pair("name", &self.series_selector())
            .append_pair("from", &at)
            .append_pair("until", &at)
            .append_pair("sampleRate", "100")
            .append_pair("format", "folded");

        let mut headers = self.base_headers()?;
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let response = self
            .http
            .execute(Method::POST, url, headers, Bytes::from_static(b"canary;probe 1"))
            .await?;
        ensure_success(response)
    }

    pub async fn select_merge_profile(&self, now: DateTime<Utc>) -> Result<(), ProbeError> {
        let (start, end) = query_window_ms(now);
        self.querier(
            "SelectMergeProfile",
            json!({
                "profile_typeID": PROFILE_TYPE_ID,
                "label_selector": self.label_selector(),
                "start": start,
                "end": end,
            }),
        )
        .await
    }

    pub async fn profile_types(&self, now: DateTime<Utc>) -> Result<(), ProbeError> {
        let (start, end) = query_window_ms(now);
        self.querier("ProfileTypes", json!({ "start": start, "end": end }))
            .await
    }

    pub async fn series(&self, now: DateTime<Utc>) -> Result<(), ProbeError> {
        let (start, end) = query_window_ms(now);
        self.querier(
            "Series",
            json!({
                "matchers": [self.label_selector()],
                "label_names": [],
                "start": start,
                "end": end,
            }),
        )
        .await
    }

    pub async fn label_names(&self, now: DateTime<Utc>) -> Result<(), ProbeError> {
        let (start, end) = query_window_ms(now);
        self.querier(
            "LabelNames",
            json!({
                "matchers": [self.label_selector()],
                "start": start,
                "end": end,
            }),
        )
        .await
    }

    pub async fn label_values(&self, now: DateTime<Utc>) -> Result<(), ProbeError> {
        let (start, end) = query_window_ms(now);
        self.querier(
            "LabelValues",
            json!({
                "name": "hostname",
                "matchers": [self.label_selector()],
                "start": start,
                "end": end,
            }),
        )
        .await
    }

    pub async fn select_series(&self, now: DateTime<Utc>) -> Result<(), ProbeError> {
        let (start, end) = query_window_ms(now);
        self.querier(
            "SelectSeries",
            json!({
                "profile_typeID": PROFILE_TYPE_ID,
                "label_selector": self.label_selector(),
                "start": start,
                "end": end,
                "step": 15.0,
                "group_by": [],
            }),
        )
        .await
    }

    pub async fn select_merge_stacktraces(&self, now: DateTime<Utc>) -> Result<(), ProbeError> {
        let (start, end) = query_window_ms(now);
        self.querier(
            "SelectMergeStacktraces",
            json!({
                "profile_typeID": PROFILE_TYPE_ID,
                "label_selector": self.label_selector(),
                "start": start,
                "end": end,
            }),
        )
        .await
    }

    pub async fn select_merge_span_profile(&self, now: DateTime<Utc>) -> Result<(), ProbeError> {
        let (start, end) = query_window_ms(now);
        self.querier(
            "SelectMergeSpanProfile",
            json!({
                "profile_typeID": PROFILE_TYPE_ID,
                "label_selector": self.label_selector(),
                "start": start,
                "end": end,
                "span_selector": [],
            }),
        )
        .await
    }

    pub async fn get_profile_stats(&self, _now: DateTime<Utc>) -> Result<(), ProbeError> {
        self.querier("GetProfileStats", json!({})).await
    }

    pub async fn render(&self, now: DateTime<Utc>) -> Result<(), ProbeError> {
        let (start, end) = query_window_ms(now);
        let mut url = self.base.join("/pyroscope/render")?;
        url.query_pairs_mut()
            .append_pair("query", &self.series_selector())
            .append_pair("from", &start.to_string())
            .append_pair("until", &end.to_string())
            .append_pair("format", "json");
        self.get(url).await
    }

    pub async fn render_diff(&self, now: DateTime<Utc>) -> Result<(), ProbeError> {
        let (start, end) = query_window_ms(now);
        let query = self.series_selector();
        let mut url = self.base.join("/pyroscope/render-diff")?;
        url.query_pairs_mut()
            .append_pair("leftQuery", &query)
            .append_pair("leftFrom", &start.to_string())
            .append_pair("leftUntil", &end.to_string())
            .append_pair("rightQuery", &query)
            .append_pair("rightFrom", &start.to_string())
            .append_pair("rightUntil", &end.to_string())
            .append_pair("format", "json");
        self.get(url).await
    }

    /// Connect-style JSON call against the querier service.
    async fn querier(&self, rpc: &str, body: serde_json::Value) -> Result<(), ProbeError> {
        let url = self.base.join(&format!("{QUERIER_SERVICE}{rpc}"))?;
        let mut headers = self.base_headers()?;
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let response = self
            .http
            .execute(Method::POST, url, headers, Bytes::from(body.to_string()))
            .await?;
        ensure_success(response)
    }

    async fn get(&self, url: Url) -> Result<(), ProbeError> {
        let response = self
            .http
            .execute(Method::GET, url, self.base_headers()?, Bytes::new())
            .await?;
        ensure_success(response)
    }

    fn base_headers(&self) -> Result<HeaderMap, ProbeError> {
        let mut headers = HeaderMap::new();
        if let Some(tenant_id) = &self.tenant_id {
            let value = HeaderValue::from_str(tenant_id).map_err(http::Error::from)?;
            headers.insert(TENANT_HEADER, value);
        }
        Ok(headers)
    }

    fn series_selector(&self) -> String {
        format!("{SERIES_NAME}{{hostname=\"{}\"}}", self.hostname)
    }

    fn label_selector(&self) -> String {
        format!("{{hostname=\"{}\"}}", self.hostname)
    }
}

fn query_window_ms(now: DateTime<Utc>) -> (i64, i64) {
    let start = now - Duration::seconds(QUERY_LOOKBACK_SECONDS);
    let end = now + Duration::seconds(QUERY_LOOKAHEAD_SECONDS);
    (start.timestamp_millis(), end.timestamp_millis())
}

fn ensure_success(response: ProbeResponse) -> Result<(), ProbeError> {
    if response.status.is_success() {
        Ok(())
    } else {
        Err(ProbeError::Status(response.status))
    }
}
