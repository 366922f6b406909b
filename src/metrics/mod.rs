use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
    exponential_buckets,
};

use crate::http_probe::tls_info::CertificateSnapshot;

/// All series exposed by the exporter, registered on a private registry.
/// Only the latest values are retained; every cycle overwrites the gauges of
/// the probes it ran.
pub struct CanaryMetrics {
    registry: Registry,
    success: GaugeVec,
    duration: HistogramVec,
    content_length: GaugeVec,
    body_uncompressed_length: GaugeVec,
    status_code: GaugeVec,
    is_ssl: Gauge,
    ssl_earliest_cert_expiry: Gauge,
    ssl_last_chain_expiry: Gauge,
    tls_version: GaugeVec,
    ssl_last_info: GaugeVec,
    http_version: GaugeVec,
}

impl CanaryMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let success = GaugeVec::new(
            Opts::new(
                "probe_success",
                "Displays whether or not the probe was a success",
            ),
            &["name"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "probe_http_duration_seconds",
                "Duration of http request by phase, summed over all redirects",
            )
            .buckets(exponential_buckets(0.00025, 4.0, 10)?),
            &["name", "phase"],
        )?;
        let content_length = GaugeVec::new(
            Opts::new("probe_http_content_length", "Length of http content response"),
            &["name"],
        )?;
        let body_uncompressed_length = GaugeVec::new(
            Opts::new(
                "probe_http_uncompressed_body_length",
                "Length of uncompressed response body",
            ),
            &["name"],
        )?;
        let status_code = GaugeVec::new(
            Opts::new("probe_http_status_code", "Response HTTP status code"),
            &["name"],
        )?;
        let is_ssl = Gauge::new(
            "probe_http_ssl",
            "Indicates if SSL was used for the final redirect",
        )?;
        let ssl_earliest_cert_expiry = Gauge::new(
            "probe_ssl_earliest_cert_expiry",
            "Returns earliest SSL cert expiry in unixtime",
        )?;
        let ssl_last_chain_expiry = Gauge::new(
            "probe_ssl_last_chain_expiry_timestamp_seconds",
            "Returns last SSL chain expiry in timestamp",
        )?;
        let tls_version = GaugeVec::new(
            Opts::new(
                "probe_tls_version_info",
                "Returns the TLS version used or NaN when unknown",
            ),
            &["version"],
        )?;
        let ssl_last_info = GaugeVec::new(
            Opts::new(
                "probe_ssl_last_chain_info",
                "Contains SSL leaf certificate information",
            ),
            &["fingerprint_sha256", "subject", "issuer", "subjectalternative"],
        )?;
        let http_version = GaugeVec::new(
            Opts::new(
                "probe_http_version",
                "Returns the version of HTTP of the probe response",
            ),
            &["name"],
        )?;

        registry.register(Box::new(success.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(content_length.clone()))?;
        registry.register(Box::new(body_uncompressed_length.clone()))?;
        registry.register(Box::new(status_code.clone()))?;
        registry.register(Box::new(is_ssl.clone()))?;
        registry.register(Box::new(ssl_earliest_cert_expiry.clone()))?;
        registry.register(Box::new(ssl_last_chain_expiry.clone()))?;
        registry.register(Box::new(tls_version.clone()))?;
        registry.register(Box::new(ssl_last_info.clone()))?;
        registry.register(Box::new(http_version.clone()))?;

        Ok(Self {
            registry,
            success,
            duration,
            content_length,
            body_uncompressed_length,
            status_code,
            is_ssl,
            ssl_earliest_cert_expiry,
            ssl_last_chain_expiry,
            tls_version,
            ssl_last_info,
            http_version,
        })
    }

    pub fn record_success(&self, name: &str, ok: bool) {
        self.success
            .with_label_values(&[name])
            .set(if ok { 1.0 } else { 0.0 });
    }

    pub fn observe_phase(&self, name: &str, phase: &str, seconds: f64) {
        self.duration.with_label_values(&[name, phase]).observe(seconds);
    }

    pub fn record_body_size(&self, name: &str, bytes: u64) {
        self.body_uncompressed_length
            .with_label_values(&[name])
            .set(bytes as f64);
    }

    pub fn record_status_code(&self, name: &str, code: u16) {
        self.status_code.with_label_values(&[name]).set(f64::from(code));
    }

    /// Content length is passed through as reported, -1 means unknown.
    pub fn record_content_length(&self, name: &str, length: f64) {
        self.content_length.with_label_values(&[name]).set(length);
    }

    pub fn record_http_version(&self, name: &str, version: f64) {
        self.http_version.with_label_values(&[name]).set(version);
    }

    /// A TLS session was observed but certificate facts may be missing.
    pub fn record_tls_session(&self, version_label: &str) {
        self.is_ssl.set(1.0);
        self.tls_version.with_label_values(&[version_label]).set(1.0);
    }

    pub fn record_certificates(&self, snapshot: &CertificateSnapshot) {
        self.record_tls_session(snapshot.tls_version);
        if let Some(expiry) = snapshot.earliest_cert_expiry {
            self.ssl_earliest_cert_expiry.set(expiry as f64);
        }
        if let Some(expiry) = snapshot.last_chain_expiry {
            self.ssl_last_chain_expiry.set(expiry as f64);
        }
        self.ssl_last_info
            .with_label_values(&[
                &snapshot.fingerprint_sha256,
                &snapshot.subject,
                &snapshot.issuer,
                &snapshot.subject_alternative,
            ])
            .set(1.0);
    }

    /// Renders every registered series in the Prometheus text exposition
    /// format for the /metrics endpoint.
    pub fn encode(&self) -> Result<(Vec<u8>, &'static str), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((buffer, "text/plain; version=0.0.4"))
    }

    #[cfg(test)]
    pub fn success_value(&self, name: &str) -> f64 {
        self.success.with_label_values(&[name]).get()
    }

    #[cfg(test)]
    pub fn status_code_value(&self, name: &str) -> f64 {
        self.status_code.with_label_values(&[name]).get()
    }

    #[cfg(test)]
    pub fn body_size_value(&self, name: &str) -> f64 {
        self.body_uncompressed_length.with_label_values(&[name]).get()
    }

    #[cfg(test)]
    pub fn phase_sample_count(&self, name: &str, phase: &str) -> u64 {
        self.duration
            .with_label_values(&[name, phase])
            .get_sample_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_series_register_without_collisions() {
        let metrics = CanaryMetrics::new().expect("metrics should register");
        metrics.record_success("ingest", true);
        metrics.observe_phase("ingest", "resolve", 0.001);
        metrics.record_status_code("ingest", 200);
        metrics.record_content_length("ingest", -1.0);

        let (buffer, content_type) = metrics.encode().expect("encode");
        let text = String::from_utf8(buffer).expect("utf8");
        assert!(text.contains("probe_success{name=\"ingest\"} 1"));
        assert!(text.contains("probe_http_status_code{name=\"ingest\"} 200"));
        assert!(content_type.starts_with("text/plain"));
    }

    #[test]
    fn certificate_snapshot_feeds_the_ssl_series() {
        let metrics = CanaryMetrics::new().expect("metrics should register");
        metrics.record_certificates(&CertificateSnapshot {
            earliest_cert_expiry: Some(1_900_000_000),
            last_chain_expiry: Some(1_950_000_000),
            fingerprint_sha256: "ab".repeat(32),
            subject: "CN=canary.example.com".into(),
            issuer: "CN=Example CA".into(),
            subject_alternative: "canary.example.com".into(),
            tls_version: "TLS 1.3",
        });

        let (buffer, _) = metrics.encode().expect("encode");
        let text = String::from_utf8(buffer).expect("utf8");
        assert!(text.contains("probe_http_ssl 1"));
        assert!(text.contains("probe_tls_version_info{version=\"TLS 1.3\"} 1"));
        assert!(text.contains("probe_ssl_earliest_cert_expiry 1900000000"));
    }
}
