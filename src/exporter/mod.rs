use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{Request, Response, StatusCode, header};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_rustls::TlsConnector;
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use url::Url;

use crate::config::{CanaryConfig, QueryProbeSet};
use crate::error::{CycleError, ExporterError, ProbeError};
use crate::http_probe::prelude::*;
use crate::metrics::CanaryMetrics;
use crate::pyroscope::PyroscopeClient;

/// The query operations probed after every ingest. `default` keeps the cheap
/// merge-profile read-back, `all` exercises the full query surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryProbe {
    SelectMergeProfile,
    ProfileTypes,
    Series,
    LabelNames,
    LabelValues,
    SelectSeries,
    SelectMergeStacktraces,
    SelectMergeSpanProfile,
    GetProfileStats,
    Render,
    RenderDiff,
}

impl QueryProbe {
    pub fn name(self) -> &'static str {
        match self {
            Self::SelectMergeProfile => "query-select-merge-profile",
            Self::ProfileTypes => "query-profile-types",
            Self::Series => "query-series",
            Self::LabelNames => "query-label-names",
            Self::LabelValues => "query-label-values",
            Self::SelectSeries => "query-select-series",
            Self::SelectMergeStacktraces => "query-select-merge-stacktraces",
            Self::SelectMergeSpanProfile => "query-select-merge-span-profile",
            Self::GetProfileStats => "query-get-profile-stats",
            Self::Render => "render",
            Self::RenderDiff => "render-diff",
        }
    }

    pub fn catalog(set: QueryProbeSet) -> Vec<QueryProbe> {
        let mut probes = vec![Self::SelectMergeProfile];
        if set == QueryProbeSet::All {
            probes.extend([
                Self::ProfileTypes,
                Self::Series,
                Self::LabelNames,
                Self::LabelValues,
                Self::SelectSeries,
                Self::SelectMergeStacktraces,
                Self::SelectMergeSpanProfile,
                Self::GetProfileStats,
                Self::Render,
                Self::RenderDiff,
            ]);
        }
        probes
    }

    async fn run(self, client: &PyroscopeClient, now: DateTime<Utc>) -> Result<(), ProbeError> {
        match self {
            Self::SelectMergeProfile => client.select_merge_profile(now).await,
            Self::ProfileTypes => client.profile_types(now).await,
            Self::Series => client.series(now).await,
            Self::LabelNames => client.label_names(now).await,
            Self::LabelValues => client.label_values(now).await,
            Self::SelectSeries => client.select_series(now).await,
            Self::SelectMergeStacktraces => client.select_merge_stacktraces(now).await,
            Self::SelectMergeSpanProfile => client.select_merge_span_profile(now).await,
            Self::GetProfileStats => client.get_profile_stats(now).await,
            Self::Render => client.render(now).await,
            Self::RenderDiff => client.render_diff(now).await,
        }
    }
}

/// Tests a Pyroscope cell on a fixed cadence: ingest one synthetic profile,
/// wait the configured delay, then query the data back, recording success and
/// per-phase timing of every probe.
pub struct CanaryExporter {
    config: CanaryConfig,
    metrics: Arc<CanaryMetrics>,
    resolver: Arc<TokioAsyncResolver>,
    tls: TlsConnector,
    base_url: Url,
    query_probes: Vec<QueryProbe>,
    hostname: String,
}

impl CanaryExporter {
    pub fn new(config: CanaryConfig, metrics: Arc<CanaryMetrics>) -> Result<Self, ExporterError> {
        let base_url = Url::parse(&config.target.url)?;
        let resolver = Arc::new(
            TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }),
        );

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        let query_probes = QueryProbe::catalog(config.query_probe_set);

        Ok(Self {
            config,
            metrics,
            resolver,
            tls: TlsConnector::from(Arc::new(tls_config)),
            base_url,
            query_probes,
            hostname,
        })
    }

    /// Runs one cycle immediately, then keeps probing on the configured
    /// frequency while the metrics endpoint serves scrapes. Only a failure to
    /// bind the listener is fatal; cycle errors are logged and the next tick
    /// proceeds.
    pub async fn run(self: Arc<Self>) -> Result<(), ExporterError> {
        self.run_cycle().await;

        let exporter = Arc::clone(&self);
        tokio::spawn(async move {
            let frequency = exporter.config.test_frequency();
            let mut ticker = tokio::time::interval(frequency);
            // Cycles are serialized; a tick that fires while the previous
            // cycle is still running is skipped rather than overlapped.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                exporter.run_cycle().await;
            }
        });

        self.serve_metrics().await
    }

    async fn run_cycle(&self) {
        if let Err(err) = self.test_cell().await {
            log::error!("error testing pyroscope cell: {err}");
        }
    }

    /// One probe cycle: ingest, delay, then every configured query probe.
    /// An ingest failure aborts the cycle, the queries would be meaningless
    /// without ingested data. Query probes never short-circuit each other, so
    /// one cycle surfaces every failing query type.
    ///
    /// All probes of the cycle share one deadline, the test frequency from
    /// the cycle start. A probe that is still in flight when it fires is
    /// recorded as a failure with the phases it reached, and the probes after
    /// it fail immediately, so the cycle never holds its slot much longer
    /// than the frequency.
    pub async fn test_cell(&self) -> Result<(), CycleError> {
        let now = Utc::now();
        let deadline = tokio::time::Instant::now() + self.config.test_frequency();

        self.run_probe("ingest", deadline, |client| async move {
            client.ingest_profile(now).await
        })
        .await
        .map_err(CycleError::Ingest)?;

        let delay = self.config.test_delay();
        if !delay.is_zero() {
            log::info!("waiting {delay:?} before running queries");
            tokio::time::sleep(delay).await;
        }

        let mut failed = 0;
        for probe in &self.query_probes {
            let result = self
                .run_probe(probe.name(), deadline, |client| async move {
                    probe.run(&client, now).await
                })
                .await;
            if result.is_err() {
                failed += 1;
            }
        }

        if failed > 0 {
            Err(CycleError::QueryProbes { failed })
        } else {
            Ok(())
        }
    }

    /// Wraps one probe execution: a fresh instrumented client, the cycle
    /// deadline, then the completion path that runs regardless of outcome:
    /// stamp the end of the last roundtrip, record the body size and the
    /// aggregated phase durations, and flag the result.
    async fn run_probe<F, Fut>(
        &self,
        name: &str,
        deadline: tokio::time::Instant,
        probe: F,
    ) -> Result<(), ProbeError>
    where
        F: FnOnce(PyroscopeClient) -> Fut,
        Fut: Future<Output = Result<(), ProbeError>>,
    {
        log::info!("starting probe {name}");
        let recorder = Arc::new(TraceRecorder::new());
        let client = PyroscopeClient::new(
            self.base_url.clone(),
            self.config.target.tenant_id.clone(),
            self.hostname.clone(),
            InstrumentedClient::new(
                name,
                Arc::clone(&self.resolver),
                self.tls.clone(),
                Arc::clone(&self.metrics),
                Arc::clone(&recorder),
            ),
        );

        // The timeout drops the probe future at the deadline; the roundtrip
        // in flight has already handed its trace to the recorder by then, so
        // the completion path below still sees the phases it reached.
        let result = match tokio::time::timeout_at(deadline, probe(client)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Deadline),
        };

        recorder.finish();
        self.metrics.record_body_size(name, recorder.body_bytes());
        for (phase, seconds) in aggregate_phases(&recorder.take_traces()) {
            self.metrics.observe_phase(name, phase, seconds);
        }

        match &result {
            Ok(()) => {
                log::info!("probe {name} successful");
                self.metrics.record_success(name, true);
            }
            Err(err) => {
                log::error!("probe {name} failed: {err}");
                self.metrics.record_success(name, false);
            }
        }
        result
    }

    async fn serve_metrics(&self) -> Result<(), ExporterError> {
        let addr: SocketAddr =
            self.config
                .listen_address
                .parse()
                .map_err(|source| ExporterError::ListenAddr {
                    addr: self.config.listen_address.clone(),
                    source,
                })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ExporterError::Bind { addr, source })?;
        log::info!("serving metrics on http://{addr}/metrics");

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::error!("failed to accept metrics connection: {err}");
                    continue;
                }
            };
            let metrics = Arc::clone(&self.metrics);
            tokio::spawn(async move {
                let service = service_fn(move |request| {
                    let metrics = Arc::clone(&metrics);
                    async move { handle_request(request, metrics) }
                });
                if let Err(err) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    log::debug!("metrics connection error: {err}");
                }
            });
        }
    }
}

fn handle_request(
    request: Request<Incoming>,
    metrics: Arc<CanaryMetrics>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match request.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok((buffer, content_type)) => Response::builder()
                .header(header::CONTENT_TYPE, content_type)
                .body(Full::new(Bytes::from(buffer))),
            Err(err) => {
                log::error!("failed to encode metrics: {err}");
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from_static(b"encoding error")))
            }
        },
        "/" => Response::builder()
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Full::new(Bytes::from_static(
                b"<html>\n\
                  <head><title>Pyroscope Canary Exporter</title></head>\n\
                  <body>\n\
                  <h1>Pyroscope Canary Exporter</h1>\n\
                  <p><a href=\"/metrics\">Metrics</a></p>\n\
                  </body>\n\
                  </html>",
            ))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found"))),
    };

    Ok(response.expect("static response must build"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal HTTP/1.1 fixture: records the path of every request and
    /// answers 200, or 500 for paths starting with a configured prefix.
    async fn spawn_backend(fail_prefixes: Vec<&'static str>) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let record = Arc::clone(&record);
                let fail_prefixes = fail_prefixes.clone();
                tokio::spawn(async move {
                    let mut buffer = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let head_end = loop {
                        let Ok(n) = stream.read(&mut chunk).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        buffer.extend_from_slice(&chunk[..n]);
                        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };

                    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
                    let content_length = head
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    while buffer.len() < head_end + content_length {
                        let Ok(n) = stream.read(&mut chunk).await else {
                            return;
                        };
                        if n == 0 {
                            break;
                        }
                        buffer.extend_from_slice(&chunk[..n]);
                    }

                    let path = head
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or("")
                        .split('?')
                        .next()
                        .unwrap_or("")
                        .to_string();
                    record.lock().unwrap().push(path.clone());

                    let response = if fail_prefixes.iter().any(|p| path.starts_with(p)) {
                        "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\nboom"
                    } else {
                        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
                    };
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        (addr, seen)
    }

    /// Answers the first `answer` requests with 200, then leaves every later
    /// request unanswered with the connection open.
    async fn spawn_stalling_backend(answer: usize) -> SocketAddr {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let remaining = Arc::new(AtomicUsize::new(answer));

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let remaining = Arc::clone(&remaining);
                tokio::spawn(async move {
                    let mut sink = [0u8; 4096];
                    let Ok(n) = stream.read(&mut sink).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    let answered = remaining
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();
                    if answered {
                        let _ = stream
                            .write_all(
                                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                            )
                            .await;
                        let _ = stream.shutdown().await;
                    } else {
                        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                    }
                });
            }
        });

        addr
    }

    fn exporter_for(addr: SocketAddr, set: QueryProbeSet) -> CanaryExporter {
        exporter_with_frequency(addr, set, 15)
    }

    fn exporter_with_frequency(
        addr: SocketAddr,
        set: QueryProbeSet,
        test_frequency_seconds: u64,
    ) -> CanaryExporter {
        let config = CanaryConfig {
            listen_address: "127.0.0.1:0".to_string(),
            test_frequency_seconds,
            test_delay_seconds: 0,
            query_probe_set: set,
            target: TargetConfig {
                url: format!("http://{addr}"),
                tenant_id: Some("canary-test".to_string()),
            },
        };
        let metrics = Arc::new(CanaryMetrics::new().unwrap());
        CanaryExporter::new(config, metrics).unwrap()
    }

    #[tokio::test]
    async fn successful_cycle_records_every_probe() {
        let (addr, seen) = spawn_backend(Vec::new()).await;
        let exporter = exporter_for(addr, QueryProbeSet::Default);

        exporter.test_cell().await.expect("cycle should succeed");

        let paths = seen.lock().unwrap().clone();
        assert_eq!(
            paths,
            vec![
                "/ingest".to_string(),
                "/querier.v1.QuerierService/SelectMergeProfile".to_string(),
            ]
        );
        assert_eq!(exporter.metrics.success_value("ingest"), 1.0);
        assert_eq!(
            exporter.metrics.success_value("query-select-merge-profile"),
            1.0
        );
        assert_eq!(exporter.metrics.status_code_value("ingest"), 200.0);
        // The fixture body is "ok"; its bytes were drained and counted.
        assert_eq!(exporter.metrics.body_size_value("ingest"), 2.0);
    }

    #[tokio::test]
    async fn ingest_failure_aborts_the_cycle_before_any_query() {
        let (addr, seen) = spawn_backend(vec!["/ingest"]).await;
        let exporter = exporter_for(addr, QueryProbeSet::All);

        let err = exporter.test_cell().await.expect_err("cycle should fail");
        assert!(matches!(err, CycleError::Ingest(_)));

        let paths = seen.lock().unwrap().clone();
        assert_eq!(paths, vec!["/ingest".to_string()]);
        assert_eq!(exporter.metrics.success_value("ingest"), 0.0);
    }

    #[tokio::test]
    async fn failing_query_probes_are_counted_not_short_circuited() {
        let (addr, seen) = spawn_backend(vec![
            "/querier.v1.QuerierService/LabelNames",
            "/pyroscope/render-diff",
        ])
        .await;
        let exporter = exporter_for(addr, QueryProbeSet::All);

        let err = exporter.test_cell().await.expect_err("cycle should fail");
        assert_eq!(err.to_string(), "2 error(s) reported from query probes");

        // Ingest plus all eleven query probes ran, exactly once each.
        let paths = seen.lock().unwrap().clone();
        assert_eq!(paths.len(), 12);
        assert_eq!(
            paths
                .iter()
                .filter(|p| p.as_str() == "/querier.v1.QuerierService/LabelNames")
                .count(),
            1
        );
        assert_eq!(exporter.metrics.success_value("query-label-names"), 0.0);
        assert_eq!(exporter.metrics.success_value("query-series"), 1.0);
    }

    #[tokio::test]
    async fn interrupted_probe_is_recorded_as_a_failure() {
        // Two requests succeed (the whole first cycle), then the backend
        // stops answering and the second cycle's ingest hangs until the
        // deadline fires.
        let addr = spawn_stalling_backend(2).await;
        let exporter = exporter_with_frequency(addr, QueryProbeSet::Default, 1);

        exporter.test_cell().await.expect("first cycle should succeed");
        assert_eq!(exporter.metrics.success_value("ingest"), 1.0);

        let err = exporter
            .test_cell()
            .await
            .expect_err("second cycle should hit the deadline");
        assert!(matches!(err, CycleError::Ingest(ProbeError::Deadline)));

        // The interrupted probe flips the gauge instead of leaving the
        // previous cycle's success in place.
        assert_eq!(exporter.metrics.success_value("ingest"), 0.0);

        // It still contributes the phases it reached: the request went out,
        // so resolve and connect gained a second sample, while processing
        // only has the one from the answered cycle.
        assert_eq!(exporter.metrics.phase_sample_count("ingest", "resolve"), 2);
        assert_eq!(exporter.metrics.phase_sample_count("ingest", "connect"), 2);
        assert_eq!(
            exporter.metrics.phase_sample_count("ingest", "processing"),
            1
        );
    }

    #[test]
    fn default_catalog_is_the_merge_profile_probe() {
        let probes = QueryProbe::catalog(QueryProbeSet::Default);
        assert_eq!(probes, vec![QueryProbe::SelectMergeProfile]);
        assert_eq!(QueryProbe::catalog(QueryProbeSet::All).len(), 11);
    }
}
