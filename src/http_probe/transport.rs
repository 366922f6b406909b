use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode, Version, header};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use trust_dns_resolver::TokioAsyncResolver;
use url::Url;

use crate::error::ProbeError;
use crate::metrics::CanaryMetrics;

use super::tls_info;
use super::trace::{RoundTripTrace, TraceRecorder};

const MAX_REDIRECTS: usize = 10;
const USER_AGENT: &str = concat!("canarybox/", env!("CARGO_PKG_VERSION"));

/// The final status of a probe request, after redirects were followed and
/// the body was fully drained through the byte counter and discarded.
pub struct ProbeResponse {
    pub status: StatusCode,
}

/// An HTTP client that stamps lifecycle timestamps into one trace per
/// roundtrip and annotates response metadata into the metrics. Built fresh
/// for every probe execution, so no two in-flight probes ever share trace
/// state; keep-alive is off for the same reason.
pub struct InstrumentedClient {
    name: String,
    resolver: Arc<TokioAsyncResolver>,
    tls: TlsConnector,
    metrics: Arc<CanaryMetrics>,
    recorder: Arc<TraceRecorder>,
}

impl InstrumentedClient {
    pub fn new(
        name: impl Into<String>,
        resolver: Arc<TokioAsyncResolver>,
        tls: TlsConnector,
        metrics: Arc<CanaryMetrics>,
        recorder: Arc<TraceRecorder>,
    ) -> Self {
        Self {
            name: name.into(),
            resolver,
            tls,
            metrics,
            recorder,
        }
    }

    /// Executes one request, following redirects. Each roundtrip gets its own
    /// trace; the end timestamp of the final roundtrip is stamped later by
    /// the probe completion path, once the caller is done with the response.
    pub async fn execute(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ProbeResponse, ProbeError> {
        let mut method = method;
        let mut url = url;
        let mut body = body;

        for _ in 0..=MAX_REDIRECTS {
            let response = self.round_trip(&method, &url, &headers, body.clone()).await?;
            let status = response.status();
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            self.drain_body(response.into_body()).await?;

            if status.is_redirection() {
                let location = location.ok_or(ProbeError::BadRedirect)?;
                url = url.join(&location)?;
                log::debug!("probe {}: redirected to {url}", self.name);
                // 301/302/303 switch to GET, 307/308 keep the method.
                if matches!(
                    status,
                    StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
                ) {
                    method = Method::GET;
                    body = Bytes::new();
                }
                continue;
            }

            return Ok(ProbeResponse { status });
        }

        Err(ProbeError::TooManyRedirects(MAX_REDIRECTS))
    }

    /// One roundtrip. The trace is built exclusively by this call and handed
    /// to the recorder once the response head is in, once the attempt failed,
    /// or when the roundtrip future is dropped at a deadline mid-flight;
    /// partial traces still count towards the phases they reached.
    async fn round_trip(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Incoming>, ProbeError> {
        log::debug!("probe {}: {method} {url}", self.name);

        let mut handoff = TraceHandoff {
            recorder: Arc::clone(&self.recorder),
            trace: RoundTripTrace::new(url.scheme() == "https"),
        };
        let result = self
            .dispatch(&mut handoff.trace, method, url, headers, body)
            .await;
        drop(handoff);

        let response = result?;
        self.metrics
            .record_status_code(&self.name, response.status().as_u16());
        self.metrics
            .record_content_length(&self.name, content_length(response.headers()));
        self.metrics
            .record_http_version(&self.name, http_version_number(response.version()));
        Ok(response)
    }

    async fn dispatch(
        &self,
        trace: &mut RoundTripTrace,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Incoming>, ProbeError> {
        let host = url.host_str().ok_or(ProbeError::MissingHost)?;
        let port = url
            .port_or_known_default()
            .unwrap_or(if trace.is_tls { 443 } else { 80 });

        let addr = match host.parse::<IpAddr>() {
            // Connecting to an IP directly, there is no DNS phase to time.
            Ok(ip) => SocketAddr::new(ip, port),
            Err(_) => {
                trace.mark_dns_start();
                let lookup = self.resolver.lookup_ip(host).await;
                trace.mark_dns_done();
                let ip = lookup
                    .map_err(|source| ProbeError::Resolve {
                        host: host.to_string(),
                        source,
                    })?
                    .iter()
                    .next()
                    .ok_or_else(|| ProbeError::NoRecords(host.to_string()))?;
                SocketAddr::new(ip, port)
            }
        };

        trace.mark_connect_start();
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|source| ProbeError::Connect { addr, source })?;
        trace.mark_connect_done();

        let request = build_request(method, url, headers, body)?;

        if trace.is_tls {
            trace.mark_tls_start();
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| ProbeError::ServerName(host.to_string()))?;
            let stream = self
                .tls
                .connect(server_name, tcp)
                .await
                .map_err(|source| ProbeError::Tls {
                    host: host.to_string(),
                    source,
                })?;
            trace.mark_tls_done();

            let (_, session) = stream.get_ref();
            let version_label = tls_info::tls_version_label(session.protocol_version());
            match tls_info::inspect_certificates(
                session.peer_certificates().unwrap_or_default(),
                session.protocol_version(),
            ) {
                Some(snapshot) => self.metrics.record_certificates(&snapshot),
                None => {
                    log::warn!("TLS session with {host} presented no usable peer certificate");
                    self.metrics.record_tls_session(version_label);
                }
            }

            self.request_over(trace, stream, request).await
        } else {
            self.request_over(trace, tcp, request).await
        }
    }

    async fn request_over<T>(
        &self,
        trace: &mut RoundTripTrace,
        io: T,
        request: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, ProbeError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, connection) = http1::handshake(TokioIo::new(io)).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                log::debug!("probe connection task ended: {err}");
            }
        });
        trace.mark_got_conn();

        let response = sender.send_request(request).await?;
        trace.mark_response_start();
        Ok(response)
    }

    /// Reads the body to the end, feeding every frame length through the
    /// cumulative byte counter. The bytes themselves are discarded; redirect
    /// bodies run through here too so transferred bytes are attributed to
    /// the probe that caused them.
    async fn drain_body(&self, mut body: Incoming) -> Result<(), ProbeError> {
        while let Some(frame) = body.frame().await {
            if let Some(data) = frame?.data_ref() {
                self.recorder.add_body_bytes(data.len());
            }
        }
        Ok(())
    }
}

/// Delivers the roundtrip trace to the recorder exactly once, on drop. The
/// probe future can be cancelled at the cycle deadline between any two
/// awaits, so the handover must not depend on the happy path running.
struct TraceHandoff {
    recorder: Arc<TraceRecorder>,
    trace: RoundTripTrace,
}

impl Drop for TraceHandoff {
    fn drop(&mut self) {
        self.recorder.push(self.trace);
    }
}

fn build_request(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Request<Full<Bytes>>, ProbeError> {
    let host = url.host_str().ok_or(ProbeError::MissingHost)?;
    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    let mut builder = Request::builder()
        .method(method.clone())
        .uri(path)
        .header(header::HOST, host_header)
        .header(header::USER_AGENT, USER_AGENT)
        .header(header::CONNECTION, "close");
    for (key, value) in headers {
        builder = builder.header(key, value.clone());
    }

    Ok(builder.body(Full::new(body))?)
}

fn content_length(headers: &HeaderMap) -> f64 {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(-1.0)
}

fn http_version_number(version: Version) -> f64 {
    match version {
        Version::HTTP_09 => 0.9,
        Version::HTTP_10 => 1.0,
        Version::HTTP_11 => 1.1,
        Version::HTTP_2 => 2.0,
        Version::HTTP_3 => 3.0,
        _ => 0.0,
    }
}
