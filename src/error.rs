use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised while executing a single probe request.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid probe URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("probe URL has no host")]
    MissingHost,

    #[error("DNS resolution for {host} failed: {source}")]
    Resolve {
        host: String,
        #[source]
        source: trust_dns_resolver::error::ResolveError,
    },

    #[error("no address records for {0}")]
    NoRecords(String),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TLS server name: {0}")]
    ServerName(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("failed to build request: {0}")]
    Request(#[from] http::Error),

    #[error("unexpected status: {0}")]
    Status(http::StatusCode),

    #[error("redirect without a usable location header")]
    BadRedirect,

    #[error("redirect limit of {0} exceeded")]
    TooManyRedirects(usize),

    #[error("deadline exceeded")]
    Deadline,
}

/// Aggregate outcome of one probe cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("error during ingestion: {0}")]
    Ingest(#[source] ProbeError),

    #[error("{failed} error(s) reported from query probes")]
    QueryProbes { failed: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Errors fatal to the exporter process.
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("invalid target URL: {0}")]
    TargetUrl(#[from] url::ParseError),

    #[error("invalid listen address {addr}: {source}")]
    ListenAddr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("failed to bind metrics listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}
