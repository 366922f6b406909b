use std::collections::BTreeMap;
use std::time::Instant;

use super::trace::RoundTripTrace;

pub const PHASE_RESOLVE: &str = "resolve";
pub const PHASE_CONNECT: &str = "connect";
pub const PHASE_TLS: &str = "tls";
pub const PHASE_PROCESSING: &str = "processing";
pub const PHASE_TRANSFER: &str = "transfer";

fn secs(later: Instant, earlier: Instant) -> f64 {
    later.saturating_duration_since(earlier).as_secs_f64()
}

/// Reduces the ordered roundtrip traces of one probe execution into summed
/// per-phase durations. Summing over all roundtrips attributes the latency of
/// redirect chains to the probe; the staged bail-outs make a partial failure
/// visible as missing later phases rather than zero-valued ones.
pub fn aggregate_phases(traces: &[RoundTripTrace]) -> BTreeMap<&'static str, f64> {
    let mut durations = BTreeMap::new();

    for trace in traces {
        let Some(start) = trace.start else { continue };
        let dns_done = trace.dns_done.unwrap_or(start);
        *durations.entry(PHASE_RESOLVE).or_insert(0.0) += secs(dns_done, start);

        // We never got a connection for this roundtrip.
        let Some(got_conn) = trace.got_conn else {
            continue;
        };

        if trace.is_tls {
            // dns_done must be set when got_conn is.
            if let Some(connect_done) = trace.connect_done {
                *durations.entry(PHASE_CONNECT).or_insert(0.0) += secs(connect_done, dns_done);
            }
            if let (Some(tls_start), Some(tls_done)) = (trace.tls_start, trace.tls_done) {
                *durations.entry(PHASE_TLS).or_insert(0.0) += secs(tls_done, tls_start);
            }
        } else {
            *durations.entry(PHASE_CONNECT).or_insert(0.0) += secs(got_conn, dns_done);
        }

        // We never got a response from the server.
        let Some(response_start) = trace.response_start else {
            continue;
        };
        *durations.entry(PHASE_PROCESSING).or_insert(0.0) += secs(response_start, got_conn);

        // We never read the full response, usually because the request
        // failed or was redirected away.
        let Some(end) = trace.end else { continue };
        *durations.entry(PHASE_TRANSFER).or_insert(0.0) += secs(end, response_start);
    }

    durations
}
