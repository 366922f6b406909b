use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Timings of a single HTTP roundtrip. Every timestamp is set at most once,
/// in protocol order; an unset timestamp means the roundtrip never reached
/// that point.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundTripTrace {
    pub is_tls: bool,
    pub start: Option<Instant>,
    pub dns_done: Option<Instant>,
    pub connect_done: Option<Instant>,
    pub got_conn: Option<Instant>,
    pub response_start: Option<Instant>,
    pub end: Option<Instant>,
    pub tls_start: Option<Instant>,
    pub tls_done: Option<Instant>,
}

impl RoundTripTrace {
    pub fn new(is_tls: bool) -> Self {
        Self {
            is_tls,
            ..Self::default()
        }
    }

    pub fn mark_dns_start(&mut self) {
        if self.start.is_none() {
            self.start = Some(Instant::now());
        }
    }

    pub fn mark_dns_done(&mut self) {
        if self.dns_done.is_none() {
            self.dns_done = Some(Instant::now());
        }
    }

    /// No DNS resolution happens when connecting to an IP directly; backfill
    /// both resolution timestamps so the resolve phase shows up as a
    /// zero-duration sample instead of going missing.
    pub fn mark_connect_start(&mut self) {
        if self.dns_done.is_none() {
            let now = Instant::now();
            self.start = Some(now);
            self.dns_done = Some(now);
        }
    }

    pub fn mark_connect_done(&mut self) {
        if self.connect_done.is_none() {
            self.connect_done = Some(Instant::now());
        }
    }

    pub fn mark_got_conn(&mut self) {
        if self.got_conn.is_none() {
            self.got_conn = Some(Instant::now());
        }
    }

    pub fn mark_response_start(&mut self) {
        if self.response_start.is_none() {
            self.response_start = Some(Instant::now());
        }
    }

    pub fn mark_end(&mut self) {
        if self.end.is_none() {
            self.end = Some(Instant::now());
        }
    }

    pub fn mark_tls_start(&mut self) {
        if self.tls_start.is_none() {
            self.tls_start = Some(Instant::now());
        }
    }

    pub fn mark_tls_done(&mut self) {
        if self.tls_done.is_none() {
            self.tls_done = Some(Instant::now());
        }
    }
}

/// Collects the traces of one probe execution across redirects, plus the
/// cumulative response body size. Each roundtrip builds its trace exclusively
/// and hands it over here once the response head (or the failure) is in; the
/// list is only read back after the probe's completion callback ran.
#[derive(Debug, Default)]
pub struct TraceRecorder {
    traces: Mutex<Vec<RoundTripTrace>>,
    body_bytes: AtomicU64,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, trace: RoundTripTrace) {
        self.traces.lock().expect("trace list poisoned").push(trace);
    }

    pub fn add_body_bytes(&self, n: usize) {
        self.body_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn body_bytes(&self) -> u64 {
        self.body_bytes.load(Ordering::Relaxed)
    }

    /// Stamps the end of the final roundtrip. Called once the body has been
    /// fully drained, from the probe completion path.
    pub fn finish(&self) {
        if let Some(last) = self.traces.lock().expect("trace list poisoned").last_mut() {
            last.mark_end();
        }
    }

    pub fn take_traces(&self) -> Vec<RoundTripTrace> {
        std::mem::take(&mut *self.traces.lock().expect("trace list poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_start_backfills_missing_dns_phase() {
        let mut trace = RoundTripTrace::new(false);
        trace.mark_connect_start();
        assert!(trace.start.is_some());
        assert_eq!(trace.start, trace.dns_done);
    }

    #[test]
    fn connect_start_keeps_real_dns_timestamps() {
        let mut trace = RoundTripTrace::new(false);
        trace.mark_dns_start();
        trace.mark_dns_done();
        let (start, dns_done) = (trace.start, trace.dns_done);
        trace.mark_connect_start();
        assert_eq!(trace.start, start);
        assert_eq!(trace.dns_done, dns_done);
    }

    #[test]
    fn timestamps_are_set_once() {
        let mut trace = RoundTripTrace::new(true);
        trace.mark_got_conn();
        let first = trace.got_conn;
        std::thread::sleep(std::time::Duration::from_millis(2));
        trace.mark_got_conn();
        assert_eq!(trace.got_conn, first);
    }

    #[test]
    fn finish_stamps_only_the_last_trace() {
        let recorder = TraceRecorder::new();
        recorder.push(RoundTripTrace::new(false));
        recorder.push(RoundTripTrace::new(false));
        recorder.finish();
        let traces = recorder.take_traces();
        assert!(traces[0].end.is_none());
        assert!(traces[1].end.is_some());
    }

    #[test]
    fn body_bytes_accumulate() {
        let recorder = TraceRecorder::new();
        recorder.add_body_bytes(10);
        recorder.add_body_bytes(32);
        assert_eq!(recorder.body_bytes(), 42);
    }
}
