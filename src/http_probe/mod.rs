pub mod phases;
pub mod tls_info;
pub mod trace;
pub mod transport;

pub mod prelude {
    pub use super::phases::aggregate_phases;
    pub use super::trace::{RoundTripTrace, TraceRecorder};
    pub use super::transport::{InstrumentedClient, ProbeResponse};
}
