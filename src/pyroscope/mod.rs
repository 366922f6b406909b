pub mod client;

pub use client::PyroscopeClient;
