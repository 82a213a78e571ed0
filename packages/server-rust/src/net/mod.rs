//! Wire I/O: framing, the request listener, and the cluster client.

pub mod client;
pub mod server;
pub mod wire;

pub use client::ClusterClient;
