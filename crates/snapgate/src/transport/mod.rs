//! Transport layer for snapgate.
//!
//! Currently provides HTTP transport via axum. The peer-to-peer streaming
//! transport lives with the rpc registry; other outward surfaces would be
//! added as separate submodules.

pub mod http;

pub use http::{ServerConfig, serve};
