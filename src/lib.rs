//! Storage Gateway - Object-serving HTTP gateway for a content-addressed
//! storage cluster.
//!
//! This library provides the data plane of the gateway: chunked large-object
//! uploads and streaming reads against the cluster RPC interface, plus an
//! edge response cache that runs either inline in the object handlers or as
//! request/response interceptors.

pub mod cache_store;
pub mod chunk_key;
pub mod config;
pub mod digest;
pub mod edge_cache;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod read_streamer;
pub mod shutdown;
pub mod storage_rpc;
pub mod tls;
pub mod upload_session;

pub use error::{GatewayError, Result};
