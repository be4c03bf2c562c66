//! Shared fixtures for gateway integration tests: an in-process gateway
//! context wired the way `Gateway::new` wires it, request builders, and a
//! cache backend that fails every operation.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{Method, Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use storage_gateway::cache_store::{CacheStore, CachedEntry, MemoryCacheStore};
use storage_gateway::config::Config;
use storage_gateway::gateway::{Gateway, GatewayContext};
use storage_gateway::storage_rpc::MemoryStorageRpc;
use storage_gateway::{GatewayError, Result};

/// Gateway wiring over in-memory collaborators, ready to drive requests.
pub struct TestEnv {
    pub storage: Arc<MemoryStorageRpc>,
    pub cache: Arc<MemoryCacheStore>,
    pub ctx: GatewayContext,
}

/// Build a context through the production constructor so the cache mode and
/// RPC timeout wiring match the real server.
pub fn env_with(config: Config) -> TestEnv {
    let storage = Arc::new(MemoryStorageRpc::new());
    let cache = Arc::new(MemoryCacheStore::new());
    let gateway = Gateway::new(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(config),
        Arc::clone(&storage) as Arc<dyn storage_gateway::storage_rpc::StorageRpc>,
        Arc::clone(&cache) as Arc<dyn CacheStore>,
    )
    .expect("gateway construction should succeed");
    TestEnv {
        storage,
        cache,
        ctx: gateway.context(),
    }
}

/// Default configuration sized for fast tests: 1 MiB threshold, 2 MiB chunks.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.object.threshold_obj_len = 1024 * 1024;
    config.object.chunked_obj_len = 2 * 1024 * 1024;
    config
}

pub fn client_addr() -> SocketAddr {
    "127.0.0.1:45678".parse().unwrap()
}

pub fn get_request(path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

pub fn get_request_with(path: &str, headers: &[(&str, &str)]) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method(Method::GET).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}

pub fn put_request(path: &str, body: Vec<u8>) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::PUT)
        .uri(path)
        .header("content-length", body.len())
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Drain a response body to bytes, driving any background streamer.
pub async fn collect_body(response: Response<BoxBody<Bytes, hyper::Error>>) -> Bytes {
    response
        .into_body()
        .collect()
        .await
        .expect("body collection should succeed")
        .to_bytes()
}

pub fn header<'a>(
    response: &'a Response<BoxBody<Bytes, hyper::Error>>,
    name: &str,
) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Cache backend whose every operation errors; the data path must shrug it
/// off.
pub struct FailingCacheStore;

#[async_trait]
impl CacheStore for FailingCacheStore {
    async fn get(&self, _key: &[u8]) -> Result<Option<CachedEntry>> {
        Err(GatewayError::CacheError("injected get failure".into()))
    }

    async fn put(&self, _key: &[u8], _entry: CachedEntry) -> Result<()> {
        Err(GatewayError::CacheError("injected put failure".into()))
    }

    async fn delete(&self, _key: &[u8]) -> Result<()> {
        Err(GatewayError::CacheError("injected delete failure".into()))
    }
}
