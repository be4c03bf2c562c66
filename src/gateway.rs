//! Gateway Module
//!
//! The object-serving HTTP front end: accept loop, per-connection serving,
//! and the request dispatcher that routes GET/HEAD/PUT/DELETE between the
//! edge cache, the small-object path, and the large-object streaming engine.
//!
//! Each request is handled by exactly one task end-to-end; upload sessions
//! and read streamers are owned by that task and never shared. Cache
//! failures never surface to the client.

use crate::cache_store::CacheStore;
use crate::config::Config;
use crate::digest::format_etag;
use crate::edge_cache::{
    format_http_date, CacheInterceptor, CachedLookup, EdgeCache, InterceptedResponse,
};
use crate::logging::{AccessLogBuffer, AccessLogEntry};
use crate::read_streamer::{normalize_range, ChannelBodySink, LargeReadStreamer};
use crate::shutdown::ShutdownSignal;
use crate::storage_rpc::{ObjectMetadata, StorageRpc, TimeoutStorageRpc};
use crate::upload_session::LargeUploadSession;
use crate::{GatewayError, Result};
use bytes::{Bytes, BytesMut};
use http_body_util::{combinators::BoxBody, BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Value of the Server response header.
const SERVER_HEADER: &str = concat!("storage-gateway/", env!("CARGO_PKG_VERSION"));

/// Default content type for object bodies.
const OCTET_STREAM: &str = "application/octet-stream";

type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Shared handler state cloned into every request task.
#[derive(Clone)]
pub struct GatewayContext {
    pub config: Arc<Config>,
    pub storage: Arc<dyn StorageRpc>,
    pub cache: Arc<dyn CacheStore>,
    /// Present in internal cache mode
    pub edge_cache: Option<Arc<EdgeCache>>,
    /// Present in interceptor cache mode
    pub interceptor: Option<Arc<CacheInterceptor>>,
    pub access_log: Option<Arc<AccessLogBuffer>>,
    pub semaphore: Arc<Semaphore>,
}

/// HTTP gateway server for object requests against the storage cluster
pub struct Gateway {
    listen_addr: SocketAddr,
    ctx: GatewayContext,
    active_connections: Arc<AtomicUsize>,
}

impl Gateway {
    /// Create a new gateway instance.
    ///
    /// Every storage call is bounded by the configured RPC timeout; the
    /// cache mode decides which of the two edge-cache shapes is wired in.
    pub fn new(
        listen_addr: SocketAddr,
        config: Arc<Config>,
        storage: Arc<dyn StorageRpc>,
        cache: Arc<dyn CacheStore>,
    ) -> Result<Self> {
        let storage: Arc<dyn StorageRpc> = Arc::new(TimeoutStorageRpc::new(
            storage,
            config.object.rpc_timeout,
        ));

        let (edge_cache, interceptor) = if config.cache.is_internal_mode() {
            let edge = EdgeCache::new(Arc::clone(&cache), &config.cache);
            (Some(Arc::new(edge)), None)
        } else {
            let interceptor = CacheInterceptor::new(Arc::clone(&cache), &config.cache)?;
            (None, Some(Arc::new(interceptor)))
        };

        let semaphore = Arc::new(Semaphore::new(config.server.max_concurrent_requests));

        Ok(Self {
            listen_addr,
            ctx: GatewayContext {
                config,
                storage,
                cache,
                edge_cache,
                interceptor,
                access_log: None,
                semaphore,
            },
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Set the access log buffer for request logging
    pub fn set_access_log(&mut self, access_log: Arc<AccessLogBuffer>) {
        self.ctx.access_log = Some(access_log);
    }

    /// Handler state for driving requests without a listener (tests, TLS
    /// listener wiring).
    pub fn context(&self) -> GatewayContext {
        self.ctx.clone()
    }

    /// Start the gateway server
    pub async fn start(&self, mut shutdown_signal: ShutdownSignal) -> Result<()> {
        let listener = Arc::new(TcpListener::bind(self.listen_addr).await?);
        info!("Gateway listening on {}", self.listen_addr);

        // Fan the external shutdown signal out to every acceptor task.
        let (acceptor_tx, _) = broadcast::channel::<()>(1);

        for acceptor_id in 0..self.ctx.config.server.num_of_acceptors {
            let listener = Arc::clone(&listener);
            let ctx = self.ctx.clone();
            let active_connections = Arc::clone(&self.active_connections);
            let mut acceptor_shutdown = ShutdownSignal::new(acceptor_tx.subscribe());

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        accept_result = listener.accept() => {
                            match accept_result {
                                Ok((stream, addr)) => {
                                    debug!("Connection from {} (acceptor {})", addr, acceptor_id);

                                    if let Err(e) = stream.set_nodelay(true) {
                                        warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                                    }

                                    let ctx = ctx.clone();
                                    let active_connections = Arc::clone(&active_connections);
                                    tokio::spawn(async move {
                                        Self::serve_connection(stream, addr, ctx, active_connections).await;
                                    });
                                }
                                Err(e) => {
                                    error!("Failed to accept connection: {}", e);
                                }
                            }
                        }
                        _ = acceptor_shutdown.wait_for_shutdown() => {
                            debug!("Acceptor {} stopping", acceptor_id);
                            break;
                        }
                    }
                }
            });
        }

        shutdown_signal.wait_for_shutdown().await;
        info!("Gateway received shutdown signal, stopping acceptors");
        let _ = acceptor_tx.send(());

        // Drain period: wait for in-flight connections to complete.
        let drain_timeout = Duration::from_secs(5);
        let drain_start = std::time::Instant::now();
        while self.active_connections.load(Ordering::Relaxed) > 0
            && drain_start.elapsed() < drain_timeout
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.active_connections.load(Ordering::Relaxed);
        if remaining > 0 {
            warn!("Gateway shutdown with {} connections still active", remaining);
        }

        info!("Gateway stopped");
        Ok(())
    }

    /// Serve a single connection
    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: GatewayContext,
        active_connections: Arc<AtomicUsize>,
    ) {
        let io = TokioIo::new(stream);
        active_connections.fetch_add(1, Ordering::Relaxed);

        let max_keepalive = ctx.config.server.max_keepalive;
        let served = Arc::new(AtomicUsize::new(0));

        let service = service_fn(move |req| {
            let ctx = ctx.clone();
            let served = Arc::clone(&served);
            async move {
                let mut response = handle_request(req, addr, ctx).await?;
                // Close the connection after max_keepalive requests.
                if served.fetch_add(1, Ordering::Relaxed) + 1 >= max_keepalive {
                    response
                        .headers_mut()
                        .insert(hyper::header::CONNECTION, "close".parse().unwrap());
                }
                Ok::<_, Infallible>(response)
            }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            let err_str = err.to_string();
            if err_str.contains("connection closed")
                || err_str.contains("broken pipe")
                || err_str.contains("reset by peer")
                || err.is_canceled()
            {
                debug!("Client disconnected from {}: {}", addr, err);
            } else {
                error!("Error serving connection from {}: {}", addr, err);
            }
        }

        active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Handle a single HTTP request
pub async fn handle_request<B>(
    req: Request<B>,
    client_addr: SocketAddr,
    ctx: GatewayContext,
) -> std::result::Result<Response<ResponseBody>, Infallible>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::fmt::Display,
{
    let start_time = std::time::Instant::now();

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let headers: HashMap<String, String> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();
    let user_agent = headers.get("user-agent").cloned();

    let _permit = match ctx.semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Request limit exceeded, returning 503");
            let response = build_error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "SlowDown",
                "Too many concurrent requests. Please retry.",
            );
            return Ok(response);
        }
    };

    // The object key is the request path without its leading slash, with
    // percent-encoding undone so keys may carry arbitrary bytes.
    let key: Vec<u8> =
        percent_encoding::percent_decode(path.trim_start_matches('/').as_bytes()).collect();

    debug!("Processing {} {} from {}", method, path, client_addr);

    let response = if key.is_empty() {
        build_error_response(
            StatusCode::BAD_REQUEST,
            "InvalidRequest",
            "Request path does not name an object.",
        )
    } else {
        match method {
            Method::GET => {
                drop(req);
                handle_get(&key, &headers, &ctx).await
            }
            Method::HEAD => handle_head(&key, &ctx).await,
            Method::PUT => handle_put(req, &key, &query, &headers, &ctx).await,
            Method::DELETE => handle_delete(&key, &ctx).await,
            _ => {
                warn!("Unsupported method: {}", method);
                build_error_response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    "MethodNotAllowed",
                    "The specified method is not allowed against this resource.",
                )
            }
        }
    };

    if let Some(access_log) = &ctx.access_log {
        let from_cache = response.headers().contains_key("x-from-cache")
            || response.headers().contains_key("age");
        let bytes_sent = response
            .headers()
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        access_log.log(AccessLogEntry {
            time: chrono::Utc::now(),
            remote_ip: client_addr.ip().to_string(),
            method: method.to_string(),
            path,
            http_status: response.status().as_u16(),
            bytes_sent,
            total_time_ms: start_time.elapsed().as_millis() as u64,
            from_cache,
            user_agent,
            request_id: Uuid::new_v4().to_string(),
        });
    }

    Ok(response)
}

/// Handle GET: edge cache, small objects, chunked streams, byte ranges
async fn handle_get(
    key: &[u8],
    headers: &HashMap<String, String>,
    ctx: &GatewayContext,
) -> Response<ResponseBody> {
    // Ranged reads bypass both cache modes and always hit the cluster.
    if let Some(range_header) = headers.get("range") {
        return handle_ranged_get(key, range_header, ctx).await;
    }

    if let Some(interceptor) = &ctx.interceptor {
        if let Some(short) = interceptor.on_request(key, headers).await {
            return intercepted_to_response(short);
        }
        return origin_get(key, headers, interceptor, ctx).await;
    }

    let edge = ctx
        .edge_cache
        .as_ref()
        .expect("internal mode wires an edge cache");

    let lookup = match edge.lookup(key, ctx.storage.as_ref()).await {
        Ok(lookup) => lookup,
        Err(e) => return error_to_response(&e, false),
    };

    match lookup {
        CachedLookup::FreshMemory(entry) => {
            let body = Bytes::from(entry.body);
            object_response(entry.etag, entry.mtime, &entry.content_type, &body)
                .header("X-From-Cache", "True/via memory")
                .body(full_body(body))
                .unwrap()
        }
        CachedLookup::FreshDisk(entry) => {
            match tokio::fs::read(&entry.file_path).await {
                Ok(contents) => {
                    let body = Bytes::from(contents);
                    object_response(entry.etag, entry.mtime, &entry.content_type, &body)
                        .header("X-From-Cache", "True/via disk")
                        .body(full_body(body))
                        .unwrap()
                }
                Err(e) => {
                    // The disk copy is gone; fall back to the cluster.
                    warn!("Cache file read failed ({}): {}", entry.file_path, e);
                    edge.invalidate(key).await;
                    plain_get(key, ctx).await
                }
            }
        }
        CachedLookup::Refreshed(meta, body) => {
            object_response(meta.checksum, meta.timestamp, OCTET_STREAM, &body)
                .body(full_body(body))
                .unwrap()
        }
        CachedLookup::Chunked(meta) => stream_full_response(key, meta, ctx),
        CachedLookup::Miss => plain_get_cacheable(key, ctx, Some(edge)).await,
    }
}

/// GET without any cache involvement; used as the disk-miss fallback.
async fn plain_get(key: &[u8], ctx: &GatewayContext) -> Response<ResponseBody> {
    plain_get_cacheable(key, ctx, None).await
}

/// GET from the cluster, optionally re-populating the internal-mode cache on
/// a small-object read.
async fn plain_get_cacheable(
    key: &[u8],
    ctx: &GatewayContext,
    edge: Option<&Arc<EdgeCache>>,
) -> Response<ResponseBody> {
    match ctx.storage.get(key).await {
        Ok((meta, body)) => {
            if meta.is_chunked() {
                stream_full_response(key, meta, ctx)
            } else {
                if let Some(edge) = edge {
                    edge.store_small(key, &body, meta.checksum, OCTET_STREAM).await;
                }
                object_response(meta.checksum, meta.timestamp, OCTET_STREAM, &body)
                    .body(full_body(body))
                    .unwrap()
            }
        }
        Err(e) => error_to_response(&e, false),
    }
}

/// Interceptor-mode origin handler: fetch from the cluster, then offer the
/// buffered response to the response hook for caching and header rewriting.
async fn origin_get(
    key: &[u8],
    request_headers: &HashMap<String, String>,
    interceptor: &Arc<CacheInterceptor>,
    ctx: &GatewayContext,
) -> Response<ResponseBody> {
    match ctx.storage.get(key).await {
        Ok((meta, body)) => {
            if meta.is_chunked() {
                // Streamed responses are never offered to the cache hook.
                return stream_full_response(key, meta, ctx);
            }

            let mut response_headers = vec![
                ("Content-Type".to_string(), OCTET_STREAM.to_string()),
                ("ETag".to_string(), format_etag(meta.checksum)),
                (
                    "Last-Modified".to_string(),
                    format_http_date(meta.timestamp),
                ),
            ];
            interceptor
                .on_response(key, 200, request_headers, &mut response_headers, &body)
                .await;

            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::SERVER, SERVER_HEADER)
                .header(hyper::header::CONTENT_LENGTH, body.len());
            for (name, value) in response_headers {
                builder = builder.header(name, value);
            }
            builder.body(full_body(body)).unwrap()
        }
        Err(e) => error_to_response(&e, false),
    }
}

/// Handle a GET with a Range header: 200 with the requested ranges emitted
/// back-to-back (server-side concatenation, no multipart/byteranges).
async fn handle_ranged_get(
    key: &[u8],
    range_header: &str,
    ctx: &GatewayContext,
) -> Response<ResponseBody> {
    let raw_ranges = match parse_range_header(range_header) {
        Some(ranges) => ranges,
        None => {
            return build_error_response(
                StatusCode::RANGE_NOT_SATISFIABLE,
                "InvalidRange",
                "The requested range cannot be parsed.",
            )
        }
    };

    let meta = match ctx.storage.head(key).await {
        Ok(meta) => meta,
        Err(e) => return error_to_response(&e, false),
    };

    let mut ranges = Vec::with_capacity(raw_ranges.len());
    for (start, end) in raw_ranges {
        match normalize_range(start, end, meta.dsize) {
            Ok(range) => ranges.push(range),
            Err(e) => return error_to_response(&e, false),
        }
    }

    if meta.is_chunked() {
        return stream_range_response(key, meta, ranges, ctx);
    }

    // Leaf object: ranged reads straight from storage, concatenated.
    let mut body = BytesMut::new();
    for (start, end) in ranges {
        match ctx.storage.get_range(key, start, end).await {
            Ok((_, part)) => body.extend_from_slice(&part),
            Err(e) => return error_to_response(&e, false),
        }
    }
    let body = body.freeze();
    object_response(meta.checksum, meta.timestamp, OCTET_STREAM, &body)
        .body(full_body(body))
        .unwrap()
}

/// Handle HEAD: metadata headers, no body
async fn handle_head(key: &[u8], ctx: &GatewayContext) -> Response<ResponseBody> {
    match ctx.storage.head(key).await {
        Ok(meta) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::SERVER, SERVER_HEADER)
            .header(hyper::header::CONTENT_TYPE, OCTET_STREAM)
            .header(hyper::header::CONTENT_LENGTH, meta.dsize)
            .header(hyper::header::ETAG, format_etag(meta.checksum))
            .header(hyper::header::LAST_MODIFIED, format_http_date(meta.timestamp))
            .body(empty_body())
            .unwrap(),
        Err(e) => error_to_response(&e, false),
    }
}

/// Handle DELETE: tombstone on the cluster, drop any cached entry
async fn handle_delete(key: &[u8], ctx: &GatewayContext) -> Response<ResponseBody> {
    if let Err(e) = ctx.cache.delete(key).await {
        warn!("Cache delete failed for {}: {}", String::from_utf8_lossy(key), e);
    }

    match ctx.storage.delete(key).await {
        Ok(()) => no_content_response(),
        Err(e) => error_to_response(&e, true),
    }
}

/// Handle PUT: reject oversized bodies, then pick the small or large path
async fn handle_put<B>(
    req: Request<B>,
    key: &[u8],
    query: &str,
    headers: &HashMap<String, String>,
    ctx: &GatewayContext,
) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::fmt::Display,
{
    let content_length: Option<u64> = headers
        .get("content-length")
        .and_then(|v| v.parse().ok());

    if let Some(length) = content_length {
        if length >= ctx.config.object.max_len_for_obj {
            return build_error_response(
                StatusCode::BAD_REQUEST,
                "EntityTooLarge",
                "Object size exceeds the configured maximum.",
            );
        }
        // Multipart upload parts carry their own part accounting and take
        // the buffered path regardless of size.
        let is_multipart_part = query.contains("uploadId=");
        if length >= ctx.config.object.threshold_obj_len && !is_multipart_part {
            return handle_large_put(req, key, length, ctx).await;
        }
    }

    handle_small_put(req, key, headers, ctx).await
}

/// Buffered small-object PUT
async fn handle_small_put<B>(
    req: Request<B>,
    key: &[u8],
    headers: &HashMap<String, String>,
    ctx: &GatewayContext,
) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::fmt::Display,
{
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Failed to read PUT body: {}", e);
            return build_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "IncompleteBody",
                "The request body could not be read.",
            );
        }
    };

    if body.len() as u64 >= ctx.config.object.max_len_for_obj {
        return build_error_response(
            StatusCode::BAD_REQUEST,
            "EntityTooLarge",
            "Object size exceeds the configured maximum.",
        );
    }

    let size = body.len() as u64;
    match ctx.storage.put(key, body.clone(), size, 0).await {
        Ok(etag) => {
            if let Some(edge) = &ctx.edge_cache {
                let content_type = headers
                    .get("content-type")
                    .map(|s| s.as_str())
                    .unwrap_or(OCTET_STREAM);
                edge.store_small(key, &body, etag, content_type).await;
            }
            put_ok_response(etag)
        }
        Err(e) => error_to_response(&e, false),
    }
}

/// Streaming large-object PUT: chunk the body, commit the manifest, roll
/// back every written chunk on any failure.
async fn handle_large_put<B>(
    req: Request<B>,
    key: &[u8],
    content_length: u64,
    ctx: &GatewayContext,
) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::fmt::Display,
{
    let chunk_size = ctx.config.object.chunked_obj_len as usize;

    let mut session = LargeUploadSession::open(
        key.to_vec(),
        Arc::clone(&ctx.storage),
        Arc::clone(&ctx.cache),
    );

    // A stale top-level entry must not outlive the object it described.
    if let Err(e) = ctx.cache.delete(key).await {
        warn!("Cache delete failed for {}: {}", String::from_utf8_lossy(key), e);
    }

    let mut body = req.into_body();
    let mut buffer = BytesMut::with_capacity(chunk_size.min(8 * 1024 * 1024));
    let mut next_index: u32 = 1;
    let mut received: u64 = 0;

    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                let data = match frame.into_data() {
                    Ok(data) => data,
                    Err(_) => continue, // trailers
                };
                received += data.len() as u64;
                buffer.extend_from_slice(&data);

                while buffer.len() >= chunk_size {
                    let chunk = buffer.split_to(chunk_size).freeze();
                    // Failures accumulate in the session; keep consuming the
                    // body so every chunk is accounted for at commit.
                    let _ = session.put_chunk(next_index, chunk).await;
                    next_index += 1;
                }
            }
            Some(Err(e)) => {
                // Client went away mid-upload: remove what was written.
                warn!(
                    "Body stream error during large PUT of {}: {}",
                    String::from_utf8_lossy(key),
                    e
                );
                session.rollback(next_index - 1).await;
                return build_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "IncompleteBody",
                    "The request body terminated before Content-Length bytes.",
                );
            }
            None => break,
        }
    }

    if !buffer.is_empty() {
        let chunk = buffer.split_to(buffer.len()).freeze();
        let _ = session.put_chunk(next_index, chunk).await;
        next_index += 1;
    }
    let total = next_index - 1;

    let digest = match session.commit() {
        Ok(digest) => digest,
        Err(errors) => {
            warn!(
                "Large PUT of {} failed on {} chunk(s), rolling back {}",
                String::from_utf8_lossy(key),
                errors.len(),
                total
            );
            session.rollback(total).await;
            let cause = &errors[0].1;
            return rolled_back_response(cause);
        }
    };

    if received != content_length {
        warn!(
            "Large PUT of {} received {} bytes, Content-Length was {}",
            String::from_utf8_lossy(key),
            received,
            content_length
        );
        session.rollback(total).await;
        return build_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "IncompleteBody",
            "The request body terminated before Content-Length bytes.",
        );
    }

    match ctx
        .storage
        .put_manifest(
            key,
            received,
            ctx.config.object.chunked_obj_len,
            total as u64,
            digest,
        )
        .await
    {
        Ok(_) => {
            info!(
                "Stored {} as {} chunks ({} bytes)",
                String::from_utf8_lossy(key),
                total,
                received
            );
            put_ok_response(digest)
        }
        Err(e) => {
            warn!(
                "Manifest put failed for {}, rolling back {} chunks: {}",
                String::from_utf8_lossy(key),
                total,
                e
            );
            session.rollback(total).await;
            rolled_back_response(&e)
        }
    }
}

// ---------------------------------------------------------------------------
// Streaming responses
// ---------------------------------------------------------------------------

/// Build a 200 streaming the whole chunked object, with Content-Length from
/// the manifest.
fn stream_full_response(
    key: &[u8],
    meta: ObjectMetadata,
    ctx: &GatewayContext,
) -> Response<ResponseBody> {
    let body = spawn_streamer(key, meta.cnumber, None, ctx);
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::SERVER, SERVER_HEADER)
        .header(hyper::header::CONTENT_TYPE, OCTET_STREAM)
        .header(hyper::header::CONTENT_LENGTH, meta.dsize)
        .header(hyper::header::ETAG, format_etag(meta.checksum))
        .header(hyper::header::LAST_MODIFIED, format_http_date(meta.timestamp))
        .body(body)
        .unwrap()
}

/// Build a 200 streaming the given normalized ranges back-to-back, using
/// chunked transfer encoding.
fn stream_range_response(
    key: &[u8],
    meta: ObjectMetadata,
    ranges: Vec<(u64, u64)>,
    ctx: &GatewayContext,
) -> Response<ResponseBody> {
    let body = spawn_streamer(key, meta.cnumber, Some(ranges), ctx);
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::SERVER, SERVER_HEADER)
        .header(hyper::header::CONTENT_TYPE, OCTET_STREAM)
        .header(hyper::header::ETAG, format_etag(meta.checksum))
        .header(hyper::header::LAST_MODIFIED, format_http_date(meta.timestamp))
        .body(body)
        .unwrap()
}

/// Spawn the read streamer and adapt its channel into a response body.
///
/// A streamer error after headers were sent closes the channel, which
/// truncates the chunked body; the client observes the broken transfer.
fn spawn_streamer(
    key: &[u8],
    total: u64,
    ranges: Option<Vec<(u64, u64)>>,
    ctx: &GatewayContext,
) -> ResponseBody {
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    let storage = Arc::clone(&ctx.storage);
    let cache = Arc::clone(&ctx.cache);
    let key = key.to_vec();

    tokio::spawn(async move {
        let streamer = LargeReadStreamer::new(storage, cache);
        let mut sink = ChannelBodySink::new(tx);
        match ranges {
            None => {
                if let Err(e) = streamer.stream_all(&key, total, &mut sink).await {
                    warn!(
                        "Streamed read of {} aborted: {}",
                        String::from_utf8_lossy(&key),
                        e
                    );
                }
            }
            Some(ranges) => {
                for (start, end) in ranges {
                    if let Err(e) = streamer
                        .stream_range(&key, total, start, end, &mut sink)
                        .await
                    {
                        warn!(
                            "Streamed range read of {} aborted: {}",
                            String::from_utf8_lossy(&key),
                            e
                        );
                        break;
                    }
                }
            }
        }
    });

    let frame_stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|bytes| (Ok::<_, hyper::Error>(Frame::data(bytes)), rx))
    });
    BoxBody::new(StreamBody::new(frame_stream))
}

// ---------------------------------------------------------------------------
// Range header parsing
// ---------------------------------------------------------------------------

/// Parse a Range header into `(start, end)` pairs in the normalizer's
/// convention: `end == 0` means "through the last byte" and a negative end
/// selects a suffix of that length.
///
/// Accepted forms per range: `a-b`, `a-`, `-n`. Returns `None` on anything
/// unparseable.
pub fn parse_range_header(header: &str) -> Option<Vec<(i64, i64)>> {
    let spec = header.trim().strip_prefix("bytes=")?;
    let mut ranges = Vec::new();

    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }

        if let Some(suffix) = part.strip_prefix('-') {
            // Suffix range: last n bytes.
            let n: i64 = suffix.parse().ok()?;
            if n <= 0 {
                return None;
            }
            ranges.push((0, -n));
            continue;
        }

        let (start_str, end_str) = part.split_once('-')?;
        let start: i64 = start_str.parse().ok()?;
        if start < 0 {
            return None;
        }
        if end_str.is_empty() {
            ranges.push((start, 0));
        } else {
            let end: i64 = end_str.parse().ok()?;
            if end < start {
                return None;
            }
            ranges.push((start, end));
        }
    }

    if ranges.is_empty() {
        None
    } else {
        Some(ranges)
    }
}

// ---------------------------------------------------------------------------
// Response builders
// ---------------------------------------------------------------------------

fn empty_body() -> ResponseBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Builder pre-loaded with the standard object response headers.
fn object_response(
    etag: u128,
    mtime: u64,
    content_type: &str,
    body: &Bytes,
) -> hyper::http::response::Builder {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::SERVER, SERVER_HEADER)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .header(hyper::header::CONTENT_LENGTH, body.len())
        .header(hyper::header::ETAG, format_etag(etag))
        .header(hyper::header::LAST_MODIFIED, format_http_date(mtime))
}

/// 200 reply for a stored object, carrying its ETag.
fn put_ok_response(etag: u128) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::SERVER, SERVER_HEADER)
        .header(hyper::header::ETAG, format_etag(etag))
        .header(hyper::header::CONTENT_LENGTH, 0)
        .body(empty_body())
        .unwrap()
}

fn no_content_response() -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(hyper::header::SERVER, SERVER_HEADER)
        .body(empty_body())
        .unwrap()
}

fn intercepted_to_response(short: InterceptedResponse) -> Response<ResponseBody> {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(short.status).unwrap_or(StatusCode::OK))
        .header(hyper::header::SERVER, SERVER_HEADER);
    for (name, value) in short.headers {
        builder = builder.header(name, value);
    }
    if short.status == 304 {
        builder.body(empty_body()).unwrap()
    } else {
        builder
            .header(hyper::header::CONTENT_LENGTH, short.body.len())
            .body(full_body(short.body))
            .unwrap()
    }
}

/// 500 reply for an upload whose chunks were rolled back, preserving the
/// original cause in the message. Timeouts keep their 504 mapping.
fn rolled_back_response(cause: &GatewayError) -> Response<ResponseBody> {
    match cause {
        GatewayError::Timeout(_) => build_error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "GatewayTimeout",
            "The storage cluster did not respond in time; the upload was rolled back.",
        ),
        _ => build_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "UploadRolledBack",
            "One or more chunks could not be stored; the upload was rolled back.",
        ),
    }
}

/// Map an error from the storage path to its HTTP rendering.
fn error_to_response(err: &GatewayError, is_delete: bool) -> Response<ResponseBody> {
    match err {
        GatewayError::NotFound(_) if is_delete => no_content_response(),
        GatewayError::NotFound(_) => build_error_response(
            StatusCode::NOT_FOUND,
            "NoSuchKey",
            "The specified key does not exist.",
        ),
        GatewayError::Timeout(_) => build_error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "GatewayTimeout",
            "The storage cluster did not respond in time.",
        ),
        GatewayError::InvalidRange(_) => build_error_response(
            StatusCode::RANGE_NOT_SATISFIABLE,
            "InvalidRange",
            "The requested range is not satisfiable.",
        ),
        GatewayError::InvalidRequest(_) => build_error_response(
            StatusCode::BAD_REQUEST,
            "InvalidRequest",
            "The request is not valid.",
        ),
        _ => build_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "InternalError",
            "An internal error occurred. Please retry.",
        ),
    }
}

/// XML error body in the shape object-store clients expect.
fn build_error_response(status: StatusCode, code: &str, message: &str) -> Response<ResponseBody> {
    let xml_body = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
    <Code>{}</Code>
    <Message>{}</Message>
    <RequestId>{}</RequestId>
</Error>"#,
        code,
        message,
        Uuid::new_v4()
    );

    Response::builder()
        .status(status)
        .header(hyper::header::SERVER, SERVER_HEADER)
        .header(hyper::header::CONTENT_TYPE, "application/xml")
        .header(hyper::header::CONTENT_LENGTH, xml_body.len())
        .body(full_body(Bytes::from(xml_body)))
        .unwrap()
}
