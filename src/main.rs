use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use storage_gateway::{
    cache_store::{CacheStore, MemoryCacheStore},
    config::Config,
    gateway::{handle_request, Gateway},
    logging::{self, AccessLogBuffer},
    shutdown::{ShutdownCoordinator, ShutdownSignal},
    storage_rpc::{MemoryStorageRpc, StorageRpc},
    tls, Result,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Serve the TLS listener with the same request handling as the plain one.
async fn start_tls_listener(
    addr: SocketAddr,
    acceptor: tokio_rustls::TlsAcceptor,
    gateway: Arc<Gateway>,
    mut shutdown_signal: ShutdownSignal,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        storage_gateway::GatewayError::IoError(format!("Failed to bind TLS listener: {}", e))
    })?;

    info!("Gateway TLS listener on {}", addr);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, peer_addr) = match accept_result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept TLS connection: {}", e);
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let ctx = gateway.context();

                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(e) => {
                            debug!("TLS handshake failed for {}: {}", peer_addr, e);
                            return;
                        }
                    };

                    let io = TokioIo::new(tls_stream);
                    let service = service_fn(move |req| {
                        let ctx = ctx.clone();
                        async move { handle_request(req, peer_addr, ctx).await }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Error serving TLS connection from {}: {}", peer_addr, e);
                    }
                });
            }
            _ = shutdown_signal.wait_for_shutdown() => {
                info!("TLS listener received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; the guard keeps the file writer alive
    let _log_guard = logging::init(&config.logging.log_level, &config.logging.app_log_dir)?;

    let build_time = env!("BUILD_EPOCH")
        .parse::<i64>()
        .ok()
        .and_then(|secs| chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    info!(
        "Starting storage gateway v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        build_time
    );

    let config = Arc::new(config);

    // The cluster client binds at this seam; the standalone build runs
    // against the in-process store.
    let storage: Arc<dyn StorageRpc> = Arc::new(MemoryStorageRpc::new());
    let cache: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let mut gateway = Gateway::new(
        listen_addr,
        Arc::clone(&config),
        Arc::clone(&storage),
        cache,
    )?;

    // Initialize shutdown coordinator
    let mut shutdown_coordinator = ShutdownCoordinator::new(Duration::from_secs(30));

    // Wire up buffered access logging
    if config.logging.access_log_enabled {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let access_log = Arc::new(AccessLogBuffer::new(
            config.logging.access_log_dir.clone(),
            hostname,
            config.logging.access_log_buffer_size,
        ));
        gateway.set_access_log(Arc::clone(&access_log));
        shutdown_coordinator.set_access_log(Arc::clone(&access_log));

        // Periodic flush task
        let flush_interval = config.logging.access_log_flush_interval;
        let flush_log = Arc::clone(&access_log);
        let mut flush_shutdown = ShutdownSignal::new(shutdown_coordinator.subscribe());
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match flush_log.flush() {
                            Ok(count) if count > 0 => {
                                debug!("Access log flushed: {} entries", count);
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!("Access log flush failed: {}", e);
                            }
                        }
                    }
                    _ = flush_shutdown.wait_for_shutdown() => {
                        break;
                    }
                }
            }
        });
    } else {
        info!("Access logging disabled");
    }

    let gateway = Arc::new(gateway);

    // Subscribe shutdown signals before the coordinator is moved
    let gateway_shutdown_rx = shutdown_coordinator.subscribe();
    let tls_shutdown_rx = shutdown_coordinator.subscribe();

    // Start the TLS listener if certificates are configured
    let _tls_task = if config.server.tls_enabled() {
        let acceptor = tls::build_acceptor(&config.server)?;
        let tls_addr = SocketAddr::from(([0, 0, 0, 0], config.server.ssl_port));
        let tls_gateway = Arc::clone(&gateway);
        let tls_shutdown = ShutdownSignal::new(tls_shutdown_rx);

        Some(tokio::spawn(async move {
            if let Err(e) = start_tls_listener(tls_addr, acceptor, tls_gateway, tls_shutdown).await
            {
                error!("TLS listener failed: {}", e);
            }
        }))
    } else {
        None
    };

    // Start shutdown listener
    let shutdown_task = tokio::spawn(async move {
        if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
            error!("Shutdown coordinator failed: {}", e);
        }
    });

    // Start the plain listener
    let gateway_shutdown = ShutdownSignal::new(gateway_shutdown_rx);
    let _gateway_task = tokio::spawn(async move {
        if let Err(e) = gateway.start(gateway_shutdown).await {
            error!("Gateway failed: {}", e);
        }
    });

    // Wait for shutdown to complete; listeners observe the broadcast signal
    // and stop their accept loops before the coordinator finishes teardown.
    shutdown_task.await.ok();
    info!("Shutdown coordinator completed, waiting for server tasks");

    tokio::time::sleep(Duration::from_millis(500)).await;

    info!("Storage gateway shutdown complete");
    Ok(())
}
