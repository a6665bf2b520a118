//! Gateway wiring and run loop.
//!
//! Owns the shared state (registry, router, correlator, admission
//! machinery), binds the HTTP ingress and the WSS tunnel endpoint, and
//! runs the periodic sweeper. Shutdown drains tunnels before closing.

use crate::auth::{DidWbaVerifier, JwtIssuer, NonceCache, StaticResolver};
use crate::config::{GatewayConfig, TlsSection, VerifyMode};
use crate::correlator::Correlator;
use crate::directory::{ServiceDirectory, StaticDirectory};
use crate::error::{GatewayError, GatewayResult, CLOSE_KEEPALIVE_TIMEOUT};
use crate::registry::{Outbound, TunnelRegistry};
use crate::router::ServiceRouter;
use crate::{ingress, tunnel};
use anpx_core::Encoder;
use axum::Router;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Upper bound on remembered nonces.
const NONCE_CACHE_CAP: usize = 100_000;

/// Sweeper period.
const SWEEP_PERIOD: std::time::Duration = std::time::Duration::from_secs(60);

/// Shared state threaded through the ingress handlers and tunnel tasks.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub registry: Arc<TunnelRegistry>,
    pub router: ServiceRouter,
    pub correlator: Correlator,
    pub directory: Arc<dyn ServiceDirectory>,
    pub verifier: DidWbaVerifier,
    pub nonces: Arc<NonceCache>,
    pub encoder: Encoder,
    pub jwt: Option<JwtIssuer>,
    pub shutdown: broadcast::Sender<()>,
}

/// The gateway instance.
pub struct Gateway {
    state: Arc<GatewayState>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let registry = Arc::new(TunnelRegistry::new(config.max_connections));
        let router = ServiceRouter::new(registry.clone());
        let nonces = Arc::new(NonceCache::new(config.nonce_window, NONCE_CACHE_CAP));
        let resolver = Arc::new(StaticResolver::from_entries(&config.receivers)?);
        let verifier = DidWbaVerifier::new(resolver, nonces.clone(), config.timestamp_window);
        let directory = Arc::new(StaticDirectory::from_entries(&config.receivers));
        let jwt = config.jwt.as_ref().map(JwtIssuer::from_config).transpose()?;
        let encoder = Encoder::new(config.chunk_size);
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            state: Arc::new(GatewayState {
                config,
                registry,
                router,
                correlator: Correlator::new(),
                directory,
                verifier,
                nonces,
                encoder,
                jwt,
                shutdown,
            }),
        })
    }

    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    /// Bind both endpoints and serve until a shutdown signal, then drain.
    pub async fn run(self) -> GatewayResult<()> {
        let state = self.state;

        let http_addr = format!("{}:{}", state.config.http_bind.0, state.config.http_bind.1);
        let http_listener = TcpListener::bind(&http_addr)
            .await
            .map_err(|e| GatewayError::Bind(format!("{http_addr}: {e}")))?;
        info!(addr = %http_addr, "HTTP ingress listening");

        let ws_addr = format!("{}:{}", state.config.ws_bind.0, state.config.ws_bind.1);
        let ws_listener = TcpListener::bind(&ws_addr)
            .await
            .map_err(|e| GatewayError::Bind(format!("{ws_addr}: {e}")))?;
        info!(addr = %ws_addr, tls = state.config.tls.is_some(), "tunnel endpoint listening");

        let tls_acceptor = match &state.config.tls {
            Some(section) => Some(load_tls_acceptor(section)?),
            None => {
                warn!("no [tls] section: tunnel endpoint running without TLS");
                None
            }
        };

        // HTTP ingress.
        let app = Router::new()
            .fallback(ingress::handle)
            .with_state(state.clone());
        let mut http_shutdown = state.shutdown.subscribe();
        let http_task = tokio::spawn(
            axum::serve(http_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown.recv().await;
                })
                .into_future(),
        );

        // Tunnel accept loop.
        let accept_state = state.clone();
        let mut accept_shutdown = state.shutdown.subscribe();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = ws_listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let state = accept_state.clone();
                            let acceptor = tls_acceptor.clone();
                            tokio::spawn(async move {
                                match acceptor {
                                    Some(acceptor) => match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            tunnel::serve_connection(tls_stream, peer, state).await
                                        }
                                        Err(e) => {
                                            warn!(remote = %peer, error = %e, "TLS accept failed")
                                        }
                                    },
                                    None => tunnel::serve_connection(stream, peer, state).await,
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "tunnel accept failed"),
                    },
                    _ = accept_shutdown.recv() => break,
                }
            }
        });

        // Periodic sweeper: dead tunnels, stale chunk buffers (per-tunnel,
        // in their reader loops), nonces, orphaned correlator slots.
        let sweep_state = state.clone();
        let mut sweep_shutdown = state.shutdown.subscribe();
        let sweep_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_PERIOD);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => run_sweep(&sweep_state).await,
                    _ = sweep_shutdown.recv() => break,
                }
            }
        });

        // Run until a shutdown signal, then drain.
        shutdown_signal().await;
        info!("shutdown signal received, draining tunnels");
        let _ = state.shutdown.send(());
        state.registry.drain_all().await;

        let deadline = tokio::time::Instant::now() + state.config.request_timeout;
        while state.correlator.len() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }

        let _ = tokio::join!(http_task, accept_task, sweep_task);
        info!("gateway stopped");
        Ok(())
    }
}

/// One sweeper pass.
async fn run_sweep(state: &Arc<GatewayState>) {
    let evicted = state
        .registry
        .sweep_dead(state.config.keepalive_timeout)
        .await;
    for handle in evicted {
        let _ = handle.enqueue(Outbound::Close(
            CLOSE_KEEPALIVE_TIMEOUT,
            "keep-alive timeout".into(),
        ));
        state.router.withdraw(handle.id).await;
        state
            .correlator
            .fail_all_for(handle.id, &GatewayError::TunnelLost);
        handle.take_pending();
    }

    state.nonces.sweep();

    // Orphaned slots: waiters cancelled before their deadline fired.
    let stale_grace = state.config.request_timeout + std::time::Duration::from_secs(5);
    for (request_id, conn_id) in state.correlator.sweep_stale(stale_grace) {
        debug!(%request_id, conn_id, "reclaimed orphaned pending slot");
        if let Some(handle) = state.registry.get(conn_id).await {
            handle.release_slot(&request_id);
        }
    }
}

/// Load the TLS acceptor for the tunnel endpoint.
fn load_tls_acceptor(section: &TlsSection) -> GatewayResult<TlsAcceptor> {
    let cert_pem = std::fs::read(&section.cert_file)
        .map_err(|e| GatewayError::Config(format!("cannot read {}: {e}", section.cert_file.display())))?;
    let key_pem = std::fs::read(&section.key_file)
        .map_err(|e| GatewayError::Config(format!("cannot read {}: {e}", section.key_file.display())))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| GatewayError::Config(format!("bad certificate: {e}")))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| GatewayError::Config(format!("bad private key: {e}")))?
        .ok_or_else(|| GatewayError::Config("no private key in PEM".into()))?;

    let builder = rustls::ServerConfig::builder();
    let config = match section.verify_mode {
        VerifyMode::None => builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| GatewayError::Config(format!("TLS config: {e}")))?,
        mode => {
            let ca_file = section.ca_file.as_ref().ok_or_else(|| {
                GatewayError::Config("verify_mode requires ca_file".into())
            })?;
            let ca_pem = std::fs::read(ca_file)
                .map_err(|e| GatewayError::Config(format!("cannot read {}: {e}", ca_file.display())))?;
            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
                let cert = cert.map_err(|e| GatewayError::Config(format!("bad CA cert: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| GatewayError::Config(format!("bad CA cert: {e}")))?;
            }
            let verifier_builder =
                rustls::server::WebPkiClientVerifier::builder(Arc::new(roots));
            let verifier = match mode {
                VerifyMode::Optional => verifier_builder.allow_unauthenticated().build(),
                _ => verifier_builder.build(),
            }
            .map_err(|e| GatewayError::Config(format!("client verifier: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
                .map_err(|e| GatewayError::Config(format!("TLS config: {e}")))?
        }
    };

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
