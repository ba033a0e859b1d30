//! The HTTPS interception server.
//!
//! Terminates TLS for the host domain, answers bundle requests of the
//! configured control from the serving root, and forwards everything else
//! to its original destination.

mod passthrough;

use crate::common::{self, SERVER};
use crate::config::rt::RtcProxy;
use crate::hmr::{self, ControlPlane};
use crate::intercept::{is_bundle, rewrite_bundle, BundleMatcher, Resolved, StaticResolver, NO_CACHE};
use crate::watch::BundleWatcher;
use anyhow::{Context, Result};
use axum::extract::{self, State};
use axum::http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum_server::Handle;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

/// A system encapsulating the interception server, the hot-reload control
/// plane and the optional bundle watcher.
pub struct ProxySystem {
    cfg: Arc<RtcProxy>,
    plane: Arc<ControlPlane>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxySystem {
    pub fn new(cfg: Arc<RtcProxy>, shutdown: broadcast::Sender<()>) -> Self {
        let plane = ControlPlane::new(cfg.control.as_str());
        Self {
            cfg,
            plane,
            shutdown_tx: shutdown,
        }
    }

    /// Run the proxy system until shutdown.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn run(self) -> Result<()> {
        let state = Arc::new(ProxyState::new(&self.cfg).await?);

        tracing::info!(
            "{SERVER}intercepting {} at https://127.0.0.1:{}",
            self.cfg.control,
            self.cfg.port
        );
        tracing::info!("    serving from {}", self.cfg.serving_root.display());
        if self.cfg.hot {
            tracing::info!("    hot reload enabled, runtime will be injected into the bundle");
        }

        let plane_handle = tokio::spawn(hmr::serve(
            self.plane.clone(),
            self.cfg.ws_port,
            self.shutdown_tx.subscribe(),
        ));

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.cfg.port));
        let server_handle = tokio::spawn(run_server(
            addr,
            self.cfg.tls.clone(),
            router(state),
            self.shutdown_tx.subscribe(),
        ));

        let _watcher = if self.cfg.watch_bundle {
            Some(BundleWatcher::new(
                &self.cfg.serving_root,
                self.plane.clone(),
                self.cfg.control.clone(),
                self.shutdown_tx.clone(),
            )?)
        } else {
            None
        };

        if let Some(browser) = self.cfg.browser {
            let url = format!("https://127.0.0.1:{}", self.cfg.port);
            if let Err(err) = open::with_detached(&url, browser.app_name()) {
                tracing::error!(error = ?err, "error opening browser");
            }
        }

        drop(self.shutdown_tx); // Drop the broadcast channel to ensure it does not keep the system alive.

        let result = select! {
            r = plane_handle => r.context("error joining control-plane handle")?,
            r = server_handle => r.context("error joining proxy server handle")?,
        };
        self.plane.close();
        result
    }
}

async fn run_server(
    addr: SocketAddr,
    tls: axum_server::tls_rustls::RustlsConfig,
    router: Router,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    // Build a shutdown signal for the axum server.
    let shutdown_handle = Handle::new();

    let shutdown = |handle: Handle| async move {
        // Any event on this channel, even a drop, should trigger shutdown.
        let _res = shutdown_rx.recv().await;
        tracing::debug!("proxy server is shutting down");
        handle.graceful_shutdown(Some(Duration::from_secs(0)));
    };
    tokio::spawn(shutdown(shutdown_handle.clone()));

    let listener = std::net::TcpListener::bind(addr)
        .map_err(|err| common::bind_error(err, "HTTPS proxy", addr.port()))?;
    listener
        .set_nonblocking(true)
        .context("error preparing proxy listener")?;

    axum_server::from_tcp_rustls(listener, tls)
        .handle(shutdown_handle)
        .serve(router.into_make_service())
        .await
        .context("error running HTTPS proxy server")?;
    Ok(())
}

/// Server state.
pub(crate) struct ProxyState {
    matcher: BundleMatcher,
    resolver: StaticResolver,
    client: reqwest::Client,
    hot: bool,
    ws_port: u16,
    /// Set after the first passthrough failure was reported.
    passthrough_error_logged: AtomicBool,
}

impl ProxyState {
    pub(crate) async fn new(cfg: &RtcProxy) -> Result<Self> {
        Ok(Self {
            matcher: BundleMatcher::new(&cfg.control)?,
            resolver: StaticResolver::new(&cfg.serving_root).await?,
            client: passthrough::client()?,
            hot: cfg.hot,
            ws_port: cfg.ws_port,
            passthrough_error_logged: AtomicBool::new(false),
        })
    }
}

fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .fallback(handle)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle(State(state): State<Arc<ProxyState>>, request: extract::Request) -> Response {
    let url = request.uri().to_string();
    match state.matcher.relative_path(&url) {
        Some(relative) => {
            let relative = relative.to_owned();
            serve_asset(&state, &relative).await
        }
        None => passthrough::forward(&state, request).await,
    }
}

async fn serve_asset(state: &ProxyState, relative: &str) -> Response {
    match state.resolver.resolve(relative).await {
        Resolved::Ok {
            bytes,
            content_type,
        } => {
            let (bytes, rewritten) = if state.hot && is_bundle(relative) {
                (rewrite_bundle(&bytes, state.ws_port), true)
            } else {
                (bytes, false)
            };
            tracing::info!(
                "200  {relative} ({} KB){}",
                (bytes.len() as f64 / 1024.0).round() as u64,
                if rewritten { " [+HMR]" } else { "" }
            );
            (
                [
                    (CONTENT_TYPE, HeaderValue::from_static(content_type)),
                    (CACHE_CONTROL, HeaderValue::from_static(NO_CACHE)),
                    (ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
                ],
                bytes,
            )
                .into_response()
        }
        Resolved::Forbidden => {
            tracing::warn!("403  {relative} (path traversal blocked)");
            (StatusCode::FORBIDDEN, "Forbidden").into_response()
        }
        Resolved::NotFound => {
            tracing::warn!("404  {relative} (not found)");
            (StatusCode::NOT_FOUND, "Not Found").into_response()
        }
    }
}
