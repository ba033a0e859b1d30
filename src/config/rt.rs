//! Runtime config for the proxy system.

use crate::common::path_exists;
use crate::config::models::{Browser, ProxyOpts};
use crate::control::ControlName;
use crate::intercept::BUNDLE_FILE;
use crate::runtime::DEFAULT_WS_PORT;
use crate::tls;
use anyhow::{bail, Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use std::path::PathBuf;

/// Default port of the HTTPS proxy listener.
pub const DEFAULT_PORT: u16 = 8642;

/// Validated, immutable configuration of a proxy run.
#[derive(Clone)]
pub struct RtcProxy {
    /// The control whose bundle requests are intercepted.
    pub control: ControlName,
    /// Canonical directory the built assets are served from.
    pub serving_root: PathBuf,
    /// The port of the HTTPS proxy listener.
    pub port: u16,
    /// The port of the hot-reload control plane.
    pub ws_port: u16,
    /// Whether the in-page runtime is injected into the bundle.
    pub hot: bool,
    /// Whether bundle changes enqueue reloads automatically.
    pub watch_bundle: bool,
    /// Browser to open once the listeners are up.
    pub browser: Option<Browser>,
    /// Skip interactive prompts.
    pub yes: bool,
    /// The TLS identity presented by the proxy listener.
    pub tls: RustlsConfig,
}

impl RtcProxy {
    pub async fn new(opts: ProxyOpts) -> Result<Self> {
        let control = match opts.control {
            Some(name) => ControlName::new(name)?,
            None => bail!(
                "no component manifest was found in the working directory; \
                 pass --control <prefix>_<Namespace>.<Constructor> to pick the control"
            ),
        };

        if opts.watch_bundle && !opts.hot {
            bail!("--watch-bundle requires --hot");
        }

        let dir = opts.dir.unwrap_or_else(|| PathBuf::from("."));
        let serving_root = tokio::fs::canonicalize(&dir)
            .await
            .with_context(|| format!("serving directory {dir:?} does not exist"))?;
        let meta = tokio::fs::metadata(&serving_root)
            .await
            .with_context(|| format!("error reading metadata of {serving_root:?}"))?;
        if !meta.is_dir() {
            bail!("serving path {serving_root:?} is not a directory");
        }
        if !path_exists(serving_root.join(BUNDLE_FILE)).await? {
            tracing::warn!(
                "{serving_root:?} has no {BUNDLE_FILE} yet; requests will 404 until a build lands"
            );
        }

        let tls = tls::load(&opts.tls_cert_path, &opts.tls_key_path).await?;

        Ok(Self {
            control,
            serving_root,
            port: opts.port.unwrap_or(DEFAULT_PORT),
            ws_port: opts.ws_port.unwrap_or(DEFAULT_WS_PORT),
            hot: opts.hot,
            watch_bundle: opts.watch_bundle,
            browser: opts.browser,
            yes: opts.yes,
            tls,
        })
    }
}
