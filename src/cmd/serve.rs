//! Run the interception proxy and the hot-reload control plane.

use crate::config::{ProxyOpts, RtcProxy};
use crate::serve::ProxySystem;
use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use tokio::{select, sync::broadcast};

/// Serve locally built control assets into the remote host page.
#[derive(Clone, Args)]
#[command(name = "serve")]
pub struct Serve {
    #[command(flatten)]
    pub proxy: ProxyOpts,
}

impl Serve {
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn run(self) -> Result<()> {
        let cfg = RtcProxy::new(self.proxy).await?;

        if !cfg.yes && !confirm_start(&cfg)? {
            tracing::info!("aborted");
            return Ok(());
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        let system = ProxySystem::new(Arc::new(cfg), shutdown_tx.clone());
        let mut system_handle = tokio::spawn(system.run());

        select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::debug!("received shutdown signal");
                shutdown_tx.send(()).ok();
                drop(shutdown_tx);
                system_handle
                    .await
                    .context("error awaiting system shutdown")??;
            }
            r = &mut system_handle => {
                r.context("error awaiting system shutdown")??;
            }
        }

        tracing::debug!("Exiting serve main");

        Ok(())
    }
}

/// Ask before taking over the port; suppressed by `--yes` and on
/// non-interactive terminals.
fn confirm_start(cfg: &RtcProxy) -> Result<bool> {
    let term = console::Term::stdout();
    if !term.is_term() {
        return Ok(true);
    }
    term.write_line(&format!(
        "About to intercept https traffic for {} on 127.0.0.1:{}. Continue? [Y/n]",
        cfg.control, cfg.port
    ))
    .context("error writing confirmation prompt")?;
    let answer = term.read_line().context("error reading confirmation")?;
    Ok(!answer.trim().eq_ignore_ascii_case("n"))
}
