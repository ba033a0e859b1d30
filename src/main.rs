#![deny(clippy::expect_used)]
#![deny(clippy::unwrap_used)]

mod cmd;
mod common;
mod config;
mod control;
mod hmr;
mod intercept;
mod runtime;
mod serve;
mod tls;
mod watch;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use common::STARTING;
use std::io::IsTerminal;
use std::process::ExitCode;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // clap exits with code 2 on its own; argument errors are expected to
    // terminate with 1, while help/version output is a normal exit.
    let cli = match PcfDevProxy::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
            err.print().context("error printing argument error")?;
            return Ok(code);
        }
    };

    let colored = init_color(&cli);

    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(eval_logging(&cli))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(colored)
                .with_target(false)
                .with_level(true)
                .compact(),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging")?;

    tracing::info!(
        "{}Starting {} {}",
        STARTING,
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    Ok(match cli.run().await {
        Err(err) => {
            tracing::error!("{err}");
            for (n, cause) in err.chain().enumerate().skip(1) {
                tracing::info!("  {n}: {cause}");
            }
            ExitCode::FAILURE
        }
        Ok(()) => ExitCode::SUCCESS,
    })
}

fn init_color(cli: &PcfDevProxy) -> bool {
    if cli.no_color {
        return false;
    }

    let colored = match cli.color {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => std::io::stdout().is_terminal(),
    };

    #[cfg(windows)]
    if colored {
        if let Err(err) = nu_ansi_term::enable_ansi_support() {
            eprintln!("error enabling ANSI support: {:?}", err);
        }
    }

    #[allow(clippy::let_and_return)]
    colored
}

fn eval_logging(cli: &PcfDevProxy) -> tracing_subscriber::EnvFilter {
    // allow overriding everything with RUST_LOG or --log
    if let Some(directives) = &cli.log {
        return tracing_subscriber::EnvFilter::new(directives);
    }

    // the reload subcommand prints the accepted id to stdout, keep it quiet
    let prefer_silence = cli.prefer_silence();

    let silent = cli.quiet || prefer_silence;

    let directives = match (cli.verbose, silent) {
        // quiet overrides verbose
        (_, true) => "error,pcf_dev_proxy=warn",
        // increase verbosity
        (0, false) => "error,pcf_dev_proxy=info",
        (1, false) => "error,pcf_dev_proxy=debug",
        (_, false) => "error,pcf_dev_proxy=trace",
    };

    tracing_subscriber::EnvFilter::new(directives)
}

/// Serve locally built PCF control assets into a remote host page, with
/// optional hot reload of running component instances.
#[derive(Parser)]
#[command(about, author, version)]
struct PcfDevProxy {
    #[command(subcommand)]
    action: Option<PcfDevProxySubcommands>,

    #[command(flatten)]
    serve: cmd::serve::Serve,

    /// Enable verbose logging.
    #[arg(short, long, global(true), action=ArgAction::Count)]
    pub verbose: u8,
    /// Be more quiet, conflicts with --verbose
    #[arg(short, long, global(true), conflicts_with("verbose"))]
    pub quiet: bool,
    /// Provide a RUST_LOG filter, conflicts with --verbose and --quiet
    #[arg(long, global(true), conflicts_with_all(["verbose", "quiet"]), env("RUST_LOG"))]
    pub log: Option<String>,

    /// Color mode
    #[arg(long, env = "PCF_DEV_PROXY_COLOR", global(true), value_enum, conflicts_with = "no_color", default_value_t = ColorMode::Auto)]
    pub color: ColorMode,

    /// Support for `NO_COLOR` environment variable
    #[arg(long, env = "NO_COLOR", global(true))]
    pub no_color: bool,
}

impl PcfDevProxy {
    pub fn prefer_silence(&self) -> bool {
        #[allow(clippy::match_like_matches_macro)]
        match self.action {
            Some(PcfDevProxySubcommands::Reload(_)) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Default, ValueEnum)]
#[value(rename_all = "lower")]
enum ColorMode {
    /// Enable color when running on a TTY
    #[default]
    Auto,
    /// Always enable color
    Always,
    /// Never enable color
    Never,
}

impl PcfDevProxy {
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn run(self) -> Result<()> {
        match self.action {
            Some(PcfDevProxySubcommands::Reload(inner)) => inner.run().await,
            None => self.serve.run().await,
        }
    }
}

#[derive(Subcommand)]
enum PcfDevProxySubcommands {
    /// Ask a running proxy to hot-reload a control.
    Reload(cmd::reload::Reload),
}
