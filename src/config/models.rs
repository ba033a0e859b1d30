//! Config options for the proxy as accepted on the command line.

use clap::{Args, ValueEnum};
use std::path::PathBuf;

/// Config options for the proxy system.
#[derive(Clone, Debug, Default, Args)]
#[command(next_help_heading = "Proxy")]
pub struct ProxyOpts {
    /// The port the HTTPS proxy listens on [default: 8642]
    #[arg(long, env = "PCF_DEV_PROXY_PORT")]
    pub port: Option<u16>,
    /// The port of the hot-reload control plane [default: 8643]
    #[arg(long, env = "PCF_DEV_PROXY_WS_PORT")]
    pub ws_port: Option<u16>,
    /// The directory containing the built control assets [default: .]
    #[arg(long, env = "PCF_DEV_PROXY_DIR")]
    pub dir: Option<PathBuf>,
    /// The fully qualified control name, e.g. cc_Contoso.MyControl
    #[arg(long, env = "PCF_DEV_PROXY_CONTROL")]
    pub control: Option<String>,
    /// Open this browser once the proxy is up
    #[arg(long, value_enum)]
    pub browser: Option<Browser>,
    /// Inject the in-page hot-reload runtime into the intercepted bundle
    #[arg(long)]
    pub hot: bool,
    /// Enqueue a reload whenever bundle.js changes; requires --hot
    #[arg(long)]
    pub watch_bundle: bool,
    /// Answer yes to all prompts
    #[arg(short, long)]
    pub yes: bool,
    /// The TLS certificate the proxy presents, produced by the CA setup
    #[arg(long, env = "PCF_DEV_PROXY_TLS_CERT_PATH", default_value = ".pcf-dev-proxy/cert.pem")]
    pub tls_cert_path: PathBuf,
    /// The TLS private key belonging to the certificate
    #[arg(long, env = "PCF_DEV_PROXY_TLS_KEY_PATH", default_value = ".pcf-dev-proxy/key.pem")]
    pub tls_key_path: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum Browser {
    Chrome,
    Edge,
}

impl Browser {
    /// The application name `open` launches on the current platform.
    pub fn app_name(&self) -> &'static str {
        match self {
            Self::Chrome => {
                if cfg!(target_os = "macos") {
                    "Google Chrome"
                } else if cfg!(windows) {
                    "chrome"
                } else {
                    "google-chrome"
                }
            }
            Self::Edge => {
                if cfg!(target_os = "macos") {
                    "Microsoft Edge"
                } else if cfg!(windows) {
                    "msedge"
                } else {
                    "microsoft-edge"
                }
            }
        }
    }
}
