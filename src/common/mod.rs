//! Common functionality and types.

use anyhow::{Context, Result};
use console::Emoji;
use std::io::ErrorKind;
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub static STARTING: Emoji = Emoji("🚀 ", "");
pub static SERVER: Emoji = Emoji("📡 ", "");
pub static SUCCESS: Emoji = Emoji("✅ ", "");
pub static ERROR: Emoji = Emoji("❌ ", "");
pub static RELOAD: Emoji = Emoji("🔄 ", "");
pub static WATCHING: Emoji = Emoji("👀 ", "");

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Current wall-clock time as an RFC3339 timestamp.
///
/// Falls back to the epoch-ms representation if formatting fails.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| now_epoch_ms().to_string())
}

/// Wrap a listener bind failure, giving address-in-use a targeted hint.
pub fn bind_error(err: std::io::Error, what: &str, port: u16) -> anyhow::Error {
    if err.kind() == ErrorKind::AddrInUse {
        anyhow::anyhow!(
            "port {port} is already in use; stop the process holding it or pick another port for the {what}"
        )
    } else {
        anyhow::Error::new(err).context(format!("error binding {what} listener on port {port}"))
    }
}

/// Checks if path exists.
pub async fn path_exists(path: impl AsRef<Path>) -> Result<bool> {
    tokio::fs::metadata(path.as_ref())
        .await
        .map(|_| true)
        .or_else(|error| {
            if error.kind() == ErrorKind::NotFound {
                Ok(false)
            } else {
                Err(error)
            }
        })
        .with_context(|| {
            format!(
                "error checking for existence of path at {:?}",
                path.as_ref()
            )
        })
}
