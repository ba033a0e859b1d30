//! Enqueue a reload on a running control plane.

use crate::runtime::DEFAULT_WS_PORT;
use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::{json, Value};

/// Ask a running proxy to hot-reload a control.
#[derive(Clone, Args)]
#[command(name = "reload")]
pub struct Reload {
    /// The fully qualified control name to reload
    #[arg(long)]
    pub control: String,
    /// The port of the hot-reload control plane [default: 8643]
    #[arg(long)]
    pub ws_port: Option<u16>,
    /// Build identifier attached to the reload [default: current timestamp]
    #[arg(long)]
    pub build_id: Option<String>,
    /// Free-form label describing what triggered the reload
    #[arg(long)]
    pub trigger: Option<String>,
    /// Comma-separated list of changed files, attached as metadata
    #[arg(long)]
    pub changed_files: Option<String>,
}

impl Reload {
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn run(self) -> Result<()> {
        let port = self.ws_port.unwrap_or(DEFAULT_WS_PORT);
        let url = format!("http://127.0.0.1:{port}/reload");

        let mut body = serde_json::Map::new();
        body.insert("controlName".into(), json!(self.control));
        if let Some(build_id) = self.build_id {
            body.insert("buildId".into(), json!(build_id));
        }
        if let Some(trigger) = self.trigger {
            body.insert("trigger".into(), json!(trigger));
        }
        if let Some(changed_files) = self.changed_files {
            let files: Vec<&str> = changed_files
                .split(',')
                .map(str::trim)
                .filter(|file| !file.is_empty())
                .collect();
            body.insert("changedFiles".into(), json!(files));
        }

        let client = reqwest::Client::builder()
            .build()
            .context("error building http client")?;
        let response = client
            .post(&url)
            .json(&Value::Object(body))
            .send()
            .await
            .with_context(|| format!("error connecting to the control plane at {url}"))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("error reading control-plane response")?;
        if !status.is_success() {
            bail!("reload request rejected ({status}): {text}");
        }

        let value: Value =
            serde_json::from_str(&text).context("error parsing control-plane response")?;
        match value.get("id").and_then(Value::as_str) {
            Some(id) => println!("{id}"),
            None => bail!("malformed control-plane response: {text}"),
        }
        Ok(())
    }
}
