//! Debounced detection of bundle rebuilds.

use crate::common::{self, WATCHING};
use crate::control::ControlName;
use crate::hmr::messages::ReloadRequest;
use crate::hmr::ControlPlane;
use crate::intercept::BUNDLE_FILE;
use anyhow::{Context, Result};
use futures_util::stream::StreamExt;
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{
    new_debouncer_opt, DebounceEventResult, DebouncedEvent, Debouncer, FileIdMap,
};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

/// The duration of time to debounce FS events.
const DEBOUNCE_DURATION: Duration = Duration::from_millis(500);

/// Watches the serving root for rebuilt bundles and enqueues a reload for
/// each settled burst of changes.
///
/// The watch is non-recursive: only the top-level `bundle.js` is of
/// interest. Dropping the watcher releases the directory watch and cancels
/// any pending debounce.
pub struct BundleWatcher {
    _debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
    task: JoinHandle<()>,
}

impl BundleWatcher {
    pub fn new(
        dir: &Path,
        plane: Arc<ControlPlane>,
        control: ControlName,
        shutdown: broadcast::Sender<()>,
    ) -> Result<Self> {
        let (watch_tx, mut watch_rx) = mpsc::channel::<DebouncedEvent>(1);

        let mut debouncer = new_debouncer_opt::<_, RecommendedWatcher, FileIdMap>(
            DEBOUNCE_DURATION,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => events.into_iter().for_each(|event| {
                    let _ = watch_tx.blocking_send(event);
                }),
                Err(errors) => errors
                    .into_iter()
                    .for_each(|err| tracing::warn!(error=?err, "error from filesystem watcher")),
            },
            FileIdMap::new(),
            notify::Config::default(),
        )
        .context("failed to build file system watcher")?;

        debouncer
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {dir:?} for file system changes"))?;
        tracing::info!("{WATCHING}watching {} for bundle changes", dir.display());

        let mut shutdown = BroadcastStream::new(shutdown.subscribe());
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = watch_rx.recv() => {
                        if !is_bundle_event(&event.paths) {
                            continue;
                        }
                        tracing::debug!("bundle change detected in {:?}", event.paths);
                        plane.enqueue_reload(ReloadRequest {
                            control_name: control.as_str().to_owned(),
                            build_id: common::now_rfc3339(),
                            trigger: "watch-bundle".to_owned(),
                            changed_files: None,
                        });
                    }
                    _ = shutdown.next() => break, // Any event, even a drop, will trigger shutdown.
                    else => break,
                }
            }
            tracing::debug!("bundle watcher has shut down");
        });

        Ok(Self {
            _debouncer: debouncer,
            task,
        })
    }
}

impl Drop for BundleWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn is_bundle_event(paths: &[PathBuf]) -> bool {
    paths
        .iter()
        .any(|path| path.file_name() == Some(OsStr::new(BUNDLE_FILE)))
}
