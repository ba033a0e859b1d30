//! On-the-fly injection of the in-page runtime into intercepted bundles.

use crate::runtime;

/// The primary asset of a serving root.
pub const BUNDLE_FILE: &str = "bundle.js";

/// Whether a resolved relative path is the control's bundle.
pub fn is_bundle(relative: &str) -> bool {
    relative == BUNDLE_FILE
}

/// Prepend the hot-reload prelude to the original bundle bytes.
///
/// The prelude is the runtime-configuration line exposing the control-plane
/// port, followed by the full in-page runtime. The original bundle follows
/// unmodified, so its own source map offsets shift by the prelude only.
pub fn rewrite_bundle(bundle: &[u8], ws_port: u16) -> Vec<u8> {
    let prelude = runtime::hot_prelude(ws_port);
    let mut out = Vec::with_capacity(prelude.len() + bundle.len());
    out.extend_from_slice(prelude.as_bytes());
    out.extend_from_slice(bundle);
    out
}
