//! Recognizing bundle requests for the configured control.

mod resolver;
mod rewriter;

pub use resolver::{Resolved, StaticResolver, NO_CACHE};
pub use rewriter::{is_bundle, rewrite_bundle, BUNDLE_FILE};

use crate::control::ControlName;
use anyhow::{Context, Result};
use regex::Regex;

/// Matches request URLs that address assets of a single control.
///
/// A URL matches when it contains `<control-identifier>/<relative-path>`,
/// with the dots of the identifier taken literally and the relative path
/// running up to (but not including) any query string.
pub struct BundleMatcher {
    pattern: Regex,
}

impl BundleMatcher {
    pub fn new(control: &ControlName) -> Result<Self> {
        let pattern = Regex::new(&format!("{}/([^?]+)", regex::escape(control.as_str())))
            .with_context(|| format!("error building URL matcher for control {control}"))?;
        Ok(Self { pattern })
    }

    /// The relative asset path for a matching URL, `None` otherwise.
    ///
    /// Matching is case-sensitive and looks only at the URL; when the
    /// pattern occurs more than once, the first occurrence wins.
    pub fn relative_path<'a>(&self, url: &'a str) -> Option<&'a str> {
        self.pattern
            .captures(url)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }
}
