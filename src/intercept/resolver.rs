//! Sandboxed reads of built assets from the serving root.

use crate::common::path_exists;
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Cache policy attached to every successfully resolved asset.
pub const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

/// Outcome of resolving a relative asset path.
#[derive(Debug)]
pub enum Resolved {
    Ok {
        bytes: Vec<u8>,
        content_type: &'static str,
    },
    NotFound,
    Forbidden,
}

/// Reads assets rooted at a serving directory.
///
/// Every read is bounded by the canonicalized root: relative paths that
/// escape it, either lexically via `..` or through a symlink, are refused.
pub struct StaticResolver {
    root: PathBuf,
}

impl StaticResolver {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = tokio::fs::canonicalize(root.as_ref())
            .await
            .with_context(|| format!("serving directory {:?} does not exist", root.as_ref()))?;
        let meta = tokio::fs::metadata(&root)
            .await
            .with_context(|| format!("error reading metadata of serving directory {root:?}"))?;
        if !meta.is_dir() {
            anyhow::bail!("serving path {root:?} is not a directory");
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative asset path to its bytes and content type.
    pub async fn resolve(&self, relative: &str) -> Resolved {
        let candidate = match sandboxed_join(&self.root, relative) {
            Some(candidate) => candidate,
            None => return Resolved::Forbidden,
        };

        // Re-check against the canonical path so symlinks cannot smuggle
        // reads outside of the root.
        let absolute = match tokio::fs::canonicalize(&candidate).await {
            Ok(absolute) => absolute,
            Err(err) if err.kind() == ErrorKind::NotFound => return Resolved::NotFound,
            Err(err) => {
                tracing::debug!("error canonicalizing {candidate:?}: {err}");
                return Resolved::NotFound;
            }
        };
        if !absolute.starts_with(&self.root) || absolute == self.root {
            return Resolved::Forbidden;
        }

        let mut bytes = match tokio::fs::read(&absolute).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Resolved::NotFound,
            Err(err) => {
                tracing::debug!("error reading {absolute:?}: {err}");
                return Resolved::NotFound;
            }
        };

        let content_type = if relative.ends_with(".map") {
            "application/json"
        } else {
            "application/javascript"
        };

        // Point the browser at the sibling source map so it is fetched
        // through the same interception path as the bundle itself.
        if relative.ends_with(".js") && sibling_map_exists(&absolute).await {
            bytes.extend_from_slice(format!("\n//# sourceMappingURL={relative}.map\n").as_bytes());
        }

        Resolved::Ok {
            bytes,
            content_type,
        }
    }
}

/// Join `relative` onto `root`, folding `.`/`..` lexically.
///
/// Returns `None` when the path is absolute or steps above the root.
fn sandboxed_join(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut joined = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(segment) => {
                joined.push(segment);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                joined.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(joined)
}

async fn sibling_map_exists(absolute: &Path) -> bool {
    let file_name = match absolute.file_name().and_then(|name| name.to_str()) {
        Some(name) => name,
        None => return false,
    };
    let sibling = absolute.with_file_name(format!("{file_name}.map"));
    path_exists(&sibling).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    async fn setup() -> Result<(tempfile::TempDir, StaticResolver)> {
        let tmpdir = tempfile::tempdir().context("error building tempdir for test")?;
        let root = tmpdir.path().join("out");
        tokio::fs::create_dir_all(&root).await?;
        tokio::fs::write(root.join("bundle.js"), b"console.log('bundle');").await?;
        let resolver = StaticResolver::new(&root).await?;
        Ok((tmpdir, resolver))
    }

    #[tokio::test]
    async fn resolves_existing_bundle() -> Result<()> {
        let (_tmpdir, resolver) = setup().await?;

        match resolver.resolve("bundle.js").await {
            Resolved::Ok {
                bytes,
                content_type,
            } => {
                assert_eq!(content_type, "application/javascript");
                assert!(bytes.starts_with(b"console.log('bundle');"));
            }
            other => panic!("expected Ok, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn map_files_are_json() -> Result<()> {
        let (_tmpdir, resolver) = setup().await?;
        tokio::fs::write(resolver.root().join("bundle.js.map"), b"{}").await?;

        match resolver.resolve("bundle.js.map").await {
            Resolved::Ok { content_type, .. } => {
                assert_eq!(content_type, "application/json");
            }
            other => panic!("expected Ok, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn appends_source_map_hint_when_sibling_exists() -> Result<()> {
        let (_tmpdir, resolver) = setup().await?;
        tokio::fs::write(resolver.root().join("bundle.js.map"), b"{}").await?;

        match resolver.resolve("bundle.js").await {
            Resolved::Ok { bytes, .. } => {
                let body = String::from_utf8(bytes)?;
                assert!(body.ends_with("\n//# sourceMappingURL=bundle.js.map\n"));
            }
            other => panic!("expected Ok, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn no_hint_without_sibling() -> Result<()> {
        let (_tmpdir, resolver) = setup().await?;

        match resolver.resolve("bundle.js").await {
            Resolved::Ok { bytes, .. } => {
                assert!(!String::from_utf8(bytes)?.contains("sourceMappingURL"));
            }
            other => panic!("expected Ok, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_not_found() -> Result<()> {
        let (_tmpdir, resolver) = setup().await?;
        assert!(matches!(
            resolver.resolve("other.js").await,
            Resolved::NotFound
        ));
        Ok(())
    }

    #[tokio::test]
    async fn parent_traversal_is_forbidden() -> Result<()> {
        let (tmpdir, resolver) = setup().await?;
        // A real file one level above the root must not be reachable.
        tokio::fs::write(tmpdir.path().join("secret.txt"), b"secret").await?;

        assert!(matches!(
            resolver.resolve("../secret.txt").await,
            Resolved::Forbidden
        ));
        assert!(matches!(
            resolver.resolve("../etc/passwd").await,
            Resolved::Forbidden
        ));
        Ok(())
    }

    #[tokio::test]
    async fn absolute_paths_are_forbidden() -> Result<()> {
        let (_tmpdir, resolver) = setup().await?;
        assert!(matches!(
            resolver.resolve("/etc/passwd").await,
            Resolved::Forbidden
        ));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_forbidden() -> Result<()> {
        let (tmpdir, resolver) = setup().await?;
        tokio::fs::write(tmpdir.path().join("secret.txt"), b"secret").await?;
        tokio::fs::symlink(
            tmpdir.path().join("secret.txt"),
            resolver.root().join("link.js"),
        )
        .await?;

        assert!(matches!(
            resolver.resolve("link.js").await,
            Resolved::Forbidden
        ));
        Ok(())
    }
}
