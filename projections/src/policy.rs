//! Per-scan-path remediation policy.
//!
//! Each library path decides whether corruptions found under it are remediated
//! automatically and how many retries they get. Settings live in storage
//! behind [`ScanPathSource`]; unknown paths fall back to a default policy.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Retry limit applied when nothing more specific is configured.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Errors reading scan path settings.
#[derive(Error, Debug, Clone)]
pub enum ScanPathError {
    /// Storage backend error.
    #[error("Database error: {0}")]
    Database(String),
}

/// Boxed future returned by [`ScanPathSource`] methods.
pub type PolicyFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ScanPathError>> + Send + 'a>>;

/// Remediation settings for one scan path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanPathPolicy {
    /// Scan path id, `None` for the fallback policy.
    pub path_id: Option<i64>,
    /// Queue remediation as soon as corruption is detected.
    pub auto_remediate: bool,
    /// Automatic retries allowed before giving up.
    pub max_retries: u32,
}

impl ScanPathPolicy {
    /// Fallback policy.
    #[must_use]
    pub const fn fallback(auto_remediate: bool, max_retries: u32) -> Self {
        Self {
            path_id: None,
            auto_remediate,
            max_retries,
        }
    }
}

impl Default for ScanPathPolicy {
    fn default() -> Self {
        Self::fallback(true, DEFAULT_MAX_RETRIES)
    }
}

/// Storage of per-path settings.
pub trait ScanPathSource: Send + Sync {
    /// Policy configured for `path_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ScanPathError::Database`] if settings could not be read.
    fn policy(&self, path_id: i64) -> PolicyFuture<'_, Option<ScanPathPolicy>>;
}

/// Looks up a path's policy and applies the fallback.
#[derive(Clone)]
pub struct PolicyResolver {
    source: Arc<dyn ScanPathSource>,
    fallback: ScanPathPolicy,
}

impl std::fmt::Debug for PolicyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyResolver")
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

impl PolicyResolver {
    /// Create a resolver over `source`.
    #[must_use]
    pub fn new(source: Arc<dyn ScanPathSource>, fallback: ScanPathPolicy) -> Self {
        Self { source, fallback }
    }

    /// The fallback policy.
    #[must_use]
    pub const fn fallback(&self) -> ScanPathPolicy {
        self.fallback
    }

    /// Effective policy for `path_id`.
    ///
    /// Missing ids, unknown paths, and read failures all resolve to the
    /// fallback. A read failure is logged.
    pub async fn resolve(&self, path_id: Option<i64>) -> ScanPathPolicy {
        let Some(path_id) = path_id else {
            return self.fallback;
        };

        match self.source.policy(path_id).await {
            Ok(Some(policy)) => policy,
            Ok(None) => ScanPathPolicy {
                path_id: Some(path_id),
                ..self.fallback
            },
            Err(e) => {
                warn!(path_id, error = %e, "Scan path lookup failed, using fallback policy");
                ScanPathPolicy {
                    path_id: Some(path_id),
                    ..self.fallback
                }
            }
        }
    }
}
