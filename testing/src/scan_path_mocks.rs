//! In-memory scan path settings.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use healwatch_projections::policy::{PolicyFuture, ScanPathError};
use healwatch_projections::{ScanPathPolicy, ScanPathSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// `HashMap`-backed [`ScanPathSource`].
#[derive(Debug, Default)]
pub struct InMemoryScanPaths {
    policies: RwLock<HashMap<i64, ScanPathPolicy>>,
    broken: AtomicBool,
}

impl InMemoryScanPaths {
    /// No configured paths.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure a path.
    #[must_use]
    pub fn with(self, path_id: i64, auto_remediate: bool, max_retries: u32) -> Self {
        self.insert(ScanPathPolicy {
            path_id: Some(path_id),
            auto_remediate,
            max_retries,
        });
        self
    }

    /// Configure or replace a path. Policies without a `path_id` are ignored.
    pub fn insert(&self, policy: ScanPathPolicy) {
        if let Some(path_id) = policy.path_id {
            self.policies.write().unwrap().insert(path_id, policy);
        }
    }

    /// Make every lookup fail until reset.
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }
}

impl ScanPathSource for InMemoryScanPaths {
    fn policy(&self, path_id: i64) -> PolicyFuture<'_, Option<ScanPathPolicy>> {
        Box::pin(async move {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ScanPathError::Database("injected lookup failure".to_string()));
            }
            Ok(self.policies.read().unwrap().get(&path_id).copied())
        })
    }
}
