//! Testing utilities for switchyard handlers and call trees.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! switchyard = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Recording handler order
//!
//! ```ignore
//! use switchyard::testing::HandlingLog;
//!
//! let log = HandlingLog::new();
//! let engine = Engine::builder()
//!     .with_handler::<PlaceOrder, _>(PlaceOrderHandler { log: log.clone() })
//!     .with_handler::<OrderPlaced, _>(ReserveStock { log: log.clone() })
//!     .build();
//!
//! engine.execute_command(PlaceOrder::default(), None).await?;
//! log.assert_entries(&["place", "reserve"]);
//! ```
//!
//! ## Observing flushes
//!
//! ```ignore
//! use switchyard::testing::RecordingResourceManager;
//!
//! let log = HandlingLog::new();
//! let orders = RecordingResourceManager::new("orders", &log).in_group("db");
//!
//! // Inside a handler: ctx.enlist(orders.clone())?;
//!
//! engine.execute_command(PlaceOrder::default(), None).await?;
//! assert_eq!(orders.flush_count(), 1);
//! log.assert_entries(&["flush:orders"]);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::unit_of_work::{ResourceId, ResourceManager};

// =============================================================================
// HandlingLog
// =============================================================================

/// Shared, ordered log of what happened during a call.
///
/// Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct HandlingLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl HandlingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.lock().push(entry.into());
    }

    /// Snapshot of every entry so far.
    pub fn entries(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Entries that start with `prefix`, in order.
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Panics unless the log holds exactly `expected`, in order.
    pub fn assert_entries(&self, expected: &[&str]) {
        let actual = self.entries();
        assert_eq!(
            actual, expected,
            "handling log mismatch\n  expected: {expected:?}\n  actual:   {actual:?}"
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// =============================================================================
// RecordingResourceManager
// =============================================================================

/// A resource manager that records its flushes instead of writing anywhere.
///
/// Each flush appends `flush:<name>` to the log it was created with.
#[derive(Debug)]
pub struct RecordingResourceManager {
    name: String,
    resource_id: Option<ResourceId>,
    log: HandlingLog,
    dirty: bool,
    fail: bool,
    delay: Option<Duration>,
    flushes: AtomicUsize,
}

impl RecordingResourceManager {
    /// A dirty manager in the implicit shared group.
    pub fn new(name: impl Into<String>, log: &HandlingLog) -> Self {
        Self {
            name: name.into(),
            resource_id: None,
            log: log.clone(),
            dirty: true,
            fail: false,
            delay: None,
            flushes: AtomicUsize::new(0),
        }
    }

    pub fn in_group(mut self, resource_id: impl Into<ResourceId>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Report that nothing needs flushing.
    pub fn clean(mut self) -> Self {
        self.dirty = false;
        self
    }

    /// Fail every flush.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Sleep before recording each flush.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of completed flush calls, successful or not.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceManager for RecordingResourceManager {
    fn resource_id(&self) -> Option<ResourceId> {
        self.resource_id.clone()
    }

    fn requires_flush(&self) -> bool {
        self.dirty
    }

    async fn flush(&self) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            self.log.record(format!("fail:{}", self.name));
            return Err(anyhow!("{} failed to flush", self.name));
        }
        self.log.record(format!("flush:{}", self.name));
        Ok(())
    }
}
