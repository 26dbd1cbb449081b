//! Unit of work: resource managers enlisted during a root call, flushed once.
//!
//! # Flush protocol
//!
//! Handlers enlist [`ResourceManager`]s while they run. Nothing is written
//! until the root call's whole sub-tree has completed; then the engine calls
//! [`UnitOfWork::flush`] exactly once.
//!
//! Managers are grouped by [`ResourceId`]. Within a group they flush strictly
//! in enlistment order. Across groups the [`UnitOfWorkMode`] decides:
//!
//! | Mode         | Across groups                               | On failure                    |
//! |--------------|---------------------------------------------|-------------------------------|
//! | `Concurrent` | all groups at once                          | every group still completes   |
//! | `Sequential` | one group at a time, in enlistment order    | remaining groups are skipped  |
//! | `Disabled`   | n/a: `enlist` itself fails                  | n/a                           |
//!
//! There is no rollback. Undoing an already flushed manager is the manager's
//! own business.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, error};

/// Grouping key for resource managers that write to the same resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pluggable change tracker, e.g. a repository with pending writes.
///
/// # Example
///
/// ```ignore
/// struct OrderRepository {
///     pending: Mutex<Vec<Order>>,
///     db: PgPool,
/// }
///
/// #[async_trait]
/// impl ResourceManager for OrderRepository {
///     fn resource_id(&self) -> Option<ResourceId> {
///         Some(ResourceId::new("orders-db"))
///     }
///
///     fn requires_flush(&self) -> bool {
///         !self.pending.lock().unwrap().is_empty()
///     }
///
///     async fn flush(&self) -> Result<()> {
///         let orders = std::mem::take(&mut *self.pending.lock().unwrap());
///         insert_orders(&self.db, orders).await
///     }
/// }
/// ```
#[async_trait]
pub trait ResourceManager: Send + Sync + 'static {
    /// The resource this manager writes to. `None` joins the implicit shared group.
    fn resource_id(&self) -> Option<ResourceId>;

    /// Whether the manager has pending changes. Managers returning `false`
    /// are skipped at flush time.
    fn requires_flush(&self) -> bool;

    /// Write pending changes.
    async fn flush(&self) -> Result<()>;
}

/// How resource groups are flushed relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitOfWorkMode {
    /// Every group flushes as an independent concurrent future.
    #[default]
    Concurrent,
    /// Groups flush one at a time; the first failure aborts the rest.
    Sequential,
    /// Enlisting fails. Asserts that a call path has no durable side effects.
    Disabled,
}

impl FromStr for UnitOfWorkMode {
    type Err = UnitOfWorkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concurrent" => Ok(UnitOfWorkMode::Concurrent),
            "sequential" => Ok(UnitOfWorkMode::Sequential),
            "disabled" => Ok(UnitOfWorkMode::Disabled),
            other => Err(UnitOfWorkError::UnknownMode {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for UnitOfWorkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOfWorkMode::Concurrent => write!(f, "concurrent"),
            UnitOfWorkMode::Sequential => write!(f, "sequential"),
            UnitOfWorkMode::Disabled => write!(f, "disabled"),
        }
    }
}

/// Errors raised while enlisting or configuring a unit of work.
#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    /// The unit of work does not accept resource managers.
    #[error("unit of work is disabled: cannot enlist resource manager for {}", display_group(.resource_id))]
    Disabled { resource_id: Option<ResourceId> },

    /// A mode string could not be parsed.
    #[error("unknown unit of work mode '{value}' (expected concurrent, sequential or disabled)")]
    UnknownMode { value: String },
}

/// One resource group that failed to flush.
#[derive(Debug)]
pub struct GroupFlushFailure {
    pub resource_id: Option<ResourceId>,
    /// Number of managers in the group that flushed before the failure.
    pub flushed: usize,
    pub error: anyhow::Error,
}

impl fmt::Display for GroupFlushFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (after {} flushed): {}",
            display_group(&self.resource_id),
            self.flushed,
            self.error
        )
    }
}

/// The aggregate failure of a flush: every group that faulted.
#[derive(Debug, Error)]
#[error("unit of work flush failed for {} resource group(s): {}", .failures.len(), join_failures(.failures))]
pub struct FlushError {
    pub failures: Vec<GroupFlushFailure>,
}

fn join_failures(failures: &[GroupFlushFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn display_group(resource_id: &Option<ResourceId>) -> String {
    match resource_id {
        Some(id) => format!("resource '{id}'"),
        None => "the implicit resource group".to_string(),
    }
}

/// What a successful flush did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushSummary {
    /// Groups that had at least one enlisted manager.
    pub groups: usize,
    /// Managers whose `flush` was called.
    pub flushed: usize,
}

struct ResourceGroup {
    resource_id: Option<ResourceId>,
    managers: Vec<Arc<dyn ResourceManager>>,
}

/// Registry of pending resource flushes for one root call.
pub struct UnitOfWork {
    mode: UnitOfWorkMode,
    groups: Mutex<Vec<ResourceGroup>>,
}

impl UnitOfWork {
    pub fn new(mode: UnitOfWorkMode) -> Self {
        Self {
            mode,
            groups: Mutex::new(Vec::new()),
        }
    }

    /// A unit of work that rejects every enlistment.
    pub fn disabled() -> Self {
        Self::new(UnitOfWorkMode::Disabled)
    }

    pub fn mode(&self) -> UnitOfWorkMode {
        self.mode
    }

    /// Enlist a manager for flushing at the end of the root call.
    ///
    /// Enlisting the same `Arc` twice is a no-op.
    pub fn enlist(&self, manager: Arc<dyn ResourceManager>) -> Result<(), UnitOfWorkError> {
        let resource_id = manager.resource_id();
        if self.mode == UnitOfWorkMode::Disabled {
            return Err(UnitOfWorkError::Disabled { resource_id });
        }

        let mut groups = self.lock_groups();
        match groups.iter_mut().find(|g| g.resource_id == resource_id) {
            Some(group) => {
                if !group.managers.iter().any(|m| Arc::ptr_eq(m, &manager)) {
                    group.managers.push(manager);
                }
            }
            None => groups.push(ResourceGroup {
                resource_id,
                managers: vec![manager],
            }),
        }
        Ok(())
    }

    /// Number of distinct managers currently enlisted.
    pub fn enlisted_count(&self) -> usize {
        self.lock_groups().iter().map(|g| g.managers.len()).sum()
    }

    /// Number of resource groups currently enlisted.
    pub fn group_count(&self) -> usize {
        self.lock_groups().len()
    }

    /// Flush every enlisted manager that requires it.
    ///
    /// The enlistment map is taken first, so managers enlisted while the flush
    /// is running start a fresh cycle.
    pub async fn flush(&self) -> Result<FlushSummary, FlushError> {
        let groups = std::mem::take(&mut *self.lock_groups());
        if groups.is_empty() {
            return Ok(FlushSummary::default());
        }

        let group_count = groups.len();
        debug!(mode = %self.mode, groups = group_count, "flushing unit of work");

        match self.mode {
            UnitOfWorkMode::Sequential => {
                let mut flushed = 0;
                for group in groups {
                    match flush_group(group).await {
                        Ok(n) => flushed += n,
                        Err(failure) => {
                            return Err(FlushError {
                                failures: vec![failure],
                            })
                        }
                    }
                }
                Ok(FlushSummary {
                    groups: group_count,
                    flushed,
                })
            }
            // Disabled never has groups, so it shares the concurrent path.
            UnitOfWorkMode::Concurrent | UnitOfWorkMode::Disabled => {
                let results = join_all(groups.into_iter().map(flush_group)).await;

                let mut flushed = 0;
                let mut failures = Vec::new();
                for result in results {
                    match result {
                        Ok(n) => flushed += n,
                        Err(failure) => failures.push(failure),
                    }
                }

                if failures.is_empty() {
                    Ok(FlushSummary {
                        groups: group_count,
                        flushed,
                    })
                } else {
                    Err(FlushError { failures })
                }
            }
        }
    }

    fn lock_groups(&self) -> std::sync::MutexGuard<'_, Vec<ResourceGroup>> {
        // A panicking resource manager never holds this lock, so recover.
        self.groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("mode", &self.mode)
            .field("groups", &self.group_count())
            .finish()
    }
}

async fn flush_group(group: ResourceGroup) -> Result<usize, GroupFlushFailure> {
    let mut flushed = 0;
    for manager in &group.managers {
        if !manager.requires_flush() {
            continue;
        }
        if let Err(e) = manager.flush().await {
            error!(
                group = %display_group(&group.resource_id),
                flushed,
                error = ?e,
                "resource manager flush failed"
            );
            return Err(GroupFlushFailure {
                resource_id: group.resource_id,
                flushed,
                error: e,
            });
        }
        flushed += 1;
    }
    debug!(group = %display_group(&group.resource_id), flushed, "resource group flushed");
    Ok(flushed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Tracker {
        name: &'static str,
        resource_id: Option<ResourceId>,
        dirty: AtomicBool,
        fail: bool,
        delay_ms: u64,
        flushes: AtomicUsize,
        log: Log,
    }

    impl Tracker {
        fn new(name: &'static str, resource_id: Option<&str>, log: &Log) -> Self {
            Self {
                name,
                resource_id: resource_id.map(ResourceId::from),
                dirty: AtomicBool::new(true),
                fail: false,
                delay_ms: 0,
                flushes: AtomicUsize::new(0),
                log: log.clone(),
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn slow(mut self, delay_ms: u64) -> Self {
            self.delay_ms = delay_ms;
            self
        }

        fn shared(self) -> Arc<Self> {
            Arc::new(self)
        }
    }

    #[async_trait]
    impl ResourceManager for Tracker {
        fn resource_id(&self) -> Option<ResourceId> {
            self.resource_id.clone()
        }

        fn requires_flush(&self) -> bool {
            self.dirty.load(Ordering::SeqCst)
        }

        async fn flush(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.flushes.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("end:{}", self.name));
            if self.fail {
                anyhow::bail!("{} refused to flush", self.name);
            }
            self.dirty.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_enlist_same_manager_twice_is_noop() {
        let log = log();
        let uow = UnitOfWork::new(UnitOfWorkMode::Concurrent);
        let repo = Tracker::new("orders", Some("db"), &log).shared();

        uow.enlist(repo.clone()).unwrap();
        uow.enlist(repo.clone()).unwrap();

        assert_eq!(uow.enlisted_count(), 1);
        let summary = uow.flush().await.unwrap();
        assert_eq!(summary, FlushSummary { groups: 1, flushed: 1 });
        assert_eq!(repo.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_group_flushes_in_enlistment_order() {
        let log = log();
        let uow = UnitOfWork::new(UnitOfWorkMode::Concurrent);

        // The slow first manager must still finish before the second starts.
        uow.enlist(Tracker::new("a", Some("db"), &log).slow(20).shared()).unwrap();
        uow.enlist(Tracker::new("b", Some("db"), &log).shared()).unwrap();
        uow.enlist(Tracker::new("c", Some("db"), &log).shared()).unwrap();

        uow.flush().await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:a", "end:a", "start:b", "end:b", "start:c", "end:c"]
        );
    }

    #[tokio::test]
    async fn test_concurrent_groups_interleave() {
        let log = log();
        let uow = UnitOfWork::new(UnitOfWorkMode::Concurrent);

        uow.enlist(Tracker::new("slow", Some("db"), &log).slow(30).shared()).unwrap();
        uow.enlist(Tracker::new("fast", Some("cache"), &log).shared()).unwrap();

        let summary = uow.flush().await.unwrap();
        assert_eq!(summary, FlushSummary { groups: 2, flushed: 2 });

        let entries = log.lock().unwrap().clone();
        let fast_end = entries.iter().position(|e| e == "end:fast").unwrap();
        let slow_end = entries.iter().position(|e| e == "end:slow").unwrap();
        assert!(fast_end < slow_end, "groups should not wait for each other: {entries:?}");
    }

    #[tokio::test]
    async fn test_sequential_groups_run_one_at_a_time() {
        let log = log();
        let uow = UnitOfWork::new(UnitOfWorkMode::Sequential);

        uow.enlist(Tracker::new("slow", Some("db"), &log).slow(20).shared()).unwrap();
        uow.enlist(Tracker::new("fast", Some("cache"), &log).shared()).unwrap();

        uow.flush().await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:slow", "end:slow", "start:fast", "end:fast"]
        );
    }

    #[tokio::test]
    async fn test_sequential_failure_aborts_remaining_groups() {
        let log = log();
        let uow = UnitOfWork::new(UnitOfWorkMode::Sequential);
        let later = Tracker::new("later", Some("cache"), &log).shared();

        uow.enlist(Tracker::new("broken", Some("db"), &log).failing().shared()).unwrap();
        uow.enlist(later.clone()).unwrap();

        let err = uow.flush().await.unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].resource_id, Some(ResourceId::from("db")));
        assert_eq!(later.flushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_failure_still_awaits_other_groups() {
        let log = log();
        let uow = UnitOfWork::new(UnitOfWorkMode::Concurrent);
        let survivor = Tracker::new("survivor", Some("cache"), &log).slow(20).shared();

        uow.enlist(Tracker::new("broken", Some("db"), &log).failing().shared()).unwrap();
        uow.enlist(Tracker::new("also-broken", None, &log).failing().shared()).unwrap();
        uow.enlist(survivor.clone()).unwrap();

        let err = uow.flush().await.unwrap_err();
        assert_eq!(err.failures.len(), 2);
        assert_eq!(survivor.flushes.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("2 resource group(s)"));
        assert!(err.to_string().contains("implicit resource group"));
    }

    #[tokio::test]
    async fn test_failure_stops_rest_of_same_group() {
        let log = log();
        let uow = UnitOfWork::new(UnitOfWorkMode::Concurrent);
        let first = Tracker::new("first", Some("db"), &log).shared();
        let after = Tracker::new("after", Some("db"), &log).shared();

        uow.enlist(first.clone()).unwrap();
        uow.enlist(Tracker::new("broken", Some("db"), &log).failing().shared()).unwrap();
        uow.enlist(after.clone()).unwrap();

        let err = uow.flush().await.unwrap_err();
        assert_eq!(err.failures[0].flushed, 1);
        assert_eq!(first.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(after.flushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_clean_managers_are_skipped() {
        let log = log();
        let uow = UnitOfWork::new(UnitOfWorkMode::Concurrent);
        let clean = Tracker::new("clean", Some("db"), &log).shared();
        clean.dirty.store(false, Ordering::SeqCst);

        uow.enlist(clean.clone()).unwrap();
        let summary = uow.flush().await.unwrap();

        assert_eq!(summary, FlushSummary { groups: 1, flushed: 0 });
        assert_eq!(clean.flushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_flush_takes_enlistments() {
        let log = log();
        let uow = UnitOfWork::new(UnitOfWorkMode::Concurrent);
        let repo = Tracker::new("orders", None, &log).shared();

        uow.enlist(repo.clone()).unwrap();
        uow.flush().await.unwrap();
        assert_eq!(uow.enlisted_count(), 0);

        // Nothing left to flush on a second call.
        let summary = uow.flush().await.unwrap();
        assert_eq!(summary, FlushSummary::default());
        assert_eq!(repo.flushes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_none_resource_ids_share_one_group() {
        let log = log();
        let uow = UnitOfWork::new(UnitOfWorkMode::Concurrent);

        uow.enlist(Tracker::new("a", None, &log).shared()).unwrap();
        uow.enlist(Tracker::new("b", None, &log).shared()).unwrap();
        uow.enlist(Tracker::new("c", Some("db"), &log).shared()).unwrap();

        assert_eq!(uow.group_count(), 2);
        assert_eq!(uow.enlisted_count(), 3);
    }

    #[test]
    fn test_disabled_rejects_enlistment() {
        let log = log();
        let uow = UnitOfWork::disabled();

        let err = uow.enlist(Tracker::new("a", Some("db"), &log).shared()).unwrap_err();
        assert!(matches!(err, UnitOfWorkError::Disabled { .. }));
        assert!(err.to_string().contains("resource 'db'"));
        assert_eq!(uow.enlisted_count(), 0);
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("concurrent".parse::<UnitOfWorkMode>().unwrap(), UnitOfWorkMode::Concurrent);
        assert_eq!(" Sequential ".parse::<UnitOfWorkMode>().unwrap(), UnitOfWorkMode::Sequential);
        assert_eq!("DISABLED".parse::<UnitOfWorkMode>().unwrap(), UnitOfWorkMode::Disabled);
        assert!("parallel".parse::<UnitOfWorkMode>().is_err());
        assert_eq!(UnitOfWorkMode::default(), UnitOfWorkMode::Concurrent);
    }
}
