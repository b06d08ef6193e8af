//! Per-script lifecycle records and the registry that owns them.
//!
//! An [`InstanceEntry`] is the currently active association between a
//! script and its live resources: the fingerprint of the compiled module
//! bound to it, the fingerprint of the bound tunnel session, an idle
//! deadline, and a cancellation scope whose closing tears down everything
//! reachable from it.
//!
//! The [`InstanceRegistry`] keeps one entry per script path. Entry creation
//! spawns two background watchers:
//! - an idle watcher that cancels the entry's scope once the deadline
//!   passes without a request touching it, and
//! - a removal watcher that drops the entry from the registry as soon as
//!   the scope closes, whatever triggered the closure.
//!
//! Cancellation is idempotent and races benignly with fresh requests: a
//! `touch` that loses against a timer fire simply has no effect, and the
//! next request creates a fresh entry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::fingerprint::{ModuleKey, SessionKey};

/// The module and session currently bound to a script.
///
/// Swapped as one value under the entry's lock so concurrent readers see
/// either the fully-old or the fully-new binding, never a mix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Fingerprint of the compiled module currently bound.
    pub module: ModuleKey,
    /// Fingerprint of the tunnel session currently bound.
    pub session: SessionKey,
}

/// Fingerprints superseded by a rebind; the caller is responsible for
/// releasing the resources they name.
#[derive(Debug, Default)]
pub struct StaleBinding {
    /// The previously bound module key, if it changed.
    pub module: Option<ModuleKey>,
    /// The previously bound session key, if it changed.
    pub session: Option<SessionKey>,
}

/// Lifecycle record for one script.
pub struct InstanceEntry {
    script: PathBuf,
    scope: CancellationToken,
    binding: RwLock<Binding>,
    deadline: Mutex<Instant>,
    idle_timeout: Duration,
}

impl InstanceEntry {
    fn new(script: PathBuf, binding: Binding, idle_timeout: Duration) -> Self {
        Self {
            script,
            scope: CancellationToken::new(),
            binding: RwLock::new(binding),
            deadline: Mutex::new(Instant::now() + idle_timeout),
            idle_timeout,
        }
    }

    /// The script path this entry belongs to.
    pub fn script(&self) -> &Path {
        &self.script
    }

    /// The cancellation scope owning everything this entry keeps alive.
    ///
    /// Sessions launched on behalf of this entry run under child tokens of
    /// this scope, so cancelling it transitively stops the bound instance
    /// and closes the bound session without the caller having to know
    /// whether a session currently exists.
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    /// Push the idle deadline out by the configured timeout.
    pub fn touch(&self) {
        *self.deadline.lock() = Instant::now() + self.idle_timeout;
    }

    /// Snapshot the current module/session binding.
    pub fn binding(&self) -> Binding {
        self.binding.read().clone()
    }

    /// Install a new binding, returning the fingerprints it superseded.
    ///
    /// The swap happens under the entry's write lock; the caller releases
    /// whatever `StaleBinding` names so stale compiled code and stale
    /// sessions never accumulate.
    pub fn rebind(&self, module: ModuleKey, session: SessionKey) -> StaleBinding {
        let mut binding = self.binding.write();
        let mut stale = StaleBinding::default();

        if binding.module != module {
            stale.module = Some(std::mem::replace(&mut binding.module, module));
        }
        if binding.session != session {
            stale.session = Some(std::mem::replace(&mut binding.session, session));
        }

        stale
    }

    /// Cancel the entry's scope. Safe to call any number of times.
    pub fn shut_down(&self) {
        self.scope.cancel();
    }

    /// Returns `true` once the entry's scope has been cancelled.
    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled()
    }
}

impl std::fmt::Debug for InstanceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceEntry")
            .field("script", &self.script)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Registry of live instance entries, one per script path.
pub struct InstanceRegistry {
    entries: Arc<DashMap<PathBuf, Arc<InstanceEntry>>>,
    idle_timeout: Duration,
}

impl InstanceRegistry {
    /// Create a registry whose entries expire after `idle_timeout` without
    /// a request.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            idle_timeout,
        }
    }

    /// Get the live entry for `script`, creating one if absent.
    ///
    /// An existing live entry has its idle deadline reset. An entry whose
    /// scope already closed (timer fired but the removal watcher has not
    /// run yet) is replaced with a fresh one.
    pub fn get_or_create(
        &self,
        script: &Path,
        module: ModuleKey,
        session: SessionKey,
    ) -> Arc<InstanceEntry> {
        let binding = Binding { module, session };

        let (entry, created) = match self.entries.entry(script.to_path_buf()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_closed() {
                    let fresh = Arc::new(InstanceEntry::new(
                        script.to_path_buf(),
                        binding,
                        self.idle_timeout,
                    ));
                    occupied.insert(fresh.clone());
                    (fresh, true)
                } else {
                    let entry = occupied.get().clone();
                    entry.touch();
                    (entry, false)
                }
            }
            Entry::Vacant(vacant) => {
                let fresh = Arc::new(InstanceEntry::new(
                    script.to_path_buf(),
                    binding,
                    self.idle_timeout,
                ));
                vacant.insert(fresh.clone());
                (fresh, true)
            }
        };

        if created {
            self.spawn_watchers(&entry);
        }
        entry
    }

    /// Get the live entry for `script`, if any.
    pub fn get(&self, script: &Path) -> Option<Arc<InstanceEntry>> {
        self.entries.get(script).map(|entry| entry.clone())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entries are live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cancel every entry's scope, tearing down all sessions.
    pub fn shut_down_all(&self) {
        for entry in self.entries.iter() {
            entry.shut_down();
        }
    }

    fn spawn_watchers(&self, entry: &Arc<InstanceEntry>) {
        // Idle watcher: sleep to the deadline, then re-read it. A request
        // that touched the entry in the meantime moved the deadline and the
        // loop sleeps again; otherwise the scope closes.
        let idle_entry = entry.clone();
        tokio::spawn(async move {
            loop {
                let deadline = *idle_entry.deadline.lock();
                tokio::select! {
                    () = idle_entry.scope.cancelled() => break,
                    () = tokio::time::sleep_until(deadline) => {
                        if Instant::now() >= *idle_entry.deadline.lock() {
                            debug!(script = %idle_entry.script.display(), "instance idle timeout");
                            idle_entry.scope.cancel();
                            break;
                        }
                    }
                }
            }
        });

        // Removal watcher: drop the entry from the registry once its scope
        // closes, but never a replacement entry under the same key.
        let entries = self.entries.clone();
        let removed_entry = entry.clone();
        tokio::spawn(async move {
            removed_entry.scope.cancelled().await;
            entries.remove_if(&removed_entry.script, |_, live| {
                Arc::ptr_eq(live, &removed_entry)
            });
            debug!(script = %removed_entry.script.display(), "instance entry removed");
        });
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("entries", &self.entries.len())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration as StdDuration, UNIX_EPOCH};

    fn module_key(secs: u64) -> ModuleKey {
        ModuleKey::new("/srv/app.wasm", UNIX_EPOCH + StdDuration::from_secs(secs))
    }

    fn session_key(secs: u64) -> SessionKey {
        SessionKey::new(module_key(secs), false, None, "")
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_live_entry() {
        let registry = InstanceRegistry::new(Duration::from_secs(60));
        let script = Path::new("/srv/app.wasm");

        let first = registry.get_or_create(script, module_key(1), session_key(1));
        let second = registry.get_or_create(script, module_key(1), session_key(1));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_rebind_reports_stale_keys() {
        let registry = InstanceRegistry::new(Duration::from_secs(60));
        let entry =
            registry.get_or_create(Path::new("/srv/app.wasm"), module_key(1), session_key(1));

        // Same keys: nothing superseded.
        let stale = entry.rebind(module_key(1), session_key(1));
        assert!(stale.module.is_none());
        assert!(stale.session.is_none());

        // New fingerprint: both the module and the session it anchors go
        // stale.
        let stale = entry.rebind(module_key(2), session_key(2));
        assert_eq!(stale.module, Some(module_key(1)));
        assert_eq!(stale.session, Some(session_key(1)));

        assert_eq!(entry.binding().module, module_key(2));
    }

    #[tokio::test]
    async fn test_closed_entry_is_replaced() {
        let registry = InstanceRegistry::new(Duration::from_secs(60));
        let script = Path::new("/srv/app.wasm");

        let first = registry.get_or_create(script, module_key(1), session_key(1));
        first.shut_down();

        let second = registry.get_or_create(script, module_key(1), session_key(1));
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn test_shut_down_is_idempotent() {
        let registry = InstanceRegistry::new(Duration::from_secs(60));
        let entry =
            registry.get_or_create(Path::new("/srv/app.wasm"), module_key(1), session_key(1));

        entry.shut_down();
        entry.shut_down();
        assert!(entry.is_closed());
    }

    #[tokio::test]
    async fn test_idle_timeout_evicts_entry() {
        let registry = InstanceRegistry::new(Duration::from_millis(50));
        let script = Path::new("/srv/app.wasm");

        let entry = registry.get_or_create(script, module_key(1), session_key(1));
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(entry.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_touch_defers_idle_timeout() {
        let registry = InstanceRegistry::new(Duration::from_millis(100));
        let script = Path::new("/srv/app.wasm");

        let entry = registry.get_or_create(script, module_key(1), session_key(1));
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            entry.touch();
        }
        assert!(!entry.is_closed());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(entry.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_scope_close_removes_entry() {
        let registry = InstanceRegistry::new(Duration::from_secs(60));
        let script = Path::new("/srv/app.wasm");

        let entry = registry.get_or_create(script, module_key(1), session_key(1));
        entry.shut_down();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(registry.is_empty());
    }
}
