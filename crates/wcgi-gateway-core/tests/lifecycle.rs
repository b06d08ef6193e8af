//! Integration tests for the lifecycle primitives.
//!
//! These exercise the compute-once cache and the instance registry
//! together, the way the gateway drives them: fingerprints resolved per
//! request, superseded keys released eagerly, idle entries torn down by
//! their own watchers.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use wcgi_gateway_core::{ComputeCache, InstanceRegistry, ModuleKey, SessionKey};

fn module_key(secs: u64) -> ModuleKey {
    ModuleKey::new("/srv/app.wasm", UNIX_EPOCH + Duration::from_secs(secs))
}

fn session_key(secs: u64) -> SessionKey {
    SessionKey::new(module_key(secs), false, None, "")
}

// ============================================================================
// Test: Compute-once under contention, keyed by fingerprint
// ============================================================================

#[tokio::test]
async fn test_one_build_per_fingerprint_under_load() {
    let cache = Arc::new(ComputeCache::<ModuleKey, String>::new());
    let builds = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..24 {
        let cache = cache.clone();
        let builds = builds.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_try_init(&module_key(1), || async {
                    builds.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok::<_, std::io::Error>(Arc::new("compiled".to_string()))
                })
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(*handle.await.unwrap(), "compiled");
    }

    assert_eq!(builds.load(Ordering::SeqCst), 1);

    // A different fingerprint for the same script builds again.
    cache
        .get_or_try_init(&module_key(2), || async {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(Arc::new("recompiled".to_string()))
        })
        .await
        .unwrap();
    assert_eq!(builds.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 2);
}

// ============================================================================
// Test: Rebind releases exactly the superseded resource
// ============================================================================

#[tokio::test]
async fn test_rebind_drives_eager_release() {
    let modules = ComputeCache::<ModuleKey, String>::new();
    let registry = InstanceRegistry::new(Duration::from_secs(60));
    let script = Path::new("/srv/app.wasm");

    modules.insert(module_key(1), Arc::new("v1".to_string()));
    let entry = registry.get_or_create(script, module_key(1), session_key(1));

    // Same fingerprint: nothing to release.
    let stale = entry.rebind(module_key(1), session_key(1));
    assert!(stale.module.is_none());

    // New fingerprint: the old module comes out of the cache.
    modules.insert(module_key(2), Arc::new("v2".to_string()));
    let stale = entry.rebind(module_key(2), session_key(2));
    let old = stale.module.expect("old fingerprint superseded");
    assert!(modules.remove(&old).is_some());

    assert_eq!(modules.len(), 1);
    assert!(modules.get(&module_key(2)).is_some());
}

// ============================================================================
// Test: Entry teardown is observable and idempotent
// ============================================================================

#[tokio::test]
async fn test_idle_entry_cleanup() {
    let registry = InstanceRegistry::new(Duration::from_millis(50));
    let script = Path::new("/srv/app.wasm");

    let entry = registry.get_or_create(script, module_key(1), session_key(1));
    let watcher = entry.scope().child_token();

    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(entry.is_closed());
    assert!(watcher.is_cancelled(), "child scopes close transitively");
    assert!(registry.is_empty());

    // A fresh request after eviction gets a fresh entry.
    let replacement = registry.get_or_create(script, module_key(1), session_key(1));
    assert!(!replacement.is_closed());
    assert!(!Arc::ptr_eq(&entry, &replacement));
}
