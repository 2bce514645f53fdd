use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::knowledge::{KnowledgeStore, StoreOptions, StoreStats};

/// Tenant used for direct messages, which have no room id.
pub const DM_TENANT: &str = "dm";

#[derive(Debug, Clone, Serialize)]
pub struct TenantStats {
    pub tenant_id: String,
    #[serde(flatten)]
    pub store: StoreStats,
}

/// Lazily opens one [`KnowledgeStore`] per tenant under the instance data root
/// and keeps it open until [`TenantRouter::close_all`].
pub struct TenantRouter {
    instance_id: String,
    root: PathBuf,
    options: StoreOptions,
    stores: Mutex<HashMap<String, Arc<TenantSlot>>>,
    closed: AtomicBool,
}

/// One tenant's handle. Its lock is held while the store opens, so first
/// accesses of the same tenant wait here instead of on the whole map.
#[derive(Default)]
struct TenantSlot {
    store: Mutex<Option<Arc<KnowledgeStore>>>,
}

impl TenantSlot {
    fn opened(&self) -> Option<Arc<KnowledgeStore>> {
        self.store.lock().clone()
    }
}

impl TenantRouter {
    pub fn new(instance_id: &str, root: &Path, options: StoreOptions) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            root: root.to_path_buf(),
            options,
            stores: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Empty or absent tenant ids map to [`DM_TENANT`].
    pub fn tenant_key(tenant: Option<&str>) -> String {
        match tenant.map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => DM_TENANT.to_string(),
        }
    }

    /// Existing handle for the tenant, or a freshly opened one. Opening may
    /// rebuild the tenant's index, so call this off the async runtime.
    pub fn get_store(&self, tenant: Option<&str>) -> Result<Arc<KnowledgeStore>> {
        let key = Self::tenant_key(tenant);
        let dir_name = tenant_dir_name(&key)?;
        let slot = self.stores.lock().entry(key.clone()).or_default().clone();

        let mut opened = slot.store.lock();
        if let Some(store) = opened.as_ref() {
            return Ok(store.clone());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("tenant router for instance {} is closed", self.instance_id)));
        }
        let store = Arc::new(KnowledgeStore::open(&self.root.join(dir_name), &key, &self.options)?);
        info!(instance_id = %self.instance_id, tenant = %key, "created knowledge store");
        *opened = Some(store.clone());
        Ok(store)
    }

    fn opened_stores(&self) -> Vec<(String, Arc<KnowledgeStore>)> {
        let slots: Vec<(String, Arc<TenantSlot>)> =
            self.stores.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        slots
            .into_iter()
            .filter_map(|(tenant, slot)| slot.opened().map(|store| (tenant, store)))
            .collect()
    }

    pub fn tenants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.opened_stores().into_iter().map(|(k, _)| k).collect();
        ids.sort();
        ids
    }

    pub fn tenant_count(&self) -> usize {
        self.opened_stores().len()
    }

    pub fn stats(&self) -> Vec<TenantStats> {
        let mut out: Vec<TenantStats> = self
            .opened_stores()
            .into_iter()
            .filter_map(|(tenant_id, store)| match store.stats() {
                Ok(stats) => Some(TenantStats { tenant_id, store: stats }),
                Err(err) => {
                    error!(instance_id = %self.instance_id, tenant = %tenant_id, %err, "error getting tenant stats");
                    None
                }
            })
            .collect();
        out.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        out
    }

    /// Close every held store and refuse new ones. Waits for opens in flight.
    /// Keeps going past failures and reports the first.
    pub fn close_all(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(String, Arc<TenantSlot>)> = self.stores.lock().drain().collect();
        let mut first_err = None;
        for (tenant, slot) in drained {
            let Some(store) = slot.store.lock().take() else {
                continue;
            };
            if let Err(err) = store.close() {
                error!(instance_id = %self.instance_id, tenant = %tenant, %err, "failed to close knowledge store");
                first_err.get_or_insert(err);
            }
        }
        info!(instance_id = %self.instance_id, "closed all knowledge stores");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Tenant ids come from the chat platform; keep them to one safe path segment.
fn tenant_dir_name(tenant: &str) -> Result<String> {
    let ok = tenant.len() <= 128
        && tenant != "."
        && tenant != ".."
        && tenant.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(tenant.to_string())
    } else {
        Err(Error::Validation(format!("unsupported tenant id: {tenant:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;

    fn router(root: &Path) -> TenantRouter {
        TenantRouter::new(
            "I1",
            root,
            StoreOptions { embedder: Some(Arc::new(HashingEmbedder::default())) },
        )
    }

    #[test]
    fn same_tenant_returns_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(dir.path());
        let a1 = r.get_store(Some("A")).unwrap();
        let a2 = r.get_store(Some("A")).unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(dir.path().join("A").is_dir());
    }

    #[test]
    fn concurrent_first_access_builds_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let r = Arc::new(router(dir.path()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = r.clone();
                std::thread::spawn(move || r.get_store(Some("guild-1")).unwrap())
            })
            .collect();
        let stores: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(stores.iter().all(|s| Arc::ptr_eq(s, &stores[0])));
        assert_eq!(r.tenant_count(), 1);
    }

    #[test]
    fn slow_open_does_not_block_other_tenants() {
        let dir = tempfile::tempdir().unwrap();
        let r = Arc::new(router(dir.path()));
        let slot = r.stores.lock().entry("slow".to_string()).or_default().clone();
        // stands in for a long index rebuild on the "slow" tenant
        let held = slot.store.lock();

        let other = {
            let r = r.clone();
            std::thread::spawn(move || r.get_store(Some("fast")).map(|s| s.tenant_id().to_string()))
        };
        assert_eq!(other.join().unwrap().unwrap(), "fast");
        assert_eq!(r.tenants(), vec!["fast".to_string()]);
        drop(held);
        assert_eq!(r.get_store(Some("slow")).unwrap().tenant_id(), "slow");
    }

    #[test]
    fn closed_router_refuses_new_stores() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(dir.path());
        let a = r.get_store(Some("A")).unwrap();
        r.close_all().unwrap();
        assert!(matches!(a.add_fact("Fire hot."), Err(Error::Storage(_))));
        assert!(matches!(r.get_store(Some("A")), Err(Error::Storage(_))));
        assert_eq!(r.tenant_count(), 0);
    }

    #[test]
    fn missing_tenant_routes_to_dm() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(dir.path());
        let dm = r.get_store(None).unwrap();
        assert_eq!(dm.tenant_id(), DM_TENANT);
        assert!(Arc::ptr_eq(&dm, &r.get_store(Some("  ")).unwrap()));
    }

    #[test]
    fn rejects_path_like_tenant_ids() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(dir.path());
        assert!(matches!(r.get_store(Some("../escape")), Err(Error::Validation(_))));
        assert!(matches!(r.get_store(Some("..")), Err(Error::Validation(_))));
    }

    #[test]
    fn tenants_are_isolated_and_survive_close() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(dir.path());
        r.get_store(Some("A")).unwrap().add_fact("Grug hunt mammoth.").unwrap();
        assert!(r.get_store(Some("B")).unwrap().search_facts("Grug hunt mammoth.", 5).is_empty());
        assert_eq!(r.tenants(), vec!["A".to_string(), "B".to_string()]);
        assert_eq!(r.stats()[0].store.fact_count, 1);

        r.close_all().unwrap();
        assert_eq!(r.tenant_count(), 0);

        let reopened = router(dir.path());
        assert_eq!(
            reopened.get_store(Some("A")).unwrap().get_all_facts(),
            vec!["Grug hunt mammoth.".to_string()]
        );
    }
}
