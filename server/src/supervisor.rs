//! Instance registry and lifecycle driver.
//!
//! Every instance owns a slot with three locks: the mirrored config, the live
//! handle, and an async lifecycle lock that makes start/stop/restart/delete on
//! one id single-flight. Different ids never share a lifecycle lock.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{fingerprint, Cooldowns, ResponseCache};
use crate::config::Config;
use crate::config_store::ConfigStore;
use crate::embeddings::{Embedder, HashingEmbedder};
use crate::error::{Error, Result};
use crate::generation::{
    build_prompt, clean_statement, fallback_reply, BackendFactory, FallbackKind, GenerationChain,
    MIN_STATEMENT_CHARS,
};
use crate::instance::{InstanceConfig, InstanceReport, InstanceSnapshot, InstanceStatus};
use crate::knowledge::{KnowledgeStore, StoreOptions};
use crate::now_ms;
use crate::platform::{ChatPlatform, ChatSession};
use crate::tenant::{TenantRouter, TenantStats};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub data_root: PathBuf,
    pub monitor_interval: Duration,
    pub monitor_error_backoff: Duration,
    pub start_timeout: Duration,
    pub stop_grace: Duration,
    pub restart_pause: Duration,
    pub start_stagger: Duration,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub user_cooldown: Duration,
}

impl SupervisorSettings {
    pub fn new(data_root: &Path) -> Self {
        Self::from_config(&Config { data_dir: data_root.to_path_buf(), ..Config::default() })
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self {
            data_root: cfg.data_dir.clone(),
            monitor_interval: cfg.monitor_interval,
            monitor_error_backoff: cfg.monitor_error_backoff,
            start_timeout: cfg.start_timeout,
            stop_grace: cfg.stop_grace,
            restart_pause: cfg.restart_pause,
            start_stagger: cfg.start_stagger,
            cache_capacity: cfg.cache_capacity,
            cache_ttl: cfg.cache_ttl,
            user_cooldown: cfg.user_cooldown,
        }
    }
}

/// Partial edit of an instance; `None` leaves a field as is. Applies at next start.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceUpdate {
    pub name: Option<String>,
    pub credential_ref: Option<String>,
    pub template_id: Option<String>,
    pub overrides: Option<BTreeMap<String, String>>,
    pub auto_start: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    Generated,
    Cached,
    Fallback,
    RateLimited,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub text: String,
    pub source: ReplySource,
}

/// Live resources of a running instance.
struct InstanceHandle {
    snapshot: Arc<InstanceSnapshot>,
    session: Arc<dyn ChatSession>,
    router: Arc<TenantRouter>,
    cache: Arc<ResponseCache>,
    generation: GenerationChain,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    // set by the session task before it reports an unexpected exit
    exited: Arc<AtomicBool>,
    started_at: i64,
    last_heartbeat: AtomicI64,
}

impl InstanceHandle {
    fn is_healthy(&self) -> bool {
        let task_running = self.task.lock().as_ref().map(|t| !t.is_finished()).unwrap_or(false);
        task_running && !self.exited.load(Ordering::SeqCst) && self.session.is_alive()
    }
}

struct Slot {
    config: Mutex<InstanceConfig>,
    live: Mutex<Option<Arc<InstanceHandle>>>,
    lifecycle: tokio::sync::Mutex<()>,
    removed: AtomicBool,
}

impl Slot {
    fn new(cfg: InstanceConfig) -> Self {
        Self {
            config: Mutex::new(cfg),
            live: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            removed: AtomicBool::new(false),
        }
    }

    fn id(&self) -> String {
        self.config.lock().id.clone()
    }

    fn status(&self) -> InstanceStatus {
        self.config.lock().status
    }

    fn live(&self) -> Option<Arc<InstanceHandle>> {
        self.live.lock().clone()
    }
}

/// Write the status through to the store, then the mirror. Status writes never
/// fail a lifecycle operation; a failed persist is logged.
fn record_status(store: &dyn ConfigStore, slot: &Slot, status: InstanceStatus, last_error: Option<String>) {
    let mut cfg = slot.config.lock();
    if cfg.status != status && !cfg.status.can_transition_to(status) {
        warn!(instance_id = %cfg.id, from = %cfg.status, to = %status, "unexpected status transition");
    }
    let mut next = cfg.clone();
    next.status = status;
    match (status, last_error) {
        (_, Some(err)) => next.last_error = Some(err),
        (InstanceStatus::Running | InstanceStatus::Stopped, None) => next.last_error = None,
        _ => {}
    }
    if let Err(err) = store.save_instance_config(&next) {
        error!(instance_id = %next.id, %err, "failed to persist instance status");
    }
    debug!(instance_id = %next.id, status = %status, "status changed");
    *cfg = next;
}

pub struct Supervisor {
    settings: SupervisorSettings,
    store: Arc<dyn ConfigStore>,
    platform: Arc<dyn ChatPlatform>,
    backends: Arc<dyn BackendFactory>,
    embedder: Arc<dyn Embedder>,
    registry: RwLock<HashMap<String, Arc<Slot>>>,
    cooldowns: Cooldowns,
    resume: Mutex<Vec<String>>,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        store: Arc<dyn ConfigStore>,
        platform: Arc<dyn ChatPlatform>,
        backends: Arc<dyn BackendFactory>,
    ) -> Self {
        let cooldowns = Cooldowns::new(settings.user_cooldown);
        Self {
            settings,
            store,
            platform,
            backends,
            embedder: Arc::new(HashingEmbedder::default()),
            registry: RwLock::new(HashMap::new()),
            cooldowns,
            resume: Mutex::new(Vec::new()),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Mirror the store into the registry. Instances persisted as live are
    /// reset to `stopped` and queued for [`Supervisor::start_configured`].
    pub fn load(&self) -> Result<usize> {
        let configs = self.store.get_instance_configs()?;
        let mut registry = self.registry.write();
        let mut resume = self.resume.lock();
        for (id, mut cfg) in configs {
            if registry.contains_key(&id) {
                continue;
            }
            if matches!(
                cfg.status,
                InstanceStatus::Running | InstanceStatus::Starting | InstanceStatus::Stopping
            ) {
                if cfg.status == InstanceStatus::Running {
                    resume.push(id.clone());
                }
                cfg.status = InstanceStatus::Stopped;
                if let Err(err) = self.store.save_instance_config(&cfg) {
                    error!(instance_id = %id, %err, "failed to reset persisted status");
                }
            }
            registry.insert(id, Arc::new(Slot::new(cfg)));
        }
        info!(instances = registry.len(), "instance registry loaded");
        Ok(registry.len())
    }

    pub fn create(
        &self,
        name: &str,
        credential_ref: &str,
        template_id: &str,
        overrides: BTreeMap<String, String>,
    ) -> Result<String> {
        let cfg = InstanceConfig::new(name, credential_ref, template_id, overrides)?;
        self.check_template(&cfg.template_id)?;
        self.store.save_instance_config(&cfg)?;
        let id = cfg.id.clone();
        self.registry.write().insert(id.clone(), Arc::new(Slot::new(cfg)));
        info!(instance_id = %id, name, template = template_id, "created instance");
        Ok(id)
    }

    pub fn update(&self, id: &str, update: InstanceUpdate) -> Result<InstanceConfig> {
        let slot = self.slot(id)?;
        let mut cfg = slot.config.lock();
        let mut next = cfg.clone();
        if let Some(name) = update.name {
            next.name = name.trim().to_string();
        }
        if let Some(credential_ref) = update.credential_ref {
            next.credential_ref = credential_ref.trim().to_string();
        }
        if let Some(template_id) = update.template_id {
            next.template_id = template_id.trim().to_string();
            self.check_template(&next.template_id)?;
        }
        if let Some(overrides) = update.overrides {
            next.overrides = overrides;
        }
        if let Some(auto_start) = update.auto_start {
            next.auto_start = auto_start;
        }
        next.validate()?;
        self.store.save_instance_config(&next)?;
        *cfg = next.clone();
        info!(instance_id = %id, "updated instance");
        Ok(next)
    }

    /// `Ok(true)` when the instance is running afterwards. A failed start leaves
    /// the instance in `error` and returns `Ok(false)`.
    pub async fn start(&self, id: &str) -> Result<bool> {
        let slot = self.slot(id)?;
        let _flight = slot.lifecycle.lock().await;
        self.start_locked(&slot).await
    }

    pub async fn stop(&self, id: &str) -> Result<bool> {
        let slot = self.slot(id)?;
        let _flight = slot.lifecycle.lock().await;
        self.stop_locked(&slot).await
    }

    pub async fn restart(&self, id: &str) -> Result<bool> {
        let slot = self.slot(id)?;
        let _flight = slot.lifecycle.lock().await;
        info!(instance_id = %id, "restarting instance");
        self.stop_locked(&slot).await?;
        sleep(self.settings.restart_pause).await;
        self.start_locked(&slot).await
    }

    /// Stop if running, then remove from the store and the registry.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let slot = self.slot(id)?;
        let _flight = slot.lifecycle.lock().await;
        if slot.removed.load(Ordering::SeqCst) {
            return Err(Error::not_found("instance", id));
        }
        self.stop_locked(&slot).await?;
        self.store.delete_instance_config(id)?;
        slot.removed.store(true, Ordering::SeqCst);
        self.registry.write().remove(id);
        info!(instance_id = %id, "deleted instance");
        Ok(())
    }

    pub fn status(&self, id: &str) -> Option<InstanceReport> {
        let slot = self.registry.read().get(id).cloned()?;
        Some(report(&slot))
    }

    pub fn list(&self) -> Vec<InstanceReport> {
        let slots: Vec<Arc<Slot>> = self.registry.read().values().cloned().collect();
        let mut reports: Vec<InstanceReport> = slots.iter().map(|s| report(s)).collect();
        reports.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        reports
    }

    /// Snapshot the running instance was started with.
    pub fn snapshot(&self, id: &str) -> Option<Arc<InstanceSnapshot>> {
        let slot = self.registry.read().get(id).cloned()?;
        slot.live().map(|h| h.snapshot.clone())
    }

    /// Start every auto-start instance and every instance that was running at
    /// the last shutdown, one at a time with a stagger between them.
    pub async fn start_configured(&self) -> usize {
        let mut ids: Vec<String> = self.resume.lock().drain(..).collect();
        {
            let registry = self.registry.read();
            let mut auto: Vec<String> = registry
                .iter()
                .filter(|(_, slot)| slot.config.lock().auto_start)
                .map(|(id, _)| id.clone())
                .collect();
            auto.sort();
            for id in auto {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        let mut started = 0;
        for (n, id) in ids.iter().enumerate() {
            if n > 0 {
                sleep(self.settings.start_stagger).await;
            }
            match self.start(id).await {
                Ok(true) => started += 1,
                Ok(false) => warn!(instance_id = %id, "auto-start failed"),
                Err(err) => warn!(instance_id = %id, %err, "auto-start skipped"),
            }
        }
        info!(started, requested = ids.len(), "configured instances started");
        started
    }

    /// Stop every live instance in parallel.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self
            .registry
            .read()
            .iter()
            .filter(|(_, slot)| slot.live().is_some())
            .map(|(id, _)| id.clone())
            .collect();
        info!(instances = ids.len(), "stopping all instances");
        let results = join_all(ids.iter().map(|id| self.stop(id))).await;
        for (id, res) in ids.iter().zip(results) {
            if let Err(err) = res {
                error!(instance_id = %id, %err, "error stopping instance");
            }
        }
    }

    /// One health pass over every live instance. Returns how many were restarted.
    pub async fn monitor_once(&self) -> usize {
        let slots: Vec<(String, Arc<Slot>)> =
            self.registry.read().iter().map(|(id, s)| (id.clone(), s.clone())).collect();
        let mut restarted = 0;
        for (id, slot) in slots {
            match AssertUnwindSafe(self.check_instance(&id, &slot)).catch_unwind().await {
                Ok(true) => restarted += 1,
                Ok(false) => {}
                Err(_) => error!(instance_id = %id, "instance health check panicked"),
            }
        }
        self.cooldowns.prune();
        restarted
    }

    /// Poll forever until `shutdown` fires. A panicking pass backs off longer.
    pub async fn monitor_loop(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_ms = self.settings.monitor_interval.as_millis() as u64, "monitor loop started");
        let mut delay = self.settings.monitor_interval;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
            delay = match AssertUnwindSafe(self.monitor_once()).catch_unwind().await {
                Ok(restarted) => {
                    if restarted > 0 {
                        info!(restarted, "monitor restarted instances");
                    }
                    self.settings.monitor_interval
                }
                Err(_) => {
                    error!("monitor pass failed");
                    self.settings.monitor_error_backoff
                }
            };
        }
        info!("monitor loop stopped");
    }

    /// Run `f` against the tenant's store on the blocking pool. Opening a store
    /// can rebuild its index, so the lookup happens there too.
    async fn with_store<T, F>(&self, id: &str, tenant: Option<&str>, f: F) -> Result<T>
    where
        F: FnOnce(&KnowledgeStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let router = self.live_handle(id)?.router.clone();
        let tenant = tenant.map(str::to_string);
        blocking(move || {
            let store = router.get_store(tenant.as_deref())?;
            f(&store)
        })
        .await?
    }

    pub async fn knowledge(&self, id: &str, tenant: Option<&str>) -> Result<Arc<KnowledgeStore>> {
        let router = self.live_handle(id)?.router.clone();
        let tenant = tenant.map(str::to_string);
        blocking(move || router.get_store(tenant.as_deref())).await?
    }

    pub async fn add_fact(&self, id: &str, tenant: Option<&str>, text: &str) -> Result<bool> {
        let text = text.to_string();
        self.with_store(id, tenant, move |store| store.add_fact(&text)).await
    }

    pub async fn search_facts(&self, id: &str, tenant: Option<&str>, query: &str, k: usize) -> Result<Vec<String>> {
        let query = query.to_string();
        self.with_store(id, tenant, move |store| Ok(store.search_facts(&query, k))).await
    }

    pub async fn get_all_facts(&self, id: &str, tenant: Option<&str>) -> Result<Vec<String>> {
        self.with_store(id, tenant, |store| Ok(store.get_all_facts())).await
    }

    pub async fn rebuild_index(&self, id: &str, tenant: Option<&str>) -> Result<usize> {
        self.with_store(id, tenant, |store| store.rebuild_index()).await
    }

    pub async fn import_lore(&self, id: &str, tenant: Option<&str>, path: &Path) -> Result<usize> {
        let path = path.to_path_buf();
        self.with_store(id, tenant, move |store| store.import_lore_file(&path)).await
    }

    pub fn tenant_stats(&self, id: &str) -> Result<Vec<TenantStats>> {
        Ok(self.live_handle(id)?.router.stats())
    }

    /// Answer a chat statement for `user` in `tenant`. Upstream trouble turns
    /// into a fallback reply rather than an error.
    pub async fn respond(&self, id: &str, tenant: Option<&str>, user_id: &str, statement: &str) -> Result<Reply> {
        let handle = self.live_handle(id)?;
        let personality = handle.snapshot.personality.clone();
        let fallback = |kind: FallbackKind| Reply {
            text: fallback_reply(personality.as_deref(), kind).to_string(),
            source: if kind == FallbackKind::RateLimited { ReplySource::RateLimited } else { ReplySource::Fallback },
        };

        let statement = clean_statement(statement);
        if statement.chars().count() < MIN_STATEMENT_CHARS {
            return Ok(fallback(FallbackKind::TooShort));
        }
        if !self.cooldowns.try_acquire(user_id, id) {
            debug!(instance_id = %id, user_id, "user on cooldown");
            return Ok(fallback(FallbackKind::RateLimited));
        }
        let key = fingerprint(id, &statement);
        if let Some(text) = handle.cache.get(&key) {
            info!(instance_id = %id, cache_key = %key, "using cached response");
            return Ok(Reply { text, source: ReplySource::Cached });
        }

        let router = handle.router.clone();
        let tenant = tenant.map(str::to_string);
        let lookup = statement.clone();
        let found = blocking(move || {
            router.get_store(tenant.as_deref()).map(|store| store.search_facts(&lookup, 1))
        })
        .await;
        let lore = match found {
            Ok(found) => found?,
            Err(err) => {
                warn!(instance_id = %id, %err, "lore lookup failed");
                Vec::new()
            }
        };
        let prompt = build_prompt(&statement, personality.as_deref(), &lore);
        match handle.generation.generate(&prompt).await {
            Ok(text) => {
                handle.cache.put(&key, text.clone());
                Ok(Reply { text, source: ReplySource::Generated })
            }
            Err(err) => {
                warn!(instance_id = %id, %err, "generation failed, sending fallback");
                Ok(fallback(FallbackKind::Unavailable))
            }
        }
    }

    fn slot(&self, id: &str) -> Result<Arc<Slot>> {
        self.registry.read().get(id).cloned().ok_or_else(|| Error::not_found("instance", id))
    }

    fn live_handle(&self, id: &str) -> Result<Arc<InstanceHandle>> {
        self.slot(id)?
            .live()
            .ok_or_else(|| Error::Lifecycle(format!("instance {id} is not running")))
    }

    fn check_template(&self, template_id: &str) -> Result<()> {
        match self.store.resolve_template(template_id) {
            Ok(_) => Ok(()),
            Err(Error::NotFound { .. }) => Err(Error::Validation(format!("unknown template: {template_id}"))),
            Err(err) => Err(err),
        }
    }

    async fn check_instance(&self, id: &str, slot: &Arc<Slot>) -> bool {
        let Some(handle) = slot.live() else {
            return false;
        };
        handle.cache.prune();
        if handle.is_healthy() {
            handle.last_heartbeat.store(now_ms(), Ordering::SeqCst);
            return false;
        }
        warn!(instance_id = %id, "instance not alive, restarting");
        match self.recover(id, slot, &handle).await {
            Ok(true) => true,
            Ok(false) => false,
            Err(err) => {
                error!(instance_id = %id, %err, "restart failed");
                false
            }
        }
    }

    /// Restart on behalf of the monitor, but only if `stale` is still the live
    /// handle once the lifecycle lock is held. An operator stop, restart or
    /// delete that ran in between wins.
    async fn recover(&self, id: &str, slot: &Arc<Slot>, stale: &Arc<InstanceHandle>) -> Result<bool> {
        let _flight = slot.lifecycle.lock().await;
        let unchanged = slot.live().is_some_and(|current| Arc::ptr_eq(&current, stale));
        let status = slot.status();
        if slot.removed.load(Ordering::SeqCst)
            || !unchanged
            || !matches!(status, InstanceStatus::Running | InstanceStatus::Error)
        {
            debug!(instance_id = %id, status = %status, "instance changed since health check, not restarting");
            return Ok(false);
        }
        if status != InstanceStatus::Error {
            record_status(self.store.as_ref(), slot, InstanceStatus::Error, Some("session not alive".into()));
        }
        self.stop_locked(slot).await?;
        sleep(self.settings.restart_pause).await;
        let started = self.start_locked(slot).await?;
        if !started {
            warn!(instance_id = %id, "restart did not bring instance up");
        }
        Ok(started)
    }

    async fn start_locked(&self, slot: &Arc<Slot>) -> Result<bool> {
        let id = slot.id();
        if slot.removed.load(Ordering::SeqCst) {
            return Err(Error::not_found("instance", id));
        }
        if let Some(handle) = slot.live() {
            if slot.status() == InstanceStatus::Running && handle.is_healthy() {
                info!(instance_id = %id, "instance already running");
                return Ok(true);
            }
            warn!(instance_id = %id, status = %slot.status(), "releasing dead session before start");
            self.stop_locked(slot).await?;
        }
        let cfg = slot.config.lock().clone();
        record_status(self.store.as_ref(), slot, InstanceStatus::Starting, None);
        info!(instance_id = %id, name = %cfg.name, "starting instance");

        match AssertUnwindSafe(self.launch(&cfg, slot)).catch_unwind().await {
            Ok(Ok(handle)) => {
                *slot.live.lock() = Some(handle.clone());
                record_status(self.store.as_ref(), slot, InstanceStatus::Running, None);
                if handle.exited.load(Ordering::SeqCst) {
                    // the session died between readiness and now
                    record_status(
                        self.store.as_ref(),
                        slot,
                        InstanceStatus::Error,
                        Some("session exited during start".into()),
                    );
                    return Ok(false);
                }
                info!(instance_id = %id, "instance running");
                Ok(true)
            }
            Ok(Err(err)) => {
                error!(instance_id = %id, %err, "failed to start instance");
                record_status(self.store.as_ref(), slot, InstanceStatus::Error, Some(err.to_string()));
                Ok(false)
            }
            Err(_) => {
                error!(instance_id = %id, "instance start panicked");
                record_status(self.store.as_ref(), slot, InstanceStatus::Error, Some("panic during start".into()));
                Ok(false)
            }
        }
    }

    async fn stop_locked(&self, slot: &Arc<Slot>) -> Result<bool> {
        let id = slot.id();
        let handle = slot.live.lock().take();
        let Some(handle) = handle else {
            if slot.status() == InstanceStatus::Error {
                record_status(self.store.as_ref(), slot, InstanceStatus::Stopped, None);
            }
            debug!(instance_id = %id, "instance not running");
            return Ok(true);
        };
        record_status(self.store.as_ref(), slot, InstanceStatus::Stopping, None);
        info!(instance_id = %id, "stopping instance");
        let clean = self.teardown(&id, &handle).await;
        record_status(self.store.as_ref(), slot, InstanceStatus::Stopped, None);
        if clean {
            info!(instance_id = %id, "instance stopped");
        } else {
            warn!(instance_id = %id, "instance force-stopped");
        }
        Ok(true)
    }

    fn materialize(&self, cfg: &InstanceConfig) -> Result<InstanceSnapshot> {
        let credential = self.store.resolve_credential(&cfg.credential_ref)?;
        let template = self.store.resolve_template(&cfg.template_id)?;
        let defaults = self.store.instance_defaults();
        Ok(InstanceSnapshot::build(cfg, &defaults, &template, credential, &self.settings.data_root))
    }

    async fn launch(&self, cfg: &InstanceConfig, slot: &Arc<Slot>) -> Result<Arc<InstanceHandle>> {
        let snapshot = Arc::new(self.materialize(cfg)?);
        let fresh_dir = !snapshot.data_dir.exists();
        std::fs::create_dir_all(&snapshot.data_dir)?;
        let launched = self.open_and_wait(snapshot.clone(), slot).await;
        if launched.is_err() && fresh_dir {
            // only succeeds while still empty
            let _ = std::fs::remove_dir(&snapshot.data_dir);
        }
        launched
    }

    async fn open_and_wait(&self, snapshot: Arc<InstanceSnapshot>, slot: &Arc<Slot>) -> Result<Arc<InstanceHandle>> {
        let id = snapshot.instance_id.clone();
        let limit = self.settings.start_timeout;
        let session = match timeout(limit, self.platform.open_session(snapshot.clone())).await {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => return Err(Error::Lifecycle(format!("failed to open session: {err}"))),
            Err(_) => return Err(Error::Lifecycle(format!("session did not open within {limit:?}"))),
        };

        let options = StoreOptions { embedder: snapshot.load_embedder.then(|| self.embedder.clone()) };
        if !snapshot.load_embedder {
            info!(instance_id = %id, "similarity index disabled for instance");
        }
        let handle = Arc::new(InstanceHandle {
            router: Arc::new(TenantRouter::new(&id, &snapshot.data_dir, options)),
            cache: Arc::new(ResponseCache::new(self.settings.cache_capacity, self.settings.cache_ttl)),
            generation: GenerationChain::new(self.backends.build(&snapshot)),
            snapshot,
            session: session.clone(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            exited: Arc::new(AtomicBool::new(false)),
            started_at: now_ms(),
            last_heartbeat: AtomicI64::new(now_ms()),
        });
        let task = spawn_session_task(&id, &handle, slot.clone(), self.store.clone());
        *handle.task.lock() = Some(task);

        let ready = match timeout(limit, session.wait_ready()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(Error::Lifecycle(format!("session failed before ready: {err}"))),
            Err(_) => Err(Error::Lifecycle(format!("session not ready within {limit:?}"))),
        };
        match ready {
            Ok(()) => Ok(handle),
            Err(err) => {
                self.teardown(&id, &handle).await;
                Err(err)
            }
        }
    }

    /// Cancel, close, join, release. Each wait is bounded by the stop grace.
    /// Returns false when something had to be forced.
    async fn teardown(&self, id: &str, handle: &InstanceHandle) -> bool {
        let grace = self.settings.stop_grace;
        let mut clean = true;
        handle.cancel.cancel();

        match timeout(grace, handle.session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(instance_id = %id, %err, "session close failed");
                clean = false;
            }
            Err(_) => {
                warn!(instance_id = %id, grace_ms = grace.as_millis() as u64, "session close hung, abandoning it");
                clean = false;
            }
        }

        let task = handle.task.lock().take();
        if let Some(mut task) = task {
            if timeout(grace, &mut task).await.is_err() {
                warn!(instance_id = %id, "session task did not exit, aborting");
                task.abort();
                clean = false;
            }
        }

        let router = handle.router.clone();
        match blocking(move || router.close_all()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) | Err(err) => {
                error!(instance_id = %id, %err, "failed to close tenant stores");
                clean = false;
            }
        }
        handle.cache.clear();
        self.cooldowns.forget_instance(id);
        clean
    }
}

fn spawn_session_task(
    id: &str,
    handle: &InstanceHandle,
    slot: Arc<Slot>,
    store: Arc<dyn ConfigStore>,
) -> JoinHandle<()> {
    let id = id.to_string();
    let session = handle.session.clone();
    let cancel = handle.cancel.clone();
    let exited = handle.exited.clone();
    tokio::spawn(async move {
        let outcome = AssertUnwindSafe(session.run(cancel.clone())).catch_unwind().await;
        if cancel.is_cancelled() {
            debug!(instance_id = %id, "session task finished after cancel");
            return;
        }
        let reason = match outcome {
            Ok(Ok(())) => "session ended unexpectedly".to_string(),
            Ok(Err(err)) => err.to_string(),
            Err(_) => "session task panicked".to_string(),
        };
        error!(instance_id = %id, reason = %reason, "session task exited");
        exited.store(true, Ordering::SeqCst);
        record_status(store.as_ref(), &slot, InstanceStatus::Error, Some(reason));
    })
}

fn report(slot: &Slot) -> InstanceReport {
    let cfg = slot.config.lock().clone();
    let live = slot.live();
    InstanceReport {
        id: cfg.id,
        name: cfg.name,
        template_id: cfg.template_id,
        status: cfg.status,
        auto_start: cfg.auto_start,
        guild_count: live.as_ref().map(|h| h.session.guild_count()),
        tenant_count: live.as_ref().map(|h| h.router.tenant_count()),
        latency_ms: live
            .as_ref()
            .and_then(|h| h.session.latency())
            .map(|d| d.as_millis() as u64),
        last_heartbeat: live.as_ref().map(|h| h.last_heartbeat.load(Ordering::SeqCst)),
        started_at: live.as_ref().map(|h| h.started_at),
        last_error: cfg.last_error,
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Storage(format!("storage worker failed: {e}")))
}
