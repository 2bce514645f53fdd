//! Chat platform seam. A real gateway client implements [`ChatPlatform`]; the
//! in-process [`LoopbackPlatform`] stands in for it in the operator binary and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::instance::InstanceSnapshot;

#[async_trait]
pub trait ChatSession: Send + Sync {
    /// Resolves once the session is connected and able to serve.
    async fn wait_ready(&self) -> Result<()>;

    /// Drive the session until `cancel` fires or the connection is lost.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_alive(&self) -> bool;

    fn guild_count(&self) -> usize;

    fn latency(&self) -> Option<Duration>;
}

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn open_session(&self, snapshot: Arc<InstanceSnapshot>) -> Result<Arc<dyn ChatSession>>;
}

/// How a loopback session misbehaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionBehavior {
    #[default]
    Healthy,
    RejectLogin,
    NeverReady,
    HangOnClose,
    PanicOnRun,
    /// `run` never returns, cancelled or not.
    IgnoreCancel,
}

#[derive(Default)]
pub struct LoopbackPlatform {
    behaviors: Mutex<HashMap<String, SessionBehavior>>,
    sessions: Mutex<HashMap<String, Arc<LoopbackSession>>>,
    opened: AtomicUsize,
}

impl LoopbackPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behavior for sessions opened after this call.
    pub fn set_behavior(&self, instance_id: &str, behavior: SessionBehavior) {
        self.behaviors.lock().insert(instance_id.to_string(), behavior);
    }

    /// Most recent session opened for the instance.
    pub fn session(&self, instance_id: &str) -> Option<Arc<LoopbackSession>> {
        self.sessions.lock().get(instance_id).cloned()
    }

    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Drop the instance's connection from the outside, as a gateway outage would.
    pub fn kill(&self, instance_id: &str) -> bool {
        match self.session(instance_id) {
            Some(session) => {
                session.kill();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ChatPlatform for LoopbackPlatform {
    async fn open_session(&self, snapshot: Arc<InstanceSnapshot>) -> Result<Arc<dyn ChatSession>> {
        let behavior = self
            .behaviors
            .lock()
            .get(&snapshot.instance_id)
            .copied()
            .unwrap_or_default();
        if behavior == SessionBehavior::RejectLogin || snapshot.credential.trim().is_empty() {
            warn!(instance_id = %snapshot.instance_id, "loopback login rejected");
            return Err(Error::Upstream("login rejected: improper token".into()));
        }
        let session = Arc::new(LoopbackSession {
            instance_id: snapshot.instance_id.clone(),
            behavior,
            alive: AtomicBool::new(true),
            lost: CancellationToken::new(),
            guilds: AtomicUsize::new(0),
        });
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().insert(snapshot.instance_id.clone(), session.clone());
        info!(instance_id = %snapshot.instance_id, name = %snapshot.name, "loopback session opened");
        Ok(session as Arc<dyn ChatSession>)
    }
}

pub struct LoopbackSession {
    instance_id: String,
    behavior: SessionBehavior,
    alive: AtomicBool,
    lost: CancellationToken,
    guilds: AtomicUsize,
}

impl LoopbackSession {
    pub fn kill(&self) {
        warn!(instance_id = %self.instance_id, "loopback connection lost");
        self.alive.store(false, Ordering::SeqCst);
        self.lost.cancel();
    }

    pub fn set_guild_count(&self, n: usize) {
        self.guilds.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatSession for LoopbackSession {
    async fn wait_ready(&self) -> Result<()> {
        if self.behavior == SessionBehavior::NeverReady {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        match self.behavior {
            SessionBehavior::PanicOnRun => panic!("loopback session for {} crashed", self.instance_id),
            SessionBehavior::IgnoreCancel => std::future::pending::<()>().await,
            _ => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(instance_id = %self.instance_id, "loopback session cancelled");
                Ok(())
            }
            _ = self.lost.cancelled() => {
                Err(Error::Upstream("connection lost".into()))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.behavior == SessionBehavior::HangOnClose {
            std::future::pending::<()>().await;
        }
        self.alive.store(false, Ordering::SeqCst);
        debug!(instance_id = %self.instance_id, "loopback session closed");
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.lost.is_cancelled()
    }

    fn guild_count(&self) -> usize {
        self.guilds.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Option<Duration> {
        self.is_alive().then_some(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::builtin_templates;
    use crate::instance::InstanceConfig;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn snapshot(credential: &str) -> Arc<InstanceSnapshot> {
        let cfg = InstanceConfig::new("Grug", "main", "pure_grug", BTreeMap::new()).unwrap();
        let template = builtin_templates().remove("pure_grug").unwrap();
        Arc::new(InstanceSnapshot::build(&cfg, &BTreeMap::new(), &template, credential.into(), Path::new("/tmp")))
    }

    #[tokio::test]
    async fn kill_ends_run_and_liveness() {
        let platform = LoopbackPlatform::new();
        let snap = snapshot("tok");
        let session = platform.open_session(snap.clone()).await.unwrap();
        session.wait_ready().await.unwrap();
        assert!(session.is_alive());

        let s = session.clone();
        let run = tokio::spawn(async move { s.run(CancellationToken::new()).await });
        assert!(platform.kill(&snap.instance_id));
        assert!(matches!(run.await.unwrap(), Err(Error::Upstream(_))));
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn cancel_ends_run_cleanly() {
        let platform = LoopbackPlatform::new();
        let session = platform.open_session(snapshot("tok")).await.unwrap();
        let cancel = CancellationToken::new();
        let s = session.clone();
        let c = cancel.clone();
        let run = tokio::spawn(async move { s.run(c).await });
        cancel.cancel();
        assert!(run.await.unwrap().is_ok());
        session.close().await.unwrap();
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn empty_credential_is_rejected() {
        let platform = LoopbackPlatform::new();
        assert!(matches!(platform.open_session(snapshot(" ")).await, Err(Error::Upstream(_))));
        assert_eq!(platform.opened_count(), 0);
    }
}
