use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config_store::TemplateSettings;
use crate::error::{Error, Result};
use crate::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Error => "error",
        }
    }

    /// Edges of the lifecycle graph. Self-edges are not transitions.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Error, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Stopping, Error)
                | (Error, Stopping)
                | (Error, Stopped)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted identity and desired state of one instance. The credential is
/// stored by reference only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub name: String,
    pub credential_ref: String,
    pub template_id: String,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl InstanceConfig {
    pub fn new(
        name: &str,
        credential_ref: &str,
        template_id: &str,
        overrides: BTreeMap<String, String>,
    ) -> Result<Self> {
        let cfg = Self {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            credential_ref: credential_ref.trim().to_string(),
            template_id: template_id.trim().to_string(),
            overrides,
            auto_start: false,
            status: InstanceStatus::Stopped,
            created_at: now_ms(),
            last_error: None,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("id is required".into()));
        }
        if self.name.trim().is_empty() {
            return Err(Error::Validation("name is required".into()));
        }
        if self.credential_ref.trim().is_empty() {
            return Err(Error::Validation("credential reference is required".into()));
        }
        if self.template_id.trim().is_empty() {
            return Err(Error::Validation("template is required".into()));
        }
        if let Some(key) = self.overrides.keys().find(|k| k.trim().is_empty()) {
            return Err(Error::Validation(format!("override key {key:?} is empty")));
        }
        Ok(())
    }
}

/// Fully materialized, immutable per-instance configuration, built once at
/// start and shared by everything the instance runs.
#[derive(Clone, PartialEq)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub name: String,
    pub template_id: String,
    pub credential: String,
    pub personality: Option<String>,
    pub load_embedder: bool,
    pub data_dir: PathBuf,
    settings: BTreeMap<String, String>,
}

impl InstanceSnapshot {
    /// Merge order: instance-wide defaults, then template environment, then the
    /// instance's own overrides.
    pub fn build(
        cfg: &InstanceConfig,
        defaults: &BTreeMap<String, String>,
        template: &TemplateSettings,
        credential: String,
        data_root: &Path,
    ) -> Self {
        let mut settings = defaults.clone();
        settings.insert("LOAD_EMBEDDER".into(), template.load_embedder.to_string());
        if let Some(p) = &template.personality {
            settings.insert("FORCE_PERSONALITY".into(), p.clone());
        }
        settings.extend(template.custom_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        settings.extend(cfg.overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let personality = settings.get("FORCE_PERSONALITY").filter(|p| !p.trim().is_empty()).cloned();
        let load_embedder = settings
            .get("LOAD_EMBEDDER")
            .map(|v| parse_flag(v))
            .unwrap_or(template.load_embedder);

        Self {
            instance_id: cfg.id.clone(),
            name: cfg.name.clone(),
            template_id: cfg.template_id.clone(),
            credential,
            personality,
            load_embedder,
            data_dir: data_root.join(&cfg.id),
            settings,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    /// Comma separated setting, trimmed, empties dropped.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
            .unwrap_or_default()
    }

    pub fn settings(&self) -> &BTreeMap<String, String> {
        &self.settings
    }
}

impl fmt::Debug for InstanceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceSnapshot")
            .field("instance_id", &self.instance_id)
            .field("name", &self.name)
            .field("template_id", &self.template_id)
            .field("credential", &"<redacted>")
            .field("personality", &self.personality)
            .field("load_embedder", &self.load_embedder)
            .field("data_dir", &self.data_dir)
            .field("settings", &self.settings.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Read-only view returned by status and list operations.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub id: String,
    pub name: String,
    pub template_id: String,
    pub status: InstanceStatus,
    pub auto_start: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
