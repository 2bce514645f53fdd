//! Persistent instance registry, credentials, and personality templates.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::instance::InstanceConfig;

/// Template an instance is created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSettings {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Forced personality; `None` lets the personality evolve per tenant.
    #[serde(default)]
    pub personality: Option<String>,
    #[serde(default = "default_true")]
    pub load_embedder: bool,
    #[serde(default)]
    pub custom_env: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl TemplateSettings {
    fn builtin(name: &str, description: &str, personality: Option<&str>, load_embedder: bool) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            personality: personality.map(String::from),
            load_embedder,
            custom_env: BTreeMap::new(),
        }
    }
}

pub fn builtin_templates() -> BTreeMap<String, TemplateSettings> {
    let mut ollama = TemplateSettings::builtin("Ollama Bot", "Uses local Ollama for generation", None, true);
    ollama.custom_env.insert("OLLAMA_URLS".into(), "http://localhost:11434".into());
    ollama.custom_env.insert("OLLAMA_MODELS".into(), "llama3.2:3b".into());
    BTreeMap::from([
        (
            "pure_grug".to_string(),
            TemplateSettings::builtin("Pure Grug", "Caveman personality only, no evolution", Some("grug"), true),
        ),
        (
            "pure_big_rob".to_string(),
            TemplateSettings::builtin("Pure Big Rob", "norf FC lad personality only, no evolution", Some("big_rob"), true),
        ),
        (
            "evolution_bot".to_string(),
            TemplateSettings::builtin("Evolution Bot", "Adaptive personality that evolves per server", None, true),
        ),
        (
            "lightweight_grug".to_string(),
            TemplateSettings::builtin("Lightweight Grug", "Grug personality without semantic search", Some("grug"), false),
        ),
        (
            "multi_personality".to_string(),
            TemplateSettings::builtin("Multi-Personality", "Random personality selection per server", None, true),
        ),
        ("ollama_bot".to_string(), ollama),
    ])
}

/// Source of truth for instance configuration. The supervisor writes through
/// every mutation here before updating its in-memory mirror.
pub trait ConfigStore: Send + Sync {
    fn get_instance_configs(&self) -> Result<BTreeMap<String, InstanceConfig>>;

    fn save_instance_config(&self, cfg: &InstanceConfig) -> Result<()>;

    /// `Ok(false)` when no such instance was stored.
    fn delete_instance_config(&self, id: &str) -> Result<bool>;

    fn resolve_credential(&self, reference: &str) -> Result<String>;

    fn resolve_template(&self, template_id: &str) -> Result<TemplateSettings>;

    /// Settings every instance inherits before template and overrides.
    fn instance_defaults(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default)]
    credentials: BTreeMap<String, String>,
    #[serde(default)]
    templates: BTreeMap<String, TemplateSettings>,
    #[serde(default)]
    instances: BTreeMap<String, InstanceConfig>,
}

/// JSON file backed [`ConfigStore`]. Every write rewrites the whole document
/// through a temp file and rename.
pub struct FileConfigStore {
    path: PathBuf,
    doc: Mutex<ConfigDocument>,
}

impl FileConfigStore {
    pub fn open(path: &Path) -> Result<Self> {
        let doc = if path.exists() {
            let raw = std::fs::read(path)?;
            serde_json::from_slice(&raw)
                .map_err(|e| Error::Storage(format!("config file {}: {e}", path.display())))?
        } else {
            info!(path = %path.display(), "config file not found, starting empty");
            ConfigDocument::default()
        };
        Ok(Self { path: path.to_path_buf(), doc: Mutex::new(doc) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_credential(&self, name: &str, secret: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() || name.starts_with("env:") {
            return Err(Error::Validation("credential name must be non-empty and not start with env:".into()));
        }
        if secret.trim().is_empty() {
            return Err(Error::Validation("credential secret is empty".into()));
        }
        let mut doc = self.doc.lock();
        doc.credentials.insert(name.to_string(), secret.to_string());
        self.persist(&doc)?;
        info!(name, "stored credential");
        Ok(())
    }

    pub fn credential_names(&self) -> Vec<String> {
        self.doc.lock().credentials.keys().cloned().collect()
    }

    pub fn set_default(&self, key: &str, value: &str) -> Result<()> {
        let mut doc = self.doc.lock();
        doc.environment.insert(key.to_string(), value.to_string());
        self.persist(&doc)
    }

    /// Built-in templates plus any the file adds. Built-ins are not overridable.
    pub fn templates(&self) -> BTreeMap<String, TemplateSettings> {
        let mut all = self.doc.lock().templates.clone();
        all.extend(builtin_templates());
        all
    }

    fn persist(&self, doc: &ConfigDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(doc)?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    fn get_instance_configs(&self) -> Result<BTreeMap<String, InstanceConfig>> {
        Ok(self.doc.lock().instances.clone())
    }

    fn save_instance_config(&self, cfg: &InstanceConfig) -> Result<()> {
        cfg.validate()?;
        let mut doc = self.doc.lock();
        let previous = doc.instances.insert(cfg.id.clone(), cfg.clone());
        if let Err(err) = self.persist(&doc) {
            // keep memory equal to disk
            match previous {
                Some(prev) => doc.instances.insert(cfg.id.clone(), prev),
                None => doc.instances.remove(&cfg.id),
            };
            return Err(err);
        }
        Ok(())
    }

    fn delete_instance_config(&self, id: &str) -> Result<bool> {
        let mut doc = self.doc.lock();
        let Some(previous) = doc.instances.remove(id) else {
            return Ok(false);
        };
        if let Err(err) = self.persist(&doc) {
            doc.instances.insert(id.to_string(), previous);
            return Err(err);
        }
        Ok(true)
    }

    fn resolve_credential(&self, reference: &str) -> Result<String> {
        let reference = reference.trim();
        let secret = if let Some(var) = reference.strip_prefix("env:") {
            std::env::var(var).map_err(|_| Error::not_found("credential", reference))?
        } else {
            self.doc
                .lock()
                .credentials
                .get(reference)
                .cloned()
                .ok_or_else(|| Error::not_found("credential", reference))?
        };
        if secret.trim().is_empty() {
            warn!(reference, "credential resolved to an empty secret");
            return Err(Error::Validation(format!("credential {reference} is empty")));
        }
        Ok(secret)
    }

    fn resolve_template(&self, template_id: &str) -> Result<TemplateSettings> {
        if let Some(t) = builtin_templates().remove(template_id) {
            return Ok(t);
        }
        self.doc
            .lock()
            .templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| Error::not_found("template", template_id))
    }

    fn instance_defaults(&self) -> BTreeMap<String, String> {
        self.doc.lock().environment.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grugthink_config.json");
        let store = FileConfigStore::open(&path).unwrap();
        let cfg = InstanceConfig::new("Grug", "main", "pure_grug", BTreeMap::new()).unwrap();
        store.save_instance_config(&cfg).unwrap();
        store.set_credential("main", "tok-123").unwrap();

        let reopened = FileConfigStore::open(&path).unwrap();
        assert_eq!(reopened.get_instance_configs().unwrap().get(&cfg.id), Some(&cfg));
        assert_eq!(reopened.resolve_credential("main").unwrap(), "tok-123");
        assert!(reopened.delete_instance_config(&cfg.id).unwrap());
        assert!(!reopened.delete_instance_config(&cfg.id).unwrap());
        assert!(!dir.path().join("grugthink_config.json.tmp").exists());
    }

    #[test]
    fn credentials_resolve_from_environment() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::open(&dir.path().join("c.json")).unwrap();
        std::env::set_var("GRUGTHINK_TEST_TOKEN_CFG", "from-env");
        assert_eq!(store.resolve_credential("env:GRUGTHINK_TEST_TOKEN_CFG").unwrap(), "from-env");
        assert!(matches!(
            store.resolve_credential("env:GRUGTHINK_TEST_TOKEN_MISSING"),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(store.resolve_credential("nope"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn builtin_templates_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::open(&dir.path().join("c.json")).unwrap();
        let light = store.resolve_template("lightweight_grug").unwrap();
        assert!(!light.load_embedder);
        assert_eq!(light.personality.as_deref(), Some("grug"));
        assert_eq!(
            store.resolve_template("ollama_bot").unwrap().custom_env.get("OLLAMA_MODELS").map(String::as_str),
            Some("llama3.2:3b")
        );
        assert!(matches!(store.resolve_template("missing"), Err(Error::NotFound { .. })));
        assert_eq!(store.templates().len(), 6);
    }

    #[test]
    fn invalid_config_is_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::open(&dir.path().join("c.json")).unwrap();
        let mut cfg = InstanceConfig::new("Grug", "main", "pure_grug", BTreeMap::new()).unwrap();
        cfg.name = String::new();
        assert!(matches!(store.save_instance_config(&cfg), Err(Error::Validation(_))));
        assert!(store.get_instance_configs().unwrap().is_empty());
    }
}
