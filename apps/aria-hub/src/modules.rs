use std::any::Any;
use std::sync::Arc;

use aria_events::Envelope;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::hub::Hub;

/// A pluggable hub component. Modules receive the hub on every call instead
/// of holding it, so the hub never ends up owning a cycle through them.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn initialize(self: Arc<Self>, hub: &Hub) -> anyhow::Result<()>;

    async fn on_event(&self, _hub: &Hub, _event: &Envelope) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Registered,
    Initializing,
    Running,
    Failed,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleStatus::Registered => "registered",
            ModuleStatus::Initializing => "initializing",
            ModuleStatus::Running => "running",
            ModuleStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("module already registered: {0}")]
    AlreadyRegistered(String),
}

struct Entry {
    module: Arc<dyn Module>,
    status: ModuleStatus,
    tasks: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub status: ModuleStatus,
    pub tasks: Vec<String>,
}

/// Modules in registration order.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module: Arc<dyn Module>) -> Result<(), RegistryError> {
        let mut guard = self.entries.write();
        let name = module.name().to_string();
        if guard.iter().any(|e| e.module.name() == name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        guard.push(Entry {
            module,
            status: ModuleStatus::Registered,
            tasks: Vec::new(),
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.module.name() == name)
            .map(|e| e.module.clone())
    }

    /// Typed lookup; `None` when absent or of another type.
    pub fn get_as<T: Module>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name)?.into_any().downcast::<T>().ok()
    }

    pub fn status(&self, name: &str) -> Option<ModuleStatus> {
        self.entries
            .read()
            .iter()
            .find(|e| e.module.name() == name)
            .map(|e| e.status)
    }

    pub(crate) fn set_status(&self, name: &str, status: ModuleStatus) {
        if let Some(e) = self
            .entries
            .write()
            .iter_mut()
            .find(|e| e.module.name() == name)
        {
            e.status = status;
        }
    }

    pub(crate) fn attach_task(&self, name: &str, task_id: &str) {
        if let Some(e) = self
            .entries
            .write()
            .iter_mut()
            .find(|e| e.module.name() == name)
        {
            if !e.tasks.iter().any(|t| t == task_id) {
                e.tasks.push(task_id.to_string());
            }
        }
    }

    pub fn modules(&self) -> Vec<Arc<dyn Module>> {
        self.entries.read().iter().map(|e| e.module.clone()).collect()
    }

    pub fn with_status(&self, status: ModuleStatus) -> Vec<Arc<dyn Module>> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.status == status)
            .map(|e| e.module.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ModuleInfo> {
        self.entries
            .read()
            .iter()
            .map(|e| ModuleInfo {
                name: e.module.name().to_string(),
                status: e.status,
                tasks: e.tasks.clone(),
            })
            .collect()
    }
}
