use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use aria_events::{Bus, EmitReport, Envelope, SubscriptionId};
use aria_kernel::{CacheEntry, Kernel, StoreError};
use aria_topics as topics;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::capability::CapabilityLifecycle;
use crate::config::HubConfig;
use crate::modules::{Module, ModuleRegistry, ModuleStatus, RegistryError};
use crate::pipeline::Pipeline;
use crate::shadow::ShadowEngine;
use crate::tasks::{Scheduler, TaskAction};

struct Inner {
    config: Arc<HubConfig>,
    kernel: Kernel,
    bus: Bus,
    registry: ModuleRegistry,
    scheduler: Scheduler,
    capabilities: CapabilityLifecycle,
    shadow: ShadowEngine,
    pipeline: Pipeline,
}

/// Owned supervisor for the store, bus, modules and background tasks.
/// Cheap to clone; every clone refers to the same hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

impl Hub {
    pub fn new(config: Arc<HubConfig>, kernel: Kernel, bus: Bus) -> Self {
        let shadow = ShadowEngine::new(
            kernel.clone(),
            bus.clone(),
            config.shadow.default_window_seconds,
        );
        let pipeline = Pipeline::new(kernel.clone(), bus.clone(), config.pipeline.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                kernel,
                bus,
                registry: ModuleRegistry::new(),
                scheduler: Scheduler::new(),
                capabilities: CapabilityLifecycle::new(),
                shadow,
                pipeline,
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn kernel(&self) -> &Kernel {
        &self.inner.kernel
    }

    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.inner.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn capabilities(&self) -> &CapabilityLifecycle {
        &self.inner.capabilities
    }

    pub fn shadow(&self) -> &ShadowEngine {
        &self.inner.shadow
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    // ---------- Cache ----------

    pub async fn get_cache(&self, category: &str) -> Result<Option<CacheEntry>, StoreError> {
        self.inner.kernel.get_async(category).await
    }

    /// Write a category and notify dependents with `cache_updated`.
    pub async fn set_cache(
        &self,
        category: &str,
        data: Value,
        metadata: Option<Value>,
    ) -> Result<i64, StoreError> {
        let version = self.store_cache(category, data, metadata).await?;
        self.notify_cache_updated(category, version).await;
        Ok(version)
    }

    /// Persist without notifying. Callers holding a lock that subscribers
    /// may take release it before [`Hub::notify_cache_updated`].
    pub(crate) async fn store_cache(
        &self,
        category: &str,
        data: Value,
        metadata: Option<Value>,
    ) -> Result<i64, StoreError> {
        self.inner.kernel.set_async(category, data, metadata).await
    }

    pub(crate) async fn notify_cache_updated(&self, category: &str, version: i64) {
        self.emit(
            topics::TOPIC_CACHE_UPDATED,
            &json!({"category": category, "version": version}),
        )
        .await;
    }

    pub async fn delete_cache(&self, category: &str) -> Result<bool, StoreError> {
        let removed = self.inner.kernel.delete_async(category).await?;
        if removed {
            self.emit(topics::TOPIC_CACHE_DELETED, &json!({"category": category}))
                .await;
        }
        Ok(removed)
    }

    // ---------- Modules ----------

    pub fn register_module(&self, module: Arc<dyn Module>) -> Result<(), RegistryError> {
        let name = module.name().to_string();
        self.inner.registry.register(module)?;
        info!(module = %name, "module registered");
        self.inner
            .bus
            .publish(topics::TOPIC_MODULE_REGISTERED, &json!({"module": name}));
        Ok(())
    }

    pub fn module_as<T: Module>(&self, name: &str) -> Option<Arc<T>> {
        self.inner.registry.get_as::<T>(name)
    }

    /// Initialize registered modules in order. A module whose initialization
    /// errors or panics is marked failed; the rest still start.
    pub async fn initialize_all(&self) {
        for module in self.inner.registry.with_status(ModuleStatus::Registered) {
            let name = module.name().to_string();
            self.inner
                .registry
                .set_status(&name, ModuleStatus::Initializing);
            let result = AssertUnwindSafe(module.initialize(self))
                .catch_unwind()
                .await;
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(_) => Some("initialization panicked".to_string()),
            };
            match failure {
                None => {
                    self.inner.registry.set_status(&name, ModuleStatus::Running);
                    info!(module = %name, "module running");
                    self.inner
                        .bus
                        .publish(topics::TOPIC_MODULE_RUNNING, &json!({"module": name}));
                }
                Some(reason) => {
                    self.inner.registry.set_status(&name, ModuleStatus::Failed);
                    error!(module = %name, error = %reason, "module initialization failed");
                    self.inner.bus.publish(
                        topics::TOPIC_MODULE_FAILED,
                        &json!({"module": name, "error": reason}),
                    );
                }
            }
        }
    }

    // ---------- Tasks ----------

    /// Schedule a recurring task owned by `owner`. Re-using a task id
    /// replaces the previous schedule.
    pub fn schedule_task(
        &self,
        owner: &str,
        task_id: &str,
        interval: Duration,
        run_immediately: bool,
        action: TaskAction,
    ) {
        self.inner
            .scheduler
            .schedule(task_id, interval, run_immediately, action);
        self.inner.registry.attach_task(owner, task_id);
    }

    // ---------- Events ----------

    pub fn subscribe<F, Fut>(&self, kind: &str, f: F) -> SubscriptionId
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.bus.subscribe_fn(kind, f)
    }

    /// Deliver to bus subscribers, then to every running module. Failures in
    /// any receiver are logged and counted, never returned.
    pub async fn emit<T: Serialize>(&self, kind: &str, payload: &T) -> EmitReport {
        let mut report = self.inner.bus.emit(kind, payload).await;
        let env = Envelope::new(kind, serde_json::to_value(payload).unwrap_or(Value::Null));
        for module in self.inner.registry.with_status(ModuleStatus::Running) {
            let result = AssertUnwindSafe(module.on_event(self, &env))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(module = module.name(), kind, error = %err, "module event handler failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(module = module.name(), kind, "module event handler panicked");
                }
            }
        }
        report
    }

    // ---------- Shutdown ----------

    /// Stop background tasks (waiting up to `grace`), shut modules down in
    /// reverse registration order, then close the store.
    pub async fn shutdown(&self, grace: Duration) {
        info!("shutting down background tasks");
        self.inner.scheduler.shutdown_with_grace(grace).await;
        let mut modules = self.inner.registry.modules();
        modules.reverse();
        for module in modules {
            if let Err(err) = module.shutdown().await {
                warn!(module = module.name(), error = %err, "module shutdown failed");
            }
        }
        self.inner.kernel.close();
        info!("hub shutdown complete");
    }
}
