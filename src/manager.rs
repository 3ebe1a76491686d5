//! Run-scoped fixture registry and scheduling context.
//!
//! One [`FixtureManager`] exists per test run. It owns the handle of the
//! runtime every fixture spawns onto, the registry of fixture types, the
//! configuration context, and a bounded pool for blocking instrument I/O.
//! Dropping the last manager handle (or calling [`FixtureManager::shutdown`])
//! aborts every task still running through it.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::builtin::{BarFixture, CmdFixture, FirmwareUpdateFixture};
use crate::config::{ArgumentSchema, ConfigContext, Overrides};
use crate::error::{Error, Result};
use crate::fixture::{Fixture, FixtureCore, FixtureInfo, SharedFixture};
use crate::gather::GatherFixture;

/// Default number of concurrent blocking jobs.
pub const DEFAULT_BLOCKING_LIMIT: usize = 8;

type Factory = Arc<dyn Fn(FixtureCore) -> Box<dyn Fixture> + Send + Sync>;

struct Registration {
    info: FixtureInfo,
    schema: Arc<ArgumentSchema>,
    factory: Factory,
}

pub(crate) struct ManagerShared {
    run_id: Uuid,
    handle: Handle,
    config: Arc<ConfigContext>,
    registry: RwLock<BTreeMap<String, Registration>>,
    tasks: Mutex<Vec<AbortHandle>>,
    blocking: Arc<Semaphore>,
}

impl ManagerShared {
    fn abort_all(&self) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut aborted = 0;
        for task in tasks {
            if !task.is_finished() {
                task.abort();
                aborted += 1;
            }
        }
        aborted
    }
}

impl Drop for ManagerShared {
    fn drop(&mut self) {
        let aborted = self.abort_all();
        if aborted > 0 {
            tracing::warn!(run_id = %self.run_id, aborted, "fixture manager dropped with tasks outstanding");
        }
    }
}

/// Cheaply cloneable handle to the run's shared fixture context.
#[derive(Clone)]
pub struct FixtureManager {
    shared: Arc<ManagerShared>,
}

impl FixtureManager {
    /// Creates a manager on the current tokio runtime.
    pub fn new(config: ConfigContext) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| Error::NoRuntime(e.to_string()))?;
        Ok(Self::with_handle(handle, config))
    }

    /// Creates a manager that spawns onto `handle`.
    pub fn with_handle(handle: Handle, config: ConfigContext) -> Self {
        Self::with_blocking_limit(handle, config, DEFAULT_BLOCKING_LIMIT)
    }

    pub fn with_blocking_limit(handle: Handle, config: ConfigContext, limit: usize) -> Self {
        let run_id = Uuid::new_v4();
        tracing::info!(%run_id, blocking_limit = limit, "created fixture manager");
        Self {
            shared: Arc::new(ManagerShared {
                run_id,
                handle,
                config: Arc::new(config),
                registry: RwLock::new(BTreeMap::new()),
                tasks: Mutex::new(Vec::new()),
                blocking: Arc::new(Semaphore::new(limit.max(1))),
            }),
        }
    }

    /// A manager on the current runtime with the built-in fixtures registered.
    pub fn with_builtins(config: ConfigContext) -> Result<Self> {
        let manager = Self::new(config)?;
        manager.register::<BarFixture>()?;
        manager.register::<CmdFixture>()?;
        manager.register::<GatherFixture>()?;
        manager.register::<FirmwareUpdateFixture>()?;
        Ok(manager)
    }

    pub(crate) fn downgrade(&self) -> Weak<ManagerShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn upgrade(weak: &Weak<ManagerShared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    pub fn run_id(&self) -> Uuid {
        self.shared.run_id
    }

    pub fn config(&self) -> Arc<ConfigContext> {
        self.shared.config.clone()
    }

    /// The runtime handle all fixtures of this run spawn onto.
    pub fn handle(&self) -> &Handle {
        &self.shared.handle
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Registers `T` under its canonical name.
    pub fn register<T>(&self) -> Result<()>
    where
        T: Fixture + From<FixtureCore>,
    {
        self.register_with(<T as From<FixtureCore>>::from)
    }

    /// Registers `T` with a custom constructor.
    pub fn register_with<T, F>(&self, factory: F) -> Result<()>
    where
        T: Fixture,
        F: Fn(FixtureCore) -> T + Send + Sync + 'static,
    {
        let info = T::info();
        let schema = ArgumentSchema::for_fixture::<T>()?;

        let mut registry = self.shared.registry.write();
        if registry.contains_key(&info.name) {
            return Err(Error::DuplicateFixture(info.name));
        }
        tracing::debug!(
            run_id = %self.shared.run_id,
            fixture = %info.name,
            prefix = %info.argument_prefix,
            arguments = schema.len(),
            "registered fixture"
        );
        registry.insert(
            info.name.clone(),
            Registration {
                info,
                schema: Arc::new(schema),
                factory: Arc::new(move |core| Box::new(factory(core)) as Box<dyn Fixture>),
            },
        );
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.shared.registry.read().contains_key(name)
    }

    /// Canonical names of all registered fixtures, sorted.
    pub fn fixture_names(&self) -> Vec<String> {
        self.shared.registry.read().keys().cloned().collect()
    }

    pub fn fixture_info(&self, name: &str) -> Option<FixtureInfo> {
        self.shared.registry.read().get(name).map(|r| r.info.clone())
    }

    /// Instantiates the fixture registered as `name` with base arguments.
    pub fn create(&self, name: &str, base: Overrides) -> Result<Box<dyn Fixture>> {
        let (info, schema, factory) = {
            let registry = self.shared.registry.read();
            let registration = registry
                .get(name)
                .ok_or_else(|| Error::UnknownFixture(name.to_string()))?;
            (
                registration.info.clone(),
                registration.schema.clone(),
                registration.factory.clone(),
            )
        };
        let core = FixtureCore::from_parts(info, schema, self, base);
        tracing::debug!(fixture = %name, instance = %core.instance_id(), "created fixture");
        Ok(factory(core))
    }

    /// Like [`create`](Self::create), wrapped for sharing between tasks.
    pub fn create_shared(&self, name: &str, base: Overrides) -> Result<SharedFixture> {
        Ok(SharedFixture::new(self.create(name, base)?))
    }

    /// Instantiates `T` directly, without going through the registry.
    pub fn instantiate<T>(&self, base: Overrides) -> Result<T>
    where
        T: Fixture + From<FixtureCore>,
    {
        Ok(<T as From<FixtureCore>>::from(FixtureCore::new::<T>(self, base)?))
    }

    /// The union of every registered fixture's options.
    ///
    /// Fails if two fixtures declare the same key incompatibly.
    pub fn argument_schema(&self) -> Result<ArgumentSchema> {
        let mut union = ArgumentSchema::new();
        for registration in self.shared.registry.read().values() {
            union.union(registration.schema.as_ref().clone());
        }
        union.validate().into_result()?;
        Ok(union)
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Spawns `future` on the run's runtime and tracks it for teardown.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = self.shared.handle.spawn(future);
        let mut tasks = self.shared.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle.abort_handle());
        handle
    }

    /// Runs blocking instrument I/O off the scheduler, bounded by the blocking limit.
    pub async fn spawn_blocking<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .shared
            .blocking
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Task(e.to_string()))?;
        self.shared
            .handle
            .spawn_blocking(move || {
                let _permit = permit;
                work()
            })
            .await
            .map_err(|e| Error::Task(format!("blocking task failed: {}", e)))
    }

    /// Number of spawned tasks that have not finished.
    pub fn outstanding_tasks(&self) -> usize {
        self.shared
            .tasks
            .lock()
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Aborts every task still running through this manager.
    pub fn shutdown(&self) {
        let aborted = self.shared.abort_all();
        tracing::info!(run_id = %self.shared.run_id, aborted, "fixture manager shut down");
    }
}

impl std::fmt::Debug for FixtureManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureManager")
            .field("run_id", &self.shared.run_id)
            .field("fixtures", &self.fixture_names())
            .finish()
    }
}
