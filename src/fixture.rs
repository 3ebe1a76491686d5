//! The fixture contract and the `gather` lifecycle.
//!
//! A fixture declares its options statically through
//! [`Fixture::on_visit_test_arguments`] and does its work in
//! [`Fixture::on_gather`]. Callers only ever invoke [`Fixture::gather`], which
//! resolves the namespace, runs `on_gather` and turns instrument failures into
//! failing [`Artifacts`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::Instrument;
use uuid::Uuid;

use crate::artifacts::Artifacts;
use crate::config::{ArgumentSchema, Arguments, ConfigContext, Namespace, Overrides};
use crate::error::{Error, Result};
use crate::manager::{FixtureManager, ManagerShared};
use crate::scheduling;

/// Immutable per-type metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureInfo {
    /// Canonical name, unique within a manager's registry.
    pub name: String,
    /// Prefix applied to every option the fixture declares.
    pub argument_prefix: String,
}

impl FixtureInfo {
    pub fn new(name: impl Into<String>, argument_prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            argument_prefix: argument_prefix.into(),
        }
    }
}

/// A unit that manages and reports on one piece of test apparatus.
///
/// `gather` takes `&mut self`, so one instance can never run concurrently
/// with itself. Use [`SharedFixture`] to share an instance between tasks.
#[async_trait]
pub trait Fixture: Send + 'static {
    /// Canonical name and argument prefix of this type.
    fn info() -> FixtureInfo
    where
        Self: Sized;

    /// Declares this type's options, unprefixed.
    ///
    /// Aggregates call through to the hooks of the fixtures they hold so that
    /// the aggregated options land under the aggregate's prefix.
    fn on_visit_test_arguments(arguments: &mut Arguments<'_>)
    where
        Self: Sized;

    fn core(&self) -> &FixtureCore;

    fn core_mut(&mut self) -> &mut FixtureCore;

    /// Fixture-specific work.
    async fn on_gather(&mut self, namespace: &Namespace) -> Result<Artifacts>;

    /// Resolves configuration, then runs [`on_gather`](Self::on_gather).
    ///
    /// `overrides` are layered over the instance's base arguments with the
    /// highest precedence. Instrument failures and timeouts come back as
    /// failing artifacts; configuration errors and defects are returned.
    async fn gather(&mut self, overrides: Overrides) -> Result<Artifacts> {
        run_gather(self, overrides).await
    }

    /// Canonical name of this instance's type.
    fn name(&self) -> &str {
        &self.core().info().name
    }
}

pub(crate) async fn run_gather<F>(fixture: &mut F, overrides: Overrides) -> Result<Artifacts>
where
    F: Fixture + ?Sized,
{
    let core = fixture.core();
    let name = core.info().name.clone();
    let span = tracing::info_span!("gather", fixture = %name, instance = %core.instance_id());

    async move {
        let (namespace, gather_timeout) = {
            let core = fixture.core();
            (core.resolve(&overrides)?, core.gather_timeout())
        };
        tracing::debug!(options = namespace.len(), "resolved namespace");

        let deadline = scheduling::effective_deadline(gather_timeout);
        let outcome = scheduling::with_deadline(deadline, async {
            match gather_timeout {
                Some(after) => {
                    match tokio::time::timeout(after, fixture.on_gather(&namespace)).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout {
                            fixture: name.clone(),
                            after,
                        }),
                    }
                }
                None => fixture.on_gather(&namespace).await,
            }
        })
        .await;

        match outcome {
            Ok(artifacts) => {
                tracing::info!(result_code = ?artifacts.result_code(), "gather finished");
                Ok(artifacts)
            }
            Err(err) if err.is_instrument_failure() => {
                tracing::warn!(error = %err, "gather failed");
                Ok(Artifacts::from_error(&err))
            }
            Err(err) => {
                tracing::error!(error = %err, "gather aborted");
                Err(err)
            }
        }
    }
    .instrument(span)
    .await
}

/// State every fixture instance carries.
pub struct FixtureCore {
    info: FixtureInfo,
    schema: Arc<ArgumentSchema>,
    manager: Weak<ManagerShared>,
    config: Arc<ConfigContext>,
    base: Overrides,
    gather_timeout: Option<Duration>,
    instance_id: Uuid,
}

impl FixtureCore {
    /// Builds the core of a `T` bound to `manager`, with base arguments.
    pub fn new<T: Fixture>(manager: &FixtureManager, base: Overrides) -> Result<Self> {
        let schema = ArgumentSchema::for_fixture::<T>()?;
        Ok(Self::from_parts(T::info(), Arc::new(schema), manager, base))
    }

    pub(crate) fn from_parts(
        info: FixtureInfo,
        schema: Arc<ArgumentSchema>,
        manager: &FixtureManager,
        base: Overrides,
    ) -> Self {
        Self {
            info,
            schema,
            manager: manager.downgrade(),
            config: manager.config(),
            base,
            gather_timeout: None,
            instance_id: Uuid::new_v4(),
        }
    }

    pub fn info(&self) -> &FixtureInfo {
        &self.info
    }

    pub fn schema(&self) -> &ArgumentSchema {
        &self.schema
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// The manager this fixture was created against.
    pub fn manager(&self) -> Result<FixtureManager> {
        FixtureManager::upgrade(&self.manager)
            .ok_or_else(|| Error::ManagerDropped(self.info.name.clone()))
    }

    pub fn base_overrides(&self) -> &Overrides {
        &self.base
    }

    /// Replaces the arguments every gather starts from.
    pub fn set_base_overrides(&mut self, base: Overrides) {
        self.base = base;
    }

    pub fn gather_timeout(&self) -> Option<Duration> {
        self.gather_timeout
    }

    /// Limits how long `on_gather` may run; `None` removes the limit.
    pub fn set_gather_timeout(&mut self, timeout: Option<Duration>) {
        self.gather_timeout = timeout;
    }

    /// Resolves this fixture's namespace with `overrides` over the base arguments.
    pub fn resolve(&self, overrides: &Overrides) -> Result<Namespace> {
        self.config.resolve(
            &self.info.argument_prefix,
            &self.schema,
            &self.base.merged(overrides),
        )
    }

    /// Sleeps without blocking the scheduler, logging the remaining time.
    pub async fn countdown_sleep(&self, duration: Duration) -> Result<()> {
        scheduling::countdown_sleep(&self.info.name, duration).await
    }
}

impl std::fmt::Debug for FixtureCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureCore")
            .field("info", &self.info)
            .field("instance_id", &self.instance_id)
            .field("gather_timeout", &self.gather_timeout)
            .finish()
    }
}

/// A fixture instance shared between tasks; gathers are serialized.
#[derive(Clone)]
pub struct SharedFixture {
    name: String,
    inner: Arc<tokio::sync::Mutex<Box<dyn Fixture>>>,
}

impl SharedFixture {
    pub fn new(fixture: Box<dyn Fixture>) -> Self {
        Self {
            name: fixture.name().to_string(),
            inner: Arc::new(tokio::sync::Mutex::new(fixture)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for any in-flight gather on this instance, then gathers.
    pub async fn gather(&self, overrides: Overrides) -> Result<Artifacts> {
        let mut fixture = self.inner.lock().await;
        fixture.gather(overrides).await
    }

    /// Exclusive access, e.g. to reset a filter between gathers.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Box<dyn Fixture>> {
        self.inner.lock().await
    }
}

impl std::fmt::Debug for SharedFixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFixture").field("name", &self.name).finish()
    }
}
