//! Concurrent aggregation of fixture invocations.
//!
//! [`gather_all`] fans out every invocation onto the manager's runtime before
//! awaiting any of them, applies one deadline to the whole set, and merges
//! the results into a single [`Artifacts`]. [`GatherFixture`] exposes the same
//! behaviour as a fixture, so gathers can nest.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::artifacts::{result_code, Artifacts, ChildArtifacts};
use crate::config::{ArgKind, ArgumentSpec, Arguments, Namespace, Overrides};
use crate::error::{Error, Result};
use crate::fixture::{run_gather, Fixture, FixtureCore, FixtureInfo, SharedFixture};
use crate::manager::FixtureManager;
use crate::scheduling::{self, TaskGroup};

/// One pending fixture run inside a gather.
pub struct Invocation {
    name: String,
    future: BoxFuture<'static, Result<Artifacts>>,
}

impl Invocation {
    /// Gathers an owned fixture instance.
    pub fn owned(mut fixture: Box<dyn Fixture>, overrides: Overrides) -> Self {
        let name = fixture.name().to_string();
        Self {
            name,
            future: async move { fixture.gather(overrides).await }.boxed(),
        }
    }

    /// Gathers a shared instance; waits for any gather already running on it.
    pub fn shared(fixture: SharedFixture, overrides: Overrides) -> Self {
        let name = fixture.name().to_string();
        Self {
            name,
            future: async move { fixture.gather(overrides).await }.boxed(),
        }
    }

    /// Wraps an arbitrary future producing artifacts.
    pub fn from_future<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<Artifacts>> + Send + 'static,
    {
        Self {
            name: name.into(),
            future: future.boxed(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation").field("name", &self.name).finish()
    }
}

/// Names children `name`, `name#2`, `name#3`, ... when a fixture repeats.
fn unique_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    names
        .map(|name| {
            let count = seen.entry(name).or_insert(0);
            *count += 1;
            if *count == 1 {
                name.to_string()
            } else {
                format!("{}#{}", name, count)
            }
        })
        .collect()
}

/// Runs `invocations` concurrently and merges their artifacts.
///
/// The deadline is the minimum of `timeout` and any inherited deadline. When
/// it fires, outstanding invocations are cancelled (their child entry has no
/// artifacts), finished ones are kept, and the merged code is
/// [`TIMEOUT`](result_code::TIMEOUT). Otherwise the merged code is the first
/// non-zero child code in invocation order, or zero.
///
/// Errors that are not instrument failures cancel the remaining invocations
/// and are returned; panics in a child are resumed in the caller. Dropping
/// the returned future cancels every invocation still running.
pub async fn gather_all(
    manager: &FixtureManager,
    invocations: Vec<Invocation>,
    timeout: Option<Duration>,
) -> Result<Artifacts> {
    let deadline = scheduling::effective_deadline(timeout);
    let names = unique_names(invocations.iter().map(|inv| inv.name.as_str()));
    let count = invocations.len();
    tracing::debug!(invocations = count, ?timeout, "starting concurrent gather");

    let mut tasks = TaskGroup::spawn(manager, invocations.into_iter().map(|inv| inv.future), deadline);

    let mut results: Vec<Option<Artifacts>> = Vec::with_capacity(count);
    let mut timed_out = false;

    for index in 0..count {
        let joined = match deadline {
            Some(deadline) if !timed_out => {
                match tokio::time::timeout_at(deadline, tasks.handle_mut(index)).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        timed_out = true;
                        tracing::warn!(
                            completed = results.len(),
                            cancelled = count - index,
                            "gather deadline expired, cancelling outstanding invocations"
                        );
                        tasks.abort_all();
                        tasks.handle_mut(index).await
                    }
                }
            }
            _ => tasks.handle_mut(index).await,
        };

        // returning early drops `tasks`, which aborts the rest
        match joined {
            Ok(Ok(artifacts)) => results.push(Some(artifacts)),
            Ok(Err(err)) if err.is_instrument_failure() => {
                results.push(Some(Artifacts::from_error(&err)))
            }
            Ok(Err(err)) => return Err(err),
            Err(err) if err.is_cancelled() => results.push(None),
            Err(err) => match err.try_into_panic() {
                Ok(payload) => std::panic::resume_unwind(payload),
                Err(err) => return Err(Error::Task(err.to_string())),
            },
        }
    }

    let code = if timed_out {
        result_code::TIMEOUT
    } else {
        results
            .iter()
            .map(|r| {
                r.as_ref()
                    .and_then(Artifacts::result_code)
                    .unwrap_or(result_code::FAILURE)
            })
            .find(|code| *code != result_code::SUCCESS)
            .unwrap_or(result_code::SUCCESS)
    };

    let children = names
        .into_iter()
        .zip(results)
        .map(|(name, artifacts)| ChildArtifacts { name, artifacts })
        .collect();
    tracing::info!(invocations = count, result_code = code, timed_out, "concurrent gather finished");
    Ok(Artifacts::combine(code, children))
}

/// Gather-of-gathers: runs the fixtures named by `gather_coroutine`, plus any
/// invocations queued with [`push`](GatherFixture::push), concurrently.
///
/// Queued invocations are consumed by the next gather. Call-time overrides
/// that are not the gather's own are passed, by prefixed key, to the named
/// children declaring them; a key no named child declares is a
/// configuration error.
pub struct GatherFixture {
    core: FixtureCore,
    queued: Vec<Invocation>,
    forwarded: Overrides,
}

impl GatherFixture {
    pub fn new(core: FixtureCore) -> Self {
        Self {
            core,
            queued: Vec::new(),
            forwarded: Overrides::new(),
        }
    }

    /// Queues an invocation for the next gather.
    pub fn push(&mut self, invocation: Invocation) -> &mut Self {
        self.queued.push(invocation);
        self
    }

    pub fn queued(&self) -> usize {
        self.queued.len()
    }
}

impl From<FixtureCore> for GatherFixture {
    fn from(core: FixtureCore) -> Self {
        Self::new(core)
    }
}

#[async_trait]
impl Fixture for GatherFixture {
    fn info() -> FixtureInfo {
        FixtureInfo::new("gather", "gather")
    }

    fn on_visit_test_arguments(arguments: &mut Arguments<'_>) {
        arguments
            .add_argument(
                ArgumentSpec::new("coroutine")
                    .kind(ArgKind::List)
                    .default(Vec::<String>::new())
                    .help("Names of fixtures to gather concurrently."),
            )
            .add_argument(
                ArgumentSpec::new("timeout")
                    .kind(ArgKind::Float)
                    .default(0.0)
                    .help("Seconds before outstanding fixtures are cancelled; 0 waits forever."),
            );
    }

    fn core(&self) -> &FixtureCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FixtureCore {
        &mut self.core
    }

    async fn gather(&mut self, overrides: Overrides) -> Result<Artifacts> {
        let prefix = &self.core.info().argument_prefix;
        let (own, forwarded): (Vec<_>, Vec<_>) = overrides
            .iter()
            .partition(|(key, _)| self.core.schema().lookup(prefix, key).is_some());
        let own: Overrides = own.into_iter().map(|(k, v)| (k, v.clone())).collect();
        self.forwarded = forwarded.into_iter().map(|(k, v)| (k, v.clone())).collect();
        run_gather(self, own).await
    }

    async fn on_gather(&mut self, namespace: &Namespace) -> Result<Artifacts> {
        let timeout = namespace.get_duration("timeout")?;
        let manager = self.core.manager()?;
        let forwarded = std::mem::take(&mut self.forwarded);
        let mut unclaimed: BTreeSet<&str> = forwarded.iter().map(|(key, _)| key).collect();
        let mut invocations = std::mem::take(&mut self.queued);
        for name in namespace.get_list("coroutine") {
            let fixture = manager.create(name, Overrides::new())?;
            let schema = fixture.core().schema();
            let overrides: Overrides = forwarded
                .iter()
                .filter(|(key, _)| schema.get(key).is_some())
                .map(|(key, value)| (key, value.clone()))
                .collect();
            for (key, _) in overrides.iter() {
                unclaimed.remove(key);
            }
            tracing::debug!(child = %name, forwarded = overrides.len(), "starting named fixture");
            invocations.push(Invocation::owned(fixture, overrides));
        }
        if !unclaimed.is_empty() {
            let keys: Vec<&str> = unclaimed.into_iter().collect();
            return Err(Error::Config(format!(
                "options {} match no fixture named in gather_coroutine",
                keys.join(", ")
            )));
        }
        gather_all(&manager, invocations, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigContext;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn manager() -> FixtureManager {
        FixtureManager::new(
            ConfigContext::builder()
                .with_env(Vec::<(String, String)>::new())
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    fn after(name: &str, delay_ms: u64, code: i32) -> Invocation {
        let label = name.to_string();
        Invocation::from_future(name, async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let mut builder = Artifacts::builder();
            builder.insert(format!("{}_done", label), true);
            Ok(builder.build(code))
        })
    }

    #[test]
    fn repeated_names_are_numbered() {
        let names = unique_names(["bar", "cmd", "bar", "bar"].into_iter());
        assert_eq!(names, vec!["bar", "cmd", "bar#2", "bar#3"]);
    }

    #[tokio::test]
    async fn zero_invocations_succeed() {
        let manager = manager();
        let merged = gather_all(&manager, Vec::new(), None).await.unwrap();
        assert!(merged.is_success());
        assert!(merged.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn single_failure_sets_code_regardless_of_completion_order() {
        let manager = manager();
        for fail_index in 0..3 {
            let invocations = (0..3)
                .map(|i| {
                    let code = if i == fail_index { 7 } else { 0 };
                    // later invocations finish first
                    after(&format!("f{}", i), 30 - i as u64 * 10, code)
                })
                .collect();
            let merged = gather_all(&manager, invocations, None).await.unwrap();
            assert_eq!(merged.result_code(), Some(7));
            assert_eq!(merged.children()[fail_index].result_code(), Some(7));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_failing_code_in_invocation_order_wins() {
        let manager = manager();
        let merged = gather_all(
            &manager,
            vec![after("a", 50, 0), after("b", 40, 3), after("c", 10, 5)],
            None,
        )
        .await
        .unwrap();
        assert_eq!(merged.result_code(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_outstanding_and_keeps_finished() {
        let manager = manager();
        let merged = gather_all(
            &manager,
            vec![after("slow", 5_000, 0), after("fast", 10, 0), after("failing", 20, 2)],
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();

        assert_eq!(merged.result_code(), Some(result_code::TIMEOUT));
        assert!(merged.child("slow").unwrap().was_cancelled());
        assert_eq!(merged.child("fast").unwrap().result_code(), Some(0));
        assert_eq!(merged.child("failing").unwrap().result_code(), Some(2));
        assert_eq!(merged.get_bool("fast_done"), Some(true));
        assert!(merged.failure_report().contains("slow: cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn nested_gather_inherits_shorter_deadline() {
        let manager = manager();
        let start = tokio::time::Instant::now();
        let outer = start + Duration::from_secs(2);

        let merged = scheduling::with_deadline(
            Some(outer),
            gather_all(&manager, vec![after("deep", 10_000, 0)], Some(Duration::from_secs(60))),
        )
        .await
        .unwrap();

        assert!(merged.is_timeout());
        assert!(merged.child("deep").unwrap().was_cancelled());
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn gather_of_gathers_nests_without_deadlock() {
        let manager = manager();
        let inner_manager = manager.clone();
        let inner = Invocation::from_future("inner", async move {
            gather_all(&inner_manager, vec![after("x", 10, 0), after("y", 20, 4)], None).await
        });

        let merged = gather_all(&manager, vec![inner, after("z", 5, 0)], Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(merged.result_code(), Some(4));
        let inner = merged.child("inner").unwrap().artifacts.as_ref().unwrap();
        assert_eq!(inner.child("y").unwrap().result_code(), Some(4));
        assert!(merged.failure_report().contains("inner/y"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drops_the_invocation() {
        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let manager = manager();
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = Flag(dropped.clone());
        let slow = Invocation::from_future("slow", async move {
            let _flag = flag;
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Artifacts::success())
        });

        let merged = gather_all(&manager, vec![slow], Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(merged.is_timeout());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn defect_in_child_propagates() {
        let manager = manager();
        let broken = Invocation::from_future("broken", async {
            Err(Error::UnknownFixture("ghost".into()))
        });
        let result = gather_all(&manager, vec![after("ok", 0, 0), broken], None).await;
        assert!(matches!(result, Err(Error::UnknownFixture(_))));
    }

    #[tokio::test]
    async fn instrument_error_in_child_is_captured() {
        let manager = manager();
        let flaky = Invocation::from_future("flaky", async {
            Err(Error::Instrument("debugger lost".into()))
        });
        let merged = gather_all(&manager, vec![flaky], None).await.unwrap();
        assert_eq!(merged.result_code(), Some(result_code::FAILURE));
        assert!(merged.failure_report().contains("debugger lost"));
    }
}
