//! Deadlines, timed suspension and task groups on the shared scheduler.
//!
//! A deadline set by an enclosing gather is visible to everything awaited
//! inside it through a task-local. Nested gathers never extend it: their
//! effective deadline is the minimum of the inherited and the local one.
//! Tasks spawned on behalf of a gather live in a [`TaskGroup`], so they are
//! cancelled together with whatever is awaiting them.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::artifacts::Artifacts;
use crate::error::{Error, Result};
use crate::manager::FixtureManager;

tokio::task_local! {
    static DEADLINE: Instant;
}

/// Stand-in end time for sleeps too long to represent, roughly 30 years out.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

/// The deadline inherited from the enclosing gather, if any.
pub fn current_deadline() -> Option<Instant> {
    DEADLINE.try_with(|deadline| *deadline).ok()
}

/// The earlier of the inherited deadline and `now + local`.
///
/// A local timeout too large to represent imposes no local deadline.
pub fn effective_deadline(local: Option<Duration>) -> Option<Instant> {
    let local = local.and_then(|after| Instant::now().checked_add(after));
    match (current_deadline(), local) {
        (Some(inherited), Some(local)) => Some(inherited.min(local)),
        (inherited, local) => inherited.or(local),
    }
}

/// Runs `future` with `deadline` visible through [`current_deadline`].
pub async fn with_deadline<F: Future>(deadline: Option<Instant>, future: F) -> F::Output {
    match deadline {
        Some(deadline) => DEADLINE.scope(deadline, future).await,
        None => future.await,
    }
}

/// Suspends for `duration`, logging the whole seconds left once per second.
///
/// Fails with [`Error::Timeout`] if the inherited deadline expires first.
pub async fn countdown_sleep(label: &str, duration: Duration) -> Result<()> {
    let end = Instant::now()
        .checked_add(duration)
        .unwrap_or_else(far_future);
    let countdown = async {
        loop {
            let now = Instant::now();
            if now >= end {
                break;
            }
            let remaining = end - now;
            tracing::info!(fixture = %label, remaining_secs = remaining.as_secs_f64().ceil() as u64, "sleeping");
            tokio::time::sleep(remaining.min(Duration::from_secs(1))).await;
        }
    };

    match current_deadline() {
        Some(deadline) if deadline < end => tokio::time::timeout_at(deadline, countdown)
            .await
            .map_err(|_| Error::Timeout {
                fixture: label.to_string(),
                after: duration,
            }),
        _ => {
            countdown.await;
            Ok(())
        }
    }
}

/// Tasks spawned through the manager that are aborted when the group is dropped.
///
/// Dropping a gather that is still waiting on its children therefore
/// cancels the children too, and with them any subprocess they started.
pub struct TaskGroup<T> {
    handles: Vec<JoinHandle<T>>,
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Spawns every future on the manager's scheduler under `deadline`.
    pub fn spawn<I, F>(manager: &FixtureManager, futures: I, deadline: Option<Instant>) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = T> + Send + 'static,
    {
        let handles = futures
            .into_iter()
            .map(|future| manager.spawn(with_deadline(deadline, future)))
            .collect();
        Self { handles }
    }
}

impl<T> TaskGroup<T> {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Number of tasks that have finished, for any reason.
    pub fn finished(&self) -> usize {
        self.handles.iter().filter(|h| h.is_finished()).count()
    }

    pub fn running(&self) -> usize {
        self.len() - self.finished()
    }

    pub fn abort_all(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }

    /// The join handle of task `index`. Each handle may be awaited to completion once.
    pub(crate) fn handle_mut(&mut self, index: usize) -> &mut JoinHandle<T> {
        &mut self.handles[index]
    }
}

impl TaskGroup<Result<Artifacts>> {
    /// Waits for every task in order.
    ///
    /// Cancelled tasks yield `None`; instrument failures become failing
    /// artifacts. Any other error is returned and the remaining tasks are
    /// aborted.
    pub async fn join_all(mut self) -> Result<Vec<Option<Artifacts>>> {
        let mut results = Vec::with_capacity(self.handles.len());
        for handle in self.handles.iter_mut() {
            match handle.await {
                Ok(Ok(artifacts)) => results.push(Some(artifacts)),
                Ok(Err(err)) if err.is_instrument_failure() => {
                    results.push(Some(Artifacts::from_error(&err)))
                }
                Ok(Err(err)) => return Err(err),
                Err(err) if err.is_cancelled() => results.push(None),
                Err(err) => return Err(Error::Task(format!("task failed: {}", err))),
            }
        }
        Ok(results)
    }
}

impl<T> Drop for TaskGroup<T> {
    fn drop(&mut self) {
        self.abort_all();
    }
}

impl<T> std::fmt::Debug for TaskGroup<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("tasks", &self.len())
            .field("finished", &self.finished())
            .finish()
    }
}

/// Awaits `future` until `deadline`, which it also inherits.
async fn run_until<F>(label: &str, future: F, deadline: Option<Instant>, timeout: Option<Duration>) -> Result<Artifacts>
where
    F: Future<Output = Result<Artifacts>>,
{
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, with_deadline(Some(deadline), future)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                fixture: label.to_string(),
                after: timeout.unwrap_or_default(),
            }),
        },
        None => future.await,
    }
}

/// Result of [`gate_tasks`].
#[derive(Debug)]
pub struct GateOutcome {
    /// Artifacts of the gate.
    pub gate: Artifacts,
    /// One entry per gated task, in order; `None` if it was cancelled.
    pub gated: Vec<Option<Artifacts>>,
}

/// Runs `gate` alongside `gated` tasks and cancels the gated tasks once the gate completes.
///
/// Typical use is a serial monitor gated on a firmware upload. Gated tasks
/// that finish before the gate keep their artifacts. If the gate exceeds
/// `timeout`, every gated task is cancelled and [`Error::Timeout`] is returned.
pub async fn gate_tasks<G>(
    manager: &FixtureManager,
    gate: G,
    gated: Vec<BoxFuture<'static, Result<Artifacts>>>,
    timeout: Option<Duration>,
) -> Result<GateOutcome>
where
    G: Future<Output = Result<Artifacts>> + Send,
{
    let deadline = effective_deadline(timeout);
    let tasks = TaskGroup::spawn(manager, gated, deadline);

    let gate_result = run_until("gate", gate, deadline, timeout).await;
    tasks.abort_all();
    let gated = tasks.join_all().await?;

    let gate = gate_result?;
    tracing::debug!(
        gate_result_code = ?gate.result_code(),
        cancelled = gated.iter().filter(|g| g.is_none()).count(),
        "gate complete"
    );
    Ok(GateOutcome { gate, gated })
}

/// Result of [`observe_tasks`].
#[derive(Debug)]
pub struct ObserveOutcome {
    /// Artifacts of the observer.
    pub observer: Artifacts,
    /// The observed tasks. Those still running are aborted when this is dropped.
    pub observed: TaskGroup<Result<Artifacts>>,
}

/// Runs `observed` tasks in the background until `observer` completes.
///
/// The observer judges the side effects of the observed tasks, e.g. a log
/// watcher confirming a board booted while a power supply stays on. The
/// observed tasks keep running afterwards; hold on to
/// [`ObserveOutcome::observed`] for as long as they should. If the observer
/// exceeds `timeout` (or the inherited deadline), the observed tasks are
/// cancelled and [`Error::Timeout`] is returned.
pub async fn observe_tasks<O>(
    manager: &FixtureManager,
    observer: O,
    observed: Vec<BoxFuture<'static, Result<Artifacts>>>,
    timeout: Option<Duration>,
) -> Result<ObserveOutcome>
where
    O: Future<Output = Result<Artifacts>> + Send,
{
    let deadline = effective_deadline(timeout);
    let observed = TaskGroup::spawn(manager, observed, deadline);

    let observer = run_until("observer", observer, deadline, timeout).await?;
    tracing::debug!(
        observer_result_code = ?observer.result_code(),
        still_running = observed.running(),
        "observation complete"
    );
    Ok(ObserveOutcome { observer, observed })
}

/// Like [`observe_tasks`], but every observed task must outlive the observer.
///
/// Fails with [`Error::AssertionFailed`] if any observed task exited before
/// the observer completed; the remaining tasks are then cancelled.
pub async fn observe_tasks_assert_not_done<O>(
    manager: &FixtureManager,
    observer: O,
    observed: Vec<BoxFuture<'static, Result<Artifacts>>>,
    timeout: Option<Duration>,
) -> Result<ObserveOutcome>
where
    O: Future<Output = Result<Artifacts>> + Send,
{
    let outcome = observe_tasks(manager, observer, observed, timeout).await?;
    let exited = outcome.observed.finished();
    if exited > 0 {
        tracing::warn!(exited, "observed tasks exited during observation");
        return Err(Error::AssertionFailed {
            result_code: outcome.observer.result_code(),
            report: format!(
                "{} of {} observed tasks exited before the observation was complete",
                exited,
                outcome.observed.len()
            ),
            artifacts: Box::new(outcome.observer),
        });
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigContext;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn manager() -> FixtureManager {
        FixtureManager::new(ConfigContext::empty()).unwrap()
    }

    #[tokio::test]
    async fn no_deadline_outside_gather() {
        assert!(current_deadline().is_none());
        assert!(effective_deadline(None).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn nested_deadline_is_the_minimum() {
        let outer = Instant::now() + Duration::from_secs(5);
        with_deadline(Some(outer), async move {
            assert_eq!(current_deadline(), Some(outer));
            assert_eq!(effective_deadline(Some(Duration::from_secs(60))), Some(outer));

            let inner = effective_deadline(Some(Duration::from_secs(1))).unwrap();
            assert!(inner < outer);
            assert_eq!(effective_deadline(None), Some(outer));
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_sleep_waits_full_duration() {
        let start = Instant::now();
        tokio_test::assert_ok!(countdown_sleep("settle", Duration::from_millis(2500)).await);
        assert_eq!(start.elapsed(), Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_sleep_honours_outer_deadline() {
        let deadline = Instant::now() + Duration::from_secs(2);
        let result = with_deadline(
            Some(deadline),
            countdown_sleep("settle", Duration::from_secs(10)),
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(Instant::now(), deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_cancels_gated_tasks() {
        let manager = manager();
        let quick = async { Ok::<_, Error>(Artifacts::success()) }.boxed();
        let endless = async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, Error>(Artifacts::success())
        }
        .boxed();
        let gate = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, Error>(Artifacts::success())
        };

        let outcome = gate_tasks(&manager, gate, vec![quick, endless], None)
            .await
            .unwrap();
        assert!(outcome.gate.is_success());
        assert!(outcome.gated[0].is_some());
        assert!(outcome.gated[1].is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn gate_timeout_fails() {
        let manager = manager();
        let gate = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, Error>(Artifacts::success())
        };
        let result = gate_tasks(&manager, gate, Vec::new(), Some(Duration::from_secs(1))).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_timeout_imposes_no_deadline() {
        assert!(effective_deadline(Some(Duration::MAX)).is_none());

        let outer = Instant::now() + Duration::from_secs(5);
        with_deadline(Some(outer), async move {
            assert_eq!(effective_deadline(Some(Duration::MAX)), Some(outer));
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn huge_countdown_still_honours_deadline() {
        let deadline = Instant::now() + Duration::from_secs(3);
        let result = with_deadline(Some(deadline), countdown_sleep("settle", Duration::MAX)).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    // =========================================================================
    // Task groups
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn dropping_task_group_aborts_tasks() {
        let manager = manager();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let group = TaskGroup::spawn(
            &manager,
            vec![async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                flag.store(true, Ordering::SeqCst);
            }],
            None,
        );
        assert_eq!(group.running(), 1);

        drop(group);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(manager.outstanding_tasks(), 0);
    }

    // =========================================================================
    // Observation
    // =========================================================================

    fn persistent() -> BoxFuture<'static, Result<Artifacts>> {
        async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, Error>(Artifacts::success())
        }
        .boxed()
    }

    fn observer(after: Duration) -> impl Future<Output = Result<Artifacts>> + Send {
        async move {
            tokio::time::sleep(after).await;
            Ok::<_, Error>(Artifacts::success())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn observed_tasks_keep_running_after_observer() {
        let manager = manager();
        let outcome = observe_tasks_assert_not_done(
            &manager,
            observer(Duration::from_secs(1)),
            vec![persistent(), persistent()],
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

        assert!(outcome.observer.is_success());
        assert_eq!(outcome.observed.running(), 2);

        drop(outcome);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.outstanding_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn observed_task_exiting_early_fails_assertion() {
        let manager = manager();
        let early = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err::<Artifacts, _>(Error::Instrument("power supply tripped".into()))
        }
        .boxed();

        let result = observe_tasks_assert_not_done(
            &manager,
            observer(Duration::from_secs(1)),
            vec![persistent(), early],
            None,
        )
        .await;
        match result {
            Err(Error::AssertionFailed { report, .. }) => assert!(report.contains("1 of 2")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn observe_tasks_tolerates_early_exit() {
        let manager = manager();
        let quick = async { Ok::<_, Error>(Artifacts::success()) }.boxed();

        let outcome = observe_tasks(
            &manager,
            observer(Duration::from_secs(1)),
            vec![quick, persistent()],
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.observed.finished(), 1);

        outcome.observed.abort_all();
        let results = outcome.observed.join_all().await.unwrap();
        assert!(results[0].as_ref().unwrap().is_success());
        assert!(results[1].is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn observer_timeout_cancels_observed_tasks() {
        let manager = manager();
        let result = observe_tasks(
            &manager,
            observer(Duration::from_secs(60)),
            vec![persistent()],
            Some(Duration::from_secs(1)),
        )
        .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.outstanding_tasks(), 0);
    }
}
