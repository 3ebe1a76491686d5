//! Fixtures backed by an external command.
//!
//! A [`CommandSpec`] describes what to run; [`SubprocessFixture`] runs it,
//! streams its output through optional [`LineFilter`]s and reports the exit
//! code as the result code.
//!
//! Filters live on the fixture instance, not on the call. Reset them (with
//! `set_stdout_filter`/`take_stdout_filter`) between gathers; concurrent
//! gathers of one instance are prevented by `gather(&mut self)`.

mod filter;
mod runner;

pub use filter::{LineAccumulator, LineFilter, LineMatcher, Stream};
pub use runner::{CommandLine, CommandRunner, RunOptions, RunOutput};

use async_trait::async_trait;

use crate::artifacts::{Artifacts, ArtifactsBuilder};
use crate::config::{Arguments, Namespace};
use crate::error::Result;
use crate::fixture::{Fixture, FixtureCore, FixtureInfo};

/// Describes the command a [`SubprocessFixture`] runs.
///
/// Each implementation declares its own name and prefix; nothing is inherited.
pub trait CommandSpec: Send + Sync + 'static {
    fn info() -> FixtureInfo
    where
        Self: Sized;

    /// Declares command-specific options; `cwd`, `logfile` and
    /// `logfile_amend` are declared by the fixture.
    fn on_visit_test_arguments(arguments: &mut Arguments<'_>)
    where
        Self: Sized;

    /// Builds the command line; may add artifacts describing it.
    fn on_construct_command(
        &self,
        namespace: &Namespace,
        artifacts: &mut ArtifactsBuilder,
    ) -> Result<CommandLine>;
}

/// Runs the command of `C` and returns its exit code as the result code.
///
/// Artifacts: `cmd` (the command line), `exit_code`, and `logfile` when set.
pub struct SubprocessFixture<C: CommandSpec> {
    core: FixtureCore,
    spec: C,
    stdout_filter: Option<Box<dyn LineFilter>>,
    stderr_filter: Option<Box<dyn LineFilter>>,
}

impl<C: CommandSpec> SubprocessFixture<C> {
    pub fn with_spec(core: FixtureCore, spec: C) -> Self {
        Self {
            core,
            spec,
            stdout_filter: None,
            stderr_filter: None,
        }
    }

    pub fn spec(&self) -> &C {
        &self.spec
    }

    pub fn set_stdout_filter(&mut self, filter: Option<Box<dyn LineFilter>>) {
        self.stdout_filter = filter;
    }

    pub fn take_stdout_filter(&mut self) -> Option<Box<dyn LineFilter>> {
        self.stdout_filter.take()
    }

    pub fn set_stderr_filter(&mut self, filter: Option<Box<dyn LineFilter>>) {
        self.stderr_filter = filter;
    }

    pub fn take_stderr_filter(&mut self) -> Option<Box<dyn LineFilter>> {
        self.stderr_filter.take()
    }
}

impl<C: CommandSpec + Default> From<FixtureCore> for SubprocessFixture<C> {
    fn from(core: FixtureCore) -> Self {
        Self::with_spec(core, C::default())
    }
}

#[async_trait]
impl<C: CommandSpec> Fixture for SubprocessFixture<C> {
    fn info() -> FixtureInfo {
        C::info()
    }

    fn on_visit_test_arguments(arguments: &mut Arguments<'_>) {
        CommandRunner::visit_arguments(arguments);
        C::on_visit_test_arguments(arguments);
    }

    fn core(&self) -> &FixtureCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FixtureCore {
        &mut self.core
    }

    async fn on_gather(&mut self, namespace: &Namespace) -> Result<Artifacts> {
        let mut builder = Artifacts::builder();
        let command = self.spec.on_construct_command(namespace, &mut builder)?;
        let options = RunOptions::from_namespace(namespace);

        builder.insert("cmd", command.to_string());
        if let Some(logfile) = &options.logfile {
            builder.insert("logfile", logfile.display().to_string());
        }

        let output = CommandRunner::new(options)
            .run(
                &command,
                self.stdout_filter.as_mut(),
                self.stderr_filter.as_mut(),
            )
            .await?;

        builder.insert("exit_code", output.exit_code);
        Ok(builder.build(output.exit_code))
    }
}
