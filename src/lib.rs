//! HIL Harness - fixture execution core for hardware-in-the-loop test rigs
//!
//! This library runs independently defined asynchronous fixtures against a
//! shared, run-scoped scheduler, resolves their options from layered INI
//! configuration, and merges the results of concurrent fixtures into a single
//! pass/fail verdict with typed artifact data.

pub mod artifacts;
pub mod builtin;
pub mod config;
pub mod error;
pub mod fixture;
pub mod gather;
pub mod manager;
pub mod scheduling;
pub mod subprocess;

pub use error::{Error, Result};

pub use artifacts::{
    assert_success, assert_success_if, result_code, ArtifactValue, Artifacts, ArtifactsBuilder,
    ChildArtifacts, DeferredAction,
};
pub use builtin::{
    BarFixture, CmdFixture, CommandTarget, FirmwareTarget, FirmwareUpdateFixture,
    FirmwareVersion, ShellCommand,
};
pub use config::{
    ArgKind, ArgValue, ArgumentSchema, ArgumentSpec, Arguments, ConfigContext, EnvSource, Layer,
    Namespace, Overrides, ValidationResult, ValueSource,
};
pub use fixture::{Fixture, FixtureCore, FixtureInfo, SharedFixture};
pub use gather::{gather_all, GatherFixture, Invocation};
pub use manager::FixtureManager;
pub use scheduling::{
    countdown_sleep, gate_tasks, observe_tasks, observe_tasks_assert_not_done, GateOutcome,
    ObserveOutcome, TaskGroup,
};
pub use subprocess::{
    CommandLine, CommandRunner, CommandSpec, LineAccumulator, LineFilter, LineMatcher,
    RunOptions, RunOutput, Stream, SubprocessFixture,
};
