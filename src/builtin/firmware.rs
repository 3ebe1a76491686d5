//! Conditional firmware update.
//!
//! The fixture compares the version required by the configuration with the
//! version the device reports and only uploads when they differ, unless
//! `fwr_force` is set. Talking to the device is delegated to a
//! [`FirmwareTarget`]; [`CommandTarget`] drives external tools through shell
//! command templates.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;

use crate::artifacts::Artifacts;
use crate::config::{ArgKind, ArgumentSpec, Arguments, Namespace};
use crate::error::{Error, Result};
use crate::fixture::{Fixture, FixtureCore, FixtureInfo};
use crate::subprocess::{CommandLine, CommandRunner, LineFilter, LineMatcher, RunOptions};

const VERSION_PATTERN: &str = r"(\d+)\.(\d+)\.(\d+)";

/// A `major.minor.patch` firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FirmwareVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// The first `x.y.z` triplet in `text`, e.g. in `app-1.2.9.hex`.
    pub fn find_in(text: &str) -> Option<Self> {
        let pattern = Regex::new(VERSION_PATTERN).ok()?;
        let caps = pattern.captures(text)?;
        let part = |i: usize| caps.get(i)?.as_str().parse::<u32>().ok();
        Some(Self::new(part(1)?, part(2)?, part(3)?))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for FirmwareVersion {
    type Err = Error;

    /// Parses `x.y.z`, optionally prefixed with `v`.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
        let parts: Vec<&str> = trimmed.split('.').collect();
        let invalid = || Error::Config(format!("'{}' is not a major.minor.patch version", s));
        if parts.len() != 3 {
            return Err(invalid());
        }
        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| invalid())?;
        }
        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

/// Device access used by [`FirmwareUpdateFixture`].
#[async_trait]
pub trait FirmwareTarget: Send + Sync + 'static {
    /// Declares target-specific options under the fixture's prefix.
    fn on_visit_test_arguments(arguments: &mut Arguments<'_>)
    where
        Self: Sized;

    /// The version currently on the device, if it can be determined.
    async fn query_version(
        &mut self,
        namespace: &Namespace,
        port: &str,
    ) -> Result<Option<FirmwareVersion>>;

    /// Uploads `firmware` and returns the uploader's exit code.
    async fn upload(&mut self, namespace: &Namespace, port: &str, firmware: &str) -> Result<i32>;
}

/// Drives external tools given as shell command templates.
///
/// `{port}` and `{firmware}` in `fwr_query_cmd` and `fwr_upload_cmd` are
/// replaced before running. The queried version is the first `x.y.z` in the
/// query command's stdout.
#[derive(Debug, Default, Clone)]
pub struct CommandTarget;

impl CommandTarget {
    fn render(template: &str, port: &str, firmware: &str) -> String {
        template
            .replace("{port}", port)
            .replace("{firmware}", firmware)
    }
}

#[async_trait]
impl FirmwareTarget for CommandTarget {
    fn on_visit_test_arguments(arguments: &mut Arguments<'_>) {
        CommandRunner::visit_arguments(arguments);
        arguments
            .add_argument(
                ArgumentSpec::new("query_cmd")
                    .help("Shell command printing the device's firmware version."),
            )
            .add_argument(
                ArgumentSpec::new("upload_cmd")
                    .help("Shell command uploading {firmware} to the device on {port}."),
            );
    }

    async fn query_version(
        &mut self,
        namespace: &Namespace,
        port: &str,
    ) -> Result<Option<FirmwareVersion>> {
        let Some(template) = namespace.get_str("query_cmd").filter(|t| !t.is_empty()) else {
            tracing::debug!("no version query command configured");
            return Ok(None);
        };
        let command = CommandLine::shell(Self::render(template, port, ""));
        let matcher = LineMatcher::new(VERSION_PATTERN)?;
        let mut filter: Box<dyn LineFilter> = Box::new(matcher.clone());

        let output = CommandRunner::new(RunOptions::from_namespace(namespace))
            .run(&command, Some(&mut filter), None)
            .await?;
        if output.exit_code != 0 {
            return Err(Error::Instrument(format!(
                "version query '{}' exited with {}",
                command, output.exit_code
            )));
        }
        Ok(matcher
            .matches()
            .first()
            .and_then(|line| FirmwareVersion::find_in(line)))
    }

    async fn upload(&mut self, namespace: &Namespace, port: &str, firmware: &str) -> Result<i32> {
        let template = namespace.require_str("upload_cmd")?;
        let command = CommandLine::shell(Self::render(template, port, firmware));
        let output = CommandRunner::new(RunOptions::from_namespace(namespace))
            .run(&command, None, None)
            .await?;
        Ok(output.exit_code)
    }
}

/// Uploads firmware when the device's version differs from the required one.
///
/// Options (prefix `fwr`): `port` and `firmware` (required), `force`,
/// `version` (defaults to the triplet found in the firmware file name) and
/// `settle_seconds`, plus those of the target.
///
/// Artifacts: `port`, `firmware`, `required_version`, `queried_version`,
/// `forced`, `uploaded` and, after an upload, `upload_exit_code`.
pub struct FirmwareUpdateFixture<T: FirmwareTarget = CommandTarget> {
    core: FixtureCore,
    target: T,
}

impl<T: FirmwareTarget> FirmwareUpdateFixture<T> {
    pub fn with_target(core: FixtureCore, target: T) -> Self {
        Self { core, target }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }
}

impl<T: FirmwareTarget + Default> From<FixtureCore> for FirmwareUpdateFixture<T> {
    fn from(core: FixtureCore) -> Self {
        Self::with_target(core, T::default())
    }
}

fn required_version(namespace: &Namespace, firmware: &str) -> Result<Option<FirmwareVersion>> {
    match namespace.get_str("version").filter(|v| !v.is_empty()) {
        Some(version) => version.parse().map(Some),
        None => Ok(FirmwareVersion::find_in(firmware)),
    }
}

#[async_trait]
impl<T: FirmwareTarget> Fixture for FirmwareUpdateFixture<T> {
    fn info() -> FixtureInfo {
        FixtureInfo::new("firmware_update", "fwr")
    }

    fn on_visit_test_arguments(arguments: &mut Arguments<'_>) {
        arguments
            .add_argument(
                ArgumentSpec::new("port")
                    .required()
                    .help("Port the device is attached to."),
            )
            .add_argument(
                ArgumentSpec::new("firmware")
                    .required()
                    .help("Firmware image to upload."),
            )
            .add_argument(
                ArgumentSpec::new("force")
                    .kind(ArgKind::Bool)
                    .default(false)
                    .help("Upload without comparing versions."),
            )
            .add_argument(
                ArgumentSpec::new("version")
                    .help("Required version; defaults to the version in the firmware file name."),
            )
            .add_argument(
                ArgumentSpec::new("settle_seconds")
                    .kind(ArgKind::Float)
                    .default(0.0)
                    .help("Time to let the device reboot after an upload."),
            );
        T::on_visit_test_arguments(arguments);
    }

    fn core(&self) -> &FixtureCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FixtureCore {
        &mut self.core
    }

    async fn on_gather(&mut self, namespace: &Namespace) -> Result<Artifacts> {
        let port = namespace.require_str("port")?;
        let firmware = namespace.require_str("firmware")?;
        let required = required_version(namespace, firmware)?;
        let force = namespace.get_bool("force");
        let settle = namespace.get_duration("settle_seconds")?;

        let mut builder = Artifacts::builder();
        builder
            .insert("port", port)
            .insert("firmware", firmware)
            .insert("forced", force)
            .insert_serialized("required_version", &required.map(|v| v.to_string()))?;

        if !force {
            let queried = self.target.query_version(namespace, port).await?;
            builder.insert_serialized("queried_version", &queried.map(|v| v.to_string()))?;

            if let (Some(required), Some(queried)) = (required, queried) {
                if required == queried {
                    tracing::info!(%port, version = %queried, "firmware is up to date, skipping upload");
                    builder.insert("uploaded", false);
                    return Ok(builder.build(0));
                }
                tracing::info!(%port, %required, %queried, "firmware version mismatch");
            } else {
                tracing::info!(%port, ?required, ?queried, "cannot compare versions, uploading");
            }
        } else {
            tracing::info!(%port, "forced firmware upload");
        }

        let exit_code = self.target.upload(namespace, port, firmware).await?;
        builder
            .insert("uploaded", true)
            .insert("upload_exit_code", exit_code);

        if exit_code == 0 {
            if let Some(settle) = settle {
                self.core.countdown_sleep(settle).await?;
            }
        } else {
            tracing::warn!(%port, exit_code, "firmware upload failed");
        }
        Ok(builder.build(exit_code))
    }
}
