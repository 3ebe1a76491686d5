//! Built-in fixtures registered by [`FixtureManager::with_builtins`](crate::FixtureManager::with_builtins).

mod bar;
mod cmd;
mod firmware;

pub use bar::BarFixture;
pub use cmd::{CmdFixture, ShellCommand};
pub use firmware::{CommandTarget, FirmwareTarget, FirmwareUpdateFixture, FirmwareVersion};
