//! Runs a shell command given by the `cmd_shell` option.

use crate::artifacts::ArtifactsBuilder;
use crate::config::{ArgumentSpec, Arguments, Namespace};
use crate::error::Result;
use crate::fixture::FixtureInfo;
use crate::subprocess::{CommandLine, CommandSpec, SubprocessFixture};

/// The command of [`CmdFixture`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellCommand;

impl CommandSpec for ShellCommand {
    fn info() -> FixtureInfo {
        FixtureInfo::new("cmd", "cmd")
    }

    fn on_visit_test_arguments(arguments: &mut Arguments<'_>) {
        arguments.add_argument(
            ArgumentSpec::new("shell")
                .required()
                .help("A shell command to run as a subprocess."),
        );
    }

    fn on_construct_command(
        &self,
        namespace: &Namespace,
        _artifacts: &mut ArtifactsBuilder,
    ) -> Result<CommandLine> {
        Ok(CommandLine::shell(namespace.require_str("shell")?))
    }
}

/// Runs `cmd_shell` through the platform shell.
pub type CmdFixture = SubprocessFixture<ShellCommand>;

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{ConfigContext, Overrides};
    use crate::error::Error;
    use crate::fixture::Fixture;
    use crate::manager::FixtureManager;
    use crate::subprocess::LineMatcher;

    fn manager() -> FixtureManager {
        FixtureManager::new(
            ConfigContext::builder()
                .with_env(Vec::<(String, String)>::new())
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn exit_code_becomes_result_code() {
        let manager = manager();
        let mut cmd: CmdFixture = manager.instantiate(Overrides::new()).unwrap();

        let ok = cmd.gather(Overrides::new().with("shell", "true")).await.unwrap();
        assert!(ok.is_success());

        let failed = cmd.gather(Overrides::new().with("cmd_shell", "exit 5")).await.unwrap();
        assert_eq!(failed.result_code(), Some(5));
        assert_eq!(failed.get_i64("exit_code"), Some(5));
    }

    #[tokio::test]
    async fn missing_shell_is_a_configuration_error() {
        let manager = manager();
        let mut cmd: CmdFixture = manager.instantiate(Overrides::new()).unwrap();
        assert!(matches!(
            cmd.gather(Overrides::new()).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn matcher_extracts_value_from_output() {
        let manager = manager();
        let mut cmd: CmdFixture = manager.instantiate(Overrides::new()).unwrap();
        let matcher = LineMatcher::new(r"temperature=(\d+)").unwrap();
        cmd.set_stdout_filter(Some(Box::new(matcher.clone())));

        cmd.gather(Overrides::new().with("shell", "echo boot; echo temperature=41"))
            .await
            .unwrap();
        assert_eq!(matcher.first_capture(1).as_deref(), Some("41"));
    }
}
