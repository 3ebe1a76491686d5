//! Subprocess execution with line-by-line output handling.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::artifacts::result_code;
use crate::config::{ArgKind, ArgumentSpec, Arguments, Namespace};
use crate::error::{Error, Result};

use super::filter::{LineFilter, Stream};

/// What to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Run through the platform shell (`sh -c`, or `cmd /C` on Windows).
    Shell(String),
    /// Run a program directly.
    Exec { program: String, args: Vec<String> },
}

impl CommandLine {
    pub fn shell(command: impl Into<String>) -> Self {
        CommandLine::Shell(command.into())
    }

    pub fn exec<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandLine::Exec {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn command(&self) -> Command {
        match self {
            CommandLine::Shell(line) => {
                #[cfg(windows)]
                let mut command = {
                    let mut command = Command::new("cmd");
                    command.arg("/C");
                    command
                };
                #[cfg(not(windows))]
                let mut command = {
                    let mut command = Command::new("sh");
                    command.arg("-c");
                    command
                };
                command.arg(line);
                command
            }
            CommandLine::Exec { program, args } => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandLine::Shell(line) => f.write_str(line),
            CommandLine::Exec { program, args } => {
                f.write_str(program)?;
                for arg in args {
                    if arg.contains(char::is_whitespace) {
                        write!(f, " \"{}\"", arg)?;
                    } else {
                        write!(f, " {}", arg)?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Per-invocation process options, resolved from the namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub logfile: Option<PathBuf>,
    /// Append to `logfile` instead of truncating it.
    pub logfile_amend: bool,
}

impl RunOptions {
    pub fn from_namespace(namespace: &Namespace) -> Self {
        let path = |name: &str| {
            namespace
                .get_str(name)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
        };
        Self {
            cwd: path("cwd"),
            logfile: path("logfile"),
            logfile_amend: namespace.get_bool("logfile_amend"),
        }
    }
}

/// How a subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutput {
    /// Exit code, or [`TERMINATED`](result_code::TERMINATED) if killed by a signal.
    pub exit_code: i32,
    pub stdout_lines: usize,
    pub stderr_lines: usize,
}

/// Runs a [`CommandLine`] and feeds its output to line filters.
///
/// The child is killed if the returned future is dropped, so a cancelled
/// gather never leaves a process running.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    options: RunOptions,
}

impl CommandRunner {
    pub fn new(options: RunOptions) -> Self {
        Self { options }
    }

    /// Declares `cwd`, `logfile` and `logfile_amend` under the visiting prefix.
    pub fn visit_arguments(arguments: &mut Arguments<'_>) {
        arguments
            .add_argument(ArgumentSpec::new("cwd").help("Working directory for the subprocess."))
            .add_argument(
                ArgumentSpec::new("logfile").help("Write subprocess output to this file."),
            )
            .add_argument(
                ArgumentSpec::new("logfile_amend")
                    .kind(ArgKind::Bool)
                    .default(false)
                    .help("Append to the log file instead of replacing it."),
            );
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    async fn open_log(&self) -> Result<Option<File>> {
        let Some(path) = &self.options.logfile else {
            return Ok(None);
        };
        let mut open = OpenOptions::new();
        open.create(true);
        if self.options.logfile_amend {
            open.append(true);
        } else {
            open.write(true).truncate(true);
        }
        Ok(Some(open.open(path).await?))
    }

    /// Runs `command` to completion.
    ///
    /// A command that cannot be started is an [`Error::Instrument`]; a
    /// non-zero exit is not an error.
    pub async fn run(
        &self,
        command: &CommandLine,
        mut stdout_filter: Option<&mut Box<dyn LineFilter>>,
        mut stderr_filter: Option<&mut Box<dyn LineFilter>>,
    ) -> Result<RunOutput> {
        let mut log = self.open_log().await?;

        let mut process = command.command();
        process
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.options.cwd {
            process.current_dir(cwd);
        }

        tracing::info!(command = %command, cwd = ?self.options.cwd, "starting subprocess");
        let mut child = process
            .spawn()
            .map_err(|e| Error::Instrument(format!("failed to start '{}': {}", command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Instrument("subprocess stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Instrument("subprocess stderr was not captured".into()))?;

        let mut stdout = BufReader::new(stdout).split(b'\n');
        let mut stderr = BufReader::new(stderr).split(b'\n');
        let (mut stdout_open, mut stderr_open) = (true, true);
        let (mut stdout_lines, mut stderr_lines) = (0, 0);

        while stdout_open || stderr_open {
            tokio::select! {
                segment = stdout.next_segment(), if stdout_open => match segment {
                    Ok(Some(bytes)) => {
                        stdout_lines += 1;
                        let line = decode(&bytes);
                        tracing::info!(line = %line, "stdout");
                        if let Some(filter) = stdout_filter.as_mut() {
                            filter.filter(Stream::Stdout, &line);
                        }
                        write_log(&mut log, &line).await?;
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        tracing::error!(error = %e, "error reading stdout");
                        stdout_open = false;
                    }
                },
                segment = stderr.next_segment(), if stderr_open => match segment {
                    Ok(Some(bytes)) => {
                        stderr_lines += 1;
                        let line = decode(&bytes);
                        tracing::warn!(line = %line, "stderr");
                        if let Some(filter) = stderr_filter.as_mut() {
                            filter.filter(Stream::Stderr, &line);
                        }
                        write_log(&mut log, &line).await?;
                    }
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        tracing::error!(error = %e, "error reading stderr");
                        stderr_open = false;
                    }
                },
            }
        }

        let status = child.wait().await?;
        if let Some(log) = log.as_mut() {
            log.flush().await?;
        }
        let exit_code = status.code().unwrap_or(result_code::TERMINATED);
        tracing::info!(exit_code, stdout_lines, stderr_lines, "subprocess exited");

        Ok(RunOutput {
            exit_code,
            stdout_lines,
            stderr_lines,
        })
    }
}

fn decode(bytes: &[u8]) -> String {
    let line = String::from_utf8_lossy(bytes);
    line.strip_suffix('\r').unwrap_or(&line).to_string()
}

async fn write_log(log: &mut Option<File>, line: &str) -> Result<()> {
    if let Some(file) = log.as_mut() {
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::subprocess::filter::LineAccumulator;

    fn boxed(filter: impl LineFilter + 'static) -> Box<dyn LineFilter> {
        Box::new(filter)
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let command = CommandLine::exec("JLinkExe", ["-device", "nRF52 840"]);
        assert_eq!(command.to_string(), "JLinkExe -device \"nRF52 840\"");
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let runner = CommandRunner::default();
        let output = runner
            .run(&CommandLine::shell("exit 3"), None, None)
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn lines_reach_filters_per_stream() {
        let out = LineAccumulator::new();
        let err = LineAccumulator::new();
        let mut out_filter = boxed(out.clone());
        let mut err_filter = boxed(err.clone());

        let output = CommandRunner::default()
            .run(
                &CommandLine::shell("echo one; echo two >&2; printf 'three'"),
                Some(&mut out_filter),
                Some(&mut err_filter),
            )
            .await
            .unwrap();

        assert_eq!(output.exit_code, 0);
        assert_eq!(out.lines(), vec!["one", "three"]);
        assert_eq!(err.lines(), vec!["two"]);
        assert_eq!(output.stdout_lines, 2);
        assert_eq!(output.stderr_lines, 1);
    }

    #[tokio::test]
    async fn missing_program_is_an_instrument_failure() {
        let result = CommandRunner::default()
            .run(
                &CommandLine::exec("/nonexistent/hil-tool", Vec::<String>::new()),
                None,
                None,
            )
            .await;
        assert!(matches!(result, Err(Error::Instrument(_))));
    }

    #[tokio::test]
    async fn signal_termination_reports_terminated() {
        let output = CommandRunner::default()
            .run(&CommandLine::shell("kill -9 $$"), None, None)
            .await
            .unwrap();
        assert_eq!(output.exit_code, result_code::TERMINATED);
    }

    #[tokio::test]
    async fn logfile_is_written_and_amended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let options = |amend| RunOptions {
            cwd: Some(dir.path().to_path_buf()),
            logfile: Some(path.clone()),
            logfile_amend: amend,
        };

        CommandRunner::new(options(false))
            .run(&CommandLine::shell("echo first; pwd"), None, None)
            .await
            .unwrap();
        CommandRunner::new(options(true))
            .run(&CommandLine::shell("echo second"), None, None)
            .await
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "first");
        assert!(lines[1].ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
        assert_eq!(lines[2], "second");

        CommandRunner::new(options(false))
            .run(&CommandLine::shell("echo third"), None, None)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "third\n");
    }
}
