use crate::error::{FirewallError, Result};
use std::process::Command;
use tracing::debug;

/// Captured result of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().filter(|line| !line.trim().is_empty())
    }
}

/// Executes host tools on behalf of the reconciler.
///
/// `run` only fails when the process could not be started; a non-zero exit
/// is reported through [`CommandOutput::exit_code`]. Call sites that need
/// success use [`CommandRunner::run_checked`].
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;

    fn run_checked(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = self.run(program, args)?;
        if output.success() {
            Ok(output)
        } else {
            Err(FirewallError::CommandFailed {
                command: render_command(program, args),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

impl<T: CommandRunner + ?Sized> CommandRunner for &T {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        (**self).run(program, args)
    }
}

impl<T: CommandRunner + ?Sized> CommandRunner for std::sync::Arc<T> {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        (**self).run(program, args)
    }
}

/// Runs commands as real child processes, blocking until they exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!(command = %render_command(program, args), "exec");

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| FirewallError::CommandSpawn {
                command: render_command(program, args),
                source,
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

pub fn render_command(program: &str, args: &[String]) -> String {
    let mut rendered = program.to_string();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}

/// Builds an owned argument vector from string slices.
pub fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts.into_iter().map(|p| p.as_ref().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Exit(i32);

    impl CommandRunner for Exit {
        fn run(&self, _program: &str, _args: &[String]) -> Result<CommandOutput> {
            Ok(CommandOutput::failed(self.0, "No chain/target/match by that name.\n"))
        }
    }

    #[test]
    fn run_checked_maps_non_zero_exit() {
        let err = Exit(1)
            .run_checked("iptables", &args(["-F", "i-2-10-VM"]))
            .unwrap_err();

        match err {
            FirewallError::CommandFailed {
                command,
                exit_code,
                stderr,
            } => {
                assert_eq!(command, "iptables -F i-2-10-VM");
                assert_eq!(exit_code, Some(1));
                assert_eq!(stderr, "No chain/target/match by that name.");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn lines_skip_blank_output() {
        let out = CommandOutput::ok("a\n\n  \nb\n");
        assert_eq!(out.lines().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
