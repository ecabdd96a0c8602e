use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::thread;

use crate::{Error, IPSET_BIN, Result};

/// A single invocation of the ipset tool.
pub trait Cmd {
    fn set_stdin(&mut self, input: Vec<u8>);

    /// Runs the command and returns stdout. A non-zero exit is an error
    /// carrying stderr.
    fn output(self) -> Result<Vec<u8>>;

    /// Runs the command and returns stdout followed by stderr. A non-zero
    /// exit is an error carrying the combined output.
    fn combined_output(self) -> Result<Vec<u8>>;
}

/// Builds ipset invocations. All dataplane reads and writes go through
/// this seam so it can be replaced in tests.
pub trait CommandFactory: Send + Sync {
    type Command: Cmd;

    fn new_command(&self, args: &[&str]) -> Self::Command;
}

#[derive(Clone, Debug)]
pub struct SystemCommandFactory {
    program: PathBuf,
}

impl SystemCommandFactory {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SystemCommandFactory {
    fn default() -> Self {
        Self::new(IPSET_BIN)
    }
}

impl CommandFactory for SystemCommandFactory {
    type Command = SystemCommand;

    fn new_command(&self, args: &[&str]) -> SystemCommand {
        let mut command = Command::new(&self.program);
        command.args(args);
        let display = std::iter::once(self.program.display().to_string())
            .chain(args.iter().map(|a| a.to_string()))
            .collect::<Vec<_>>()
            .join(" ");
        SystemCommand {
            command,
            display,
            stdin: None,
        }
    }
}

pub struct SystemCommand {
    command: Command,
    display: String,
    stdin: Option<Vec<u8>>,
}

impl SystemCommand {
    fn run(mut self) -> Result<(String, Output)> {
        let stdin = if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let mut child = self
            .command
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // feed stdin from a separate thread so a chatty child can't fill its
        // stdout pipe while we are still writing the script
        let writer = child.stdin.take();
        let input = self.stdin.take();
        let (output, written) = thread::scope(|s| {
            let handle = s.spawn(move || -> std::io::Result<()> {
                if let (Some(mut pipe), Some(input)) = (writer, input) {
                    pipe.write_all(&input)?;
                }
                Ok(())
            });
            let output = child.wait_with_output();
            let written = handle
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
            (output, written)
        });
        let output = output?;
        if let Err(e) = written
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(e.into());
        }
        Ok((self.display, output))
    }
}

impl Cmd for SystemCommand {
    fn set_stdin(&mut self, input: Vec<u8>) {
        self.stdin = Some(input);
    }

    fn output(self) -> Result<Vec<u8>> {
        let (display, output) = self.run()?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: display,
                status: output.status.to_string(),
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output.stdout)
    }

    fn combined_output(self) -> Result<Vec<u8>> {
        let (display, output) = self.run()?;
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: display,
                status: output.status.to_string(),
                output: String::from_utf8_lossy(&combined).into_owned(),
            });
        }
        Ok(combined)
    }
}
