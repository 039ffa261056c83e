//! Running the external tools the pipeline relies on.
//!
//! Partition tables and ext4 filesystems are inspected and modified through
//! `sfdisk`, `blkid` and the e2fsprogs suite. Everything goes through the
//! [`CommandRunner`] trait so the shrink logic can be driven by a scripted
//! fake in tests.

use std::io::{self, Write};
use std::process::{Command, Stdio};

use tracing::debug;

/// Captured result of one finished process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Both output streams joined, for error messages and debug logs.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.to_string(),
            (false, true) => stdout.to_string(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}

/// Runs a program to completion and captures its output.
///
/// An `Err` means the process could not be started or waited on; a process
/// that ran and failed is reported through [`CommandOutput::status`].
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[&str], input: Option<&str>) -> io::Result<CommandOutput>;
}

/// Spawns real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str], input: Option<&str>) -> io::Result<CommandOutput> {
        debug!("running {} {}", program, args.join(" "));

        // Output is parsed by label, so it must not be translated.
        let mut child = Command::new(program)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Dropping stdin closes the pipe so the child sees end of input. The
        // child is always reaped before a write error is returned.
        let fed = match (input, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => stdin.write_all(input.as_bytes()),
            _ => Ok(()),
        };

        let output = child.wait_with_output()?;
        fed?;
        let output = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!("{} exited with {:?}", program, output.status);
        if !output.combined().is_empty() {
            debug!("{} output:\n{}", program, output.combined());
        }
        Ok(output)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! A scripted [`CommandRunner`] used across the crate's unit tests.

    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Invocation {
        pub program: String,
        pub args: Vec<String>,
        pub input: Option<String>,
    }

    /// Answers each call with the next queued reply for that program and
    /// records every invocation. An unexpected program is a spawn error.
    #[derive(Default)]
    pub struct ScriptedRunner {
        replies: RefCell<Vec<(String, VecDeque<io::Result<CommandOutput>>)>>,
        pub calls: RefCell<Vec<Invocation>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(self, program: &str, status: i32, stdout: &str) -> Self {
            self.push(
                program,
                Ok(CommandOutput {
                    status: Some(status),
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                }),
            )
        }

        pub fn reply_stderr(self, program: &str, status: i32, stderr: &str) -> Self {
            self.push(
                program,
                Ok(CommandOutput {
                    status: Some(status),
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                }),
            )
        }

        pub fn fail_to_spawn(self, program: &str) -> Self {
            self.push(
                program,
                Err(io::Error::new(io::ErrorKind::NotFound, "no such program")),
            )
        }

        fn push(self, program: &str, reply: io::Result<CommandOutput>) -> Self {
            {
                let mut replies = self.replies.borrow_mut();
                match replies.iter_mut().find(|(p, _)| p == program) {
                    Some((_, queue)) => queue.push_back(reply),
                    None => replies.push((program.to_string(), VecDeque::from([reply]))),
                }
            }
            self
        }

        pub fn programs(&self) -> Vec<String> {
            self.calls
                .borrow()
                .iter()
                .map(|c| format!("{} {}", c.program, c.args.join(" ")))
                .collect()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(
            &self,
            program: &str,
            args: &[&str],
            input: Option<&str>,
        ) -> io::Result<CommandOutput> {
            self.calls.borrow_mut().push(Invocation {
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                input: input.map(str::to_string),
            });
            self.replies
                .borrow_mut()
                .iter_mut()
                .find(|(p, _)| p == program)
                .and_then(|(_, queue)| queue.pop_front())
                .unwrap_or_else(|| {
                    Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("unscripted call to {program}"),
                    ))
                })
        }
    }
}
