// EdgeRelay - IoT edge relay node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Processing collaborators
//!
//! The relay treats the per-batch processing step (object detection, OCR,
//! sequence alignment, ...) as a black box behind the [`Processor`] trait.
//! A processor is synchronous; the worker runs it on the blocking pool and
//! times the whole call.

use std::io::Write;
use std::process::{Command as StdCommand, Stdio};

use serde_json::Value;

use crate::error::{ProcessingError, RelayError};
use crate::protocol::WorkItem;

/// A per-batch processing step
///
/// Implementations must return exactly one result per item, in item order.
pub trait Processor: Send + Sync {
    /// Process one batch
    fn process(&self, items: &[WorkItem]) -> Result<Vec<Value>, ProcessingError>;

    /// Short name for logs
    fn name(&self) -> &str {
        "processor"
    }
}

impl<F> Processor for F
where
    F: Fn(&[WorkItem]) -> Result<Vec<Value>, ProcessingError> + Send + Sync,
{
    fn process(&self, items: &[WorkItem]) -> Result<Vec<Value>, ProcessingError> {
        self(items)
    }

    fn name(&self) -> &str {
        "closure"
    }
}

/// Returns every item unchanged. Baseline for measuring relay overhead.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl Processor for Echo {
    fn process(&self, items: &[WorkItem]) -> Result<Vec<Value>, ProcessingError> {
        Ok(items.to_vec())
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Runs an external program per batch
///
/// The items are written to the program's stdin as one JSON array; the
/// program must print a JSON array of results on stdout and exit with
/// status 0.
#[derive(Debug, Clone)]
pub struct Command {
    program: String,
    args: Vec<String>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn failed(&self, what: &str, e: impl std::fmt::Display) -> ProcessingError {
        ProcessingError::Failed(format!("{} `{}`: {}", what, self.program, e))
    }

    /// Parse a command line with shell quoting rules
    /// (`python3 "my model.py" --label 'a b'`)
    pub fn parse(command_line: &str) -> Result<Self, RelayError> {
        let words = shell_words::split(command_line)
            .map_err(|e| RelayError::InvalidConfig(format!("processor command: {}", e)))?;
        let mut words = words.into_iter();
        let program = words
            .next()
            .ok_or_else(|| RelayError::InvalidConfig("processor command is empty".to_string()))?;
        Ok(Self::new(program).args(words))
    }
}

impl Processor for Command {
    fn process(&self, items: &[WorkItem]) -> Result<Vec<Value>, ProcessingError> {
        let input = serde_json::to_vec(items).map_err(|e| self.failed("encode input for", e))?;

        let mut child = StdCommand::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.failed("spawn", e))?;

        // Feed stdin from its own thread so a child that writes before it has
        // read everything cannot deadlock on a full pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || stdin.write_all(&input))
        });

        let output = child
            .wait_with_output()
            .map_err(|e| self.failed("wait for", e))?;

        let written = writer.map(|w| w.join());

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProcessingError::Failed(format!(
                "`{}` exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        match written {
            Some(Ok(Err(e))) => return Err(self.failed("write to", e)),
            Some(Err(_)) => return Err(self.failed("write to", "stdin writer panicked")),
            _ => {}
        }

        serde_json::from_slice(&output.stdout).map_err(|e| self.failed("parse output of", e))
    }

    fn name(&self) -> &str {
        &self.program
    }
}
