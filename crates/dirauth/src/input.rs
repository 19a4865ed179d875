//! Where console answers come from
//!
//! [`TerminalInput`] reads from the controlling terminal and turns echo off
//! for hidden prompts; with `echo_hidden` set (test automation) hidden
//! prompts are read like plain ones. [`ScriptedInput`] replays canned
//! answers.

use crate::error::{AuthError, Result};
use async_trait::async_trait;
use bsock::ChannelError;
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

/// Source of answers for interactive prompts
#[async_trait]
pub trait SecureInputSource: Send {
    /// Show text that needs no answer
    async fn display(&mut self, text: &str) -> Result<()>;

    /// Prompt and read an echoed answer
    async fn read_plain(&mut self, prompt: &str) -> Result<String>;

    /// Prompt and read a masked answer
    async fn read_hidden(&mut self, prompt: &str) -> Result<String>;
}

fn input_error(err: io::Error) -> AuthError {
    AuthError::Channel(ChannelError::Io(err))
}

/// Interactive terminal on stdin/stdout
#[derive(Debug, Clone, Default)]
pub struct TerminalInput {
    echo_hidden: bool,
}

impl TerminalInput {
    pub fn new(echo_hidden: bool) -> Self {
        Self { echo_hidden }
    }

    async fn read(prompt: &str, masked: bool) -> Result<String> {
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            let mut stdout = io::stdout();
            stdout.write_all(prompt.as_bytes())?;
            stdout.flush()?;
            if masked {
                read_line_masked()
            } else {
                read_line()
            }
        })
        .await
        .map_err(|e| input_error(io::Error::new(io::ErrorKind::Other, e)))?
        .map_err(input_error)
    }
}

#[async_trait]
impl SecureInputSource for TerminalInput {
    async fn display(&mut self, text: &str) -> Result<()> {
        let mut stdout = io::stdout();
        stdout
            .write_all(text.as_bytes())
            .and_then(|_| stdout.flush())
            .map_err(input_error)
    }

    async fn read_plain(&mut self, prompt: &str) -> Result<String> {
        Self::read(prompt, false).await
    }

    async fn read_hidden(&mut self, prompt: &str) -> Result<String> {
        Self::read(prompt, !self.echo_hidden).await
    }
}

fn read_line() -> io::Result<String> {
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "end of input while reading answer",
        ));
    }
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(line)
}

#[cfg(unix)]
fn read_line_masked() -> io::Result<String> {
    use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};
    use std::os::fd::AsFd;

    let stdin = io::stdin();
    let fd = stdin.as_fd();
    let original = match tcgetattr(fd) {
        Ok(termios) => termios,
        // Not a terminal: nothing to mask
        Err(_) => return read_line(),
    };

    let mut silent = original.clone();
    silent.local_flags.remove(LocalFlags::ECHO);
    silent.local_flags.insert(LocalFlags::ECHONL);
    tcsetattr(fd, SetArg::TCSANOW, &silent).map_err(io::Error::from)?;

    let result = read_line();
    let restored = tcsetattr(fd, SetArg::TCSANOW, &original).map_err(io::Error::from);
    let line = result?;
    restored?;
    Ok(line)
}

#[cfg(not(unix))]
fn read_line_masked() -> io::Result<String> {
    read_line()
}

/// Canned answers, for tests and unattended consoles
#[derive(Debug, Clone, Default)]
pub struct ScriptedInput {
    answers: VecDeque<String>,
    prompts: Vec<String>,
    displayed: Vec<String>,
}

impl ScriptedInput {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Prompts answered so far, in order
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    /// Text shown without a prompt
    pub fn displayed(&self) -> &[String] {
        &self.displayed
    }

    pub fn remaining(&self) -> usize {
        self.answers.len()
    }

    fn next_answer(&mut self, prompt: &str) -> Result<String> {
        self.prompts.push(prompt.to_string());
        self.answers.pop_front().ok_or_else(|| {
            input_error(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "no scripted answer left",
            ))
        })
    }
}

#[async_trait]
impl SecureInputSource for ScriptedInput {
    async fn display(&mut self, text: &str) -> Result<()> {
        self.displayed.push(text.to_string());
        Ok(())
    }

    async fn read_plain(&mut self, prompt: &str) -> Result<String> {
        self.next_answer(prompt)
    }

    async fn read_hidden(&mut self, prompt: &str) -> Result<String> {
        self.next_answer(prompt)
    }
}
