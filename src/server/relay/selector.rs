// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Interactive server selection.
//!
//! The user sees a numbered list of permitted servers and answers with a
//! 1-based index, `r` to refresh the directory, or `exit`. At most four
//! answers are read before the selection fails; a refresh resets the count.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use super::terminal::{Terminal, TerminalError};
use crate::server::directory::{AccessPolicy, DirectoryRegistry, RefreshHandle};

pub const HEADER: &str = "Please choose from the following servers:";
pub const PROMPT: &str = "\r\nPlease Enter A Server ID: ";
pub const ATTEMPTS_EXCEEDED: &str = "Maximum Number of Attempts Reached";

/// Answers allowed before giving up; the counter must exceed this.
const MAX_ATTEMPTS: u32 = 3;

/// Pause after clearing the screen so the client finishes redrawing.
const REDRAW_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("{ATTEMPTS_EXCEEDED}")]
    AttemptsExceeded,

    #[error("terminal error: {0}")]
    Terminal(#[from] TerminalError),
}

#[derive(Debug)]
enum State {
    Prompting,
    AwaitingInput,
    Refreshing,
    Done(Result<String, SelectionError>),
}

/// Runs the selection protocol against one policy.
pub struct Selector<'a> {
    policy: &'a AccessPolicy,
    registry: &'a DirectoryRegistry,
    refresh: &'a RefreshHandle,
    redraw_delay: Duration,
}

impl<'a> Selector<'a> {
    pub fn new(
        policy: &'a AccessPolicy,
        registry: &'a DirectoryRegistry,
        refresh: &'a RefreshHandle,
    ) -> Self {
        Self {
            policy,
            registry,
            refresh,
            redraw_delay: REDRAW_DELAY,
        }
    }

    /// Override the pause after a refresh.
    pub fn with_redraw_delay(mut self, delay: Duration) -> Self {
        self.redraw_delay = delay;
        self
    }

    /// Drive the protocol until a server is chosen or the attempts run out.
    pub async fn run<R, W>(&self, terminal: &mut Terminal<R, W>) -> Result<String, SelectionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut choices = Vec::new();
        let mut attempts: u32 = 0;
        let mut state = State::Prompting;

        loop {
            state = match state {
                State::Prompting => {
                    choices = self.policy.choices(self.registry).await;
                    terminal.write(&render(&choices)).await?;
                    State::AwaitingInput
                }
                State::AwaitingInput => {
                    if attempts > MAX_ATTEMPTS {
                        terminal.write(&format!("{ATTEMPTS_EXCEEDED}\r\n")).await?;
                        State::Done(Err(SelectionError::AttemptsExceeded))
                    } else {
                        attempts += 1;
                        terminal.write(PROMPT).await?;
                        let line = terminal.read_line().await?;
                        match line.trim() {
                            "r" => State::Refreshing,
                            "exit" => {
                                attempts = MAX_ATTEMPTS + 1;
                                State::AwaitingInput
                            }
                            answer => match pick(&choices, answer) {
                                Some(key) => State::Done(Ok(key)),
                                None => State::AwaitingInput,
                            },
                        }
                    }
                }
                State::Refreshing => {
                    if let Err(e) = self.refresh.refresh().await {
                        tracing::warn!(error = %e, "Refresh requested from selection failed");
                    }
                    attempts = 0;
                    terminal.clear_screen().await?;
                    tokio::time::sleep(self.redraw_delay).await;
                    State::Prompting
                }
                State::Done(result) => return result,
            };
        }
    }
}

fn render(choices: &[String]) -> String {
    let mut out = format!("{HEADER}\r\n");
    for (i, choice) in choices.iter().enumerate() {
        out.push_str(&format!("    [ {:2} ] {}\r\n", i + 1, choice));
    }
    out
}

/// Resolve a 1-based answer; anything else is ignored.
fn pick(choices: &[String], answer: &str) -> Option<String> {
    let index: usize = answer.parse().ok()?;
    if index == 0 {
        return None;
    }
    choices.get(index - 1).cloned()
}
