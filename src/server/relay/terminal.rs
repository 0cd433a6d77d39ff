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

//! Minimal line editor for the session channel.
//!
//! Handles what an interactive SSH client sends in raw mode: printable
//! bytes are echoed, backspace and DEL erase, CR or LF ends the line (a CR
//! LF pair counts once), Ctrl-C and Ctrl-D abort, and escape sequences such
//! as arrow keys are swallowed.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest line accepted before input is rejected.
pub const MAX_LINE: usize = 4096;

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const ESC: u8 = 0x1b;
const DEL: u8 = 0x7f;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("input aborted")]
    Aborted,

    #[error("connection closed")]
    Closed,

    #[error("line too long")]
    TooLong,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Start,
    Csi,
}

/// Line-oriented terminal over a byte stream.
pub struct Terminal<R, W> {
    reader: R,
    writer: W,
    pending: Vec<u8>,
    skip_lf: bool,
}

impl<R, W> Terminal<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            pending: Vec::new(),
            skip_lf: false,
        }
    }

    /// Write raw text to the client.
    pub async fn write(&mut self, text: &str) -> Result<(), TerminalError> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Clear the screen and home the cursor.
    pub async fn clear_screen(&mut self) -> Result<(), TerminalError> {
        self.write("\x1b[2J\x1b[H").await
    }

    /// Read one line with echo.
    pub async fn read_line(&mut self) -> Result<String, TerminalError> {
        self.read(true).await
    }

    /// Read one line without echo.
    pub async fn read_password(&mut self) -> Result<String, TerminalError> {
        self.read(false).await
    }

    /// Give back the streams, plus any bytes received after the last line.
    pub fn into_parts(self) -> (R, W, Vec<u8>) {
        (self.reader, self.writer, self.pending)
    }

    async fn next_byte(&mut self) -> Result<u8, TerminalError> {
        if self.pending.is_empty() {
            let mut buf = [0u8; 256];
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                return Err(TerminalError::Closed);
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
        Ok(self.pending.remove(0))
    }

    async fn read(&mut self, echo: bool) -> Result<String, TerminalError> {
        let mut line: Vec<u8> = Vec::new();
        let mut escape = Escape::None;

        loop {
            let byte = self.next_byte().await?;

            if std::mem::take(&mut self.skip_lf) && byte == b'\n' {
                continue;
            }

            match escape {
                Escape::Start => {
                    escape = if byte == b'[' || byte == b'O' {
                        Escape::Csi
                    } else {
                        Escape::None
                    };
                    continue;
                }
                Escape::Csi => {
                    // Parameters and intermediates run until a final byte.
                    if (0x40..=0x7e).contains(&byte) {
                        escape = Escape::None;
                    }
                    continue;
                }
                Escape::None => {}
            }

            match byte {
                b'\r' | b'\n' => {
                    self.skip_lf = byte == b'\r';
                    self.write("\r\n").await?;
                    return Ok(String::from_utf8_lossy(&line).into_owned());
                }
                CTRL_C | CTRL_D => {
                    self.write("\r\n").await?;
                    return Err(TerminalError::Aborted);
                }
                BACKSPACE | DEL => {
                    if line.pop().is_some() && echo {
                        self.write("\x08 \x08").await?;
                    }
                }
                ESC => escape = Escape::Start,
                b if b < 0x20 => {}
                b => {
                    if line.len() >= MAX_LINE {
                        return Err(TerminalError::TooLong);
                    }
                    line.push(b);
                    if echo {
                        self.writer.write_all(&[b]).await?;
                        self.writer.flush().await?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    struct Client {
        input: DuplexStream,
        output: DuplexStream,
    }

    fn terminal() -> (Terminal<DuplexStream, DuplexStream>, Client) {
        let (client_in, server_in) = duplex(8192);
        let (server_out, client_out) = duplex(8192);
        (
            Terminal::new(server_in, server_out),
            Client {
                input: client_in,
                output: client_out,
            },
        )
    }

    async fn drain(stream: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 8192];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn test_read_line_with_echo() {
        let (mut term, mut client) = terminal();
        client.input.write_all(b"12\r").await.unwrap();

        assert_eq!(term.read_line().await.unwrap(), "12");
        assert_eq!(drain(&mut client.output).await, "12\r\n");
    }

    #[tokio::test]
    async fn test_crlf_counts_once() {
        let (mut term, mut client) = terminal();
        client.input.write_all(b"a\r\nb\n").await.unwrap();

        assert_eq!(term.read_line().await.unwrap(), "a");
        assert_eq!(term.read_line().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_backspace_and_escape_sequences() {
        let (mut term, mut client) = terminal();
        client
            .input
            .write_all(b"ex\x1b[Ait\x7f\x7fit\x1bOB\r")
            .await
            .unwrap();

        assert_eq!(term.read_line().await.unwrap(), "exit");
    }

    #[tokio::test]
    async fn test_password_not_echoed() {
        let (mut term, mut client) = terminal();
        client.input.write_all(b"hunter2\r").await.unwrap();

        assert_eq!(term.read_password().await.unwrap(), "hunter2");
        assert_eq!(drain(&mut client.output).await, "\r\n");
    }

    #[tokio::test]
    async fn test_ctrl_c_aborts() {
        let (mut term, mut client) = terminal();
        client.input.write_all(b"1\x03").await.unwrap();
        assert!(matches!(term.read_line().await, Err(TerminalError::Aborted)));
    }

    #[tokio::test]
    async fn test_closed_stream() {
        let (mut term, client) = terminal();
        drop(client.input);
        assert!(matches!(term.read_line().await, Err(TerminalError::Closed)));
    }

    #[tokio::test]
    async fn test_leftover_bytes_kept() {
        let (mut term, mut client) = terminal();
        client.input.write_all(b"1\rls\r").await.unwrap();

        assert_eq!(term.read_line().await.unwrap(), "1");
        let (_, _, leftover) = term.into_parts();
        assert_eq!(leftover, b"ls\r");
    }
}
