//! Pseudo-terminal plumbing
//!
//! A spawned terminal is split into a writable half owned by the session and
//! a stream of output chunks fed by a blocking reader thread. The channel
//! closes when the process exits.

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, RunboxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

/// The writable, killable half of a terminal
pub trait TerminalIo: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn kill(&mut self);
    fn has_exited(&mut self) -> bool;
}

pub struct Terminal {
    pub io: Box<dyn TerminalIo>,
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Starts an interactive process attached to a fresh terminal
pub trait TerminalSpawner: Send + Sync {
    fn spawn(&self, argv: &[String], size: TerminalSize) -> Result<Terminal>;
}

/// Real PTYs through `portable-pty`
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

struct PtyTerminal {
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    // Dropping the master hangs up the terminal
    _master: Box<dyn MasterPty + Send>,
}

impl TerminalIo for PtyTerminal {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("Kill of terminal process failed: {}", e);
        }
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)) | Err(_))
    }
}

fn start_error(what: &str, err: impl std::fmt::Display) -> RunboxError {
    RunboxError::SessionStart(format!("{}: {}", what, err))
}

impl TerminalSpawner for PtySpawner {
    fn spawn(&self, argv: &[String], size: TerminalSize) -> Result<Terminal> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| RunboxError::SessionStart("empty attach command".to_string()))?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| start_error("failed to allocate PTY pair", e))?;

        let mut builder = CommandBuilder::new(program);
        for arg in args {
            builder.arg(arg);
        }
        builder.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| start_error(&format!("failed to spawn '{}'", program), e))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| start_error("failed to clone PTY reader", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| start_error("failed to take PTY writer", e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name("runbox-pty-reader".to_string())
            .spawn(move || {
                let mut buffer = [0u8; 4096];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buffer[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // EIO once the child side hangs up
                            debug!("PTY reader stopped: {}", e);
                            break;
                        }
                    }
                }
            })
            .map_err(|e| {
                warn!("Failed to start PTY reader thread: {}", e);
                start_error("failed to start reader thread", e)
            })?;

        Ok(Terminal {
            io: Box::new(PtyTerminal {
                writer,
                child,
                _master: pair.master,
            }),
            output: rx,
        })
    }
}
