//! Spawning and controlling a child process under a pseudo terminal.
//!
//! The master side of the pty delivers the child's rendered output and
//! accepts keystrokes; the slave side is what the child sees as its
//! controlling terminal.  The traits in this crate isolate the rest of
//! the host from the platform specifics: everything upstream works in
//! terms of `MasterPty`, `SlavePty` and `Child`.
//!
//! ```no_run
//! use upterm_pty::{openpty, CommandBuilder, PtySize};
//!
//! let pair = openpty(PtySize::default())?;
//! let mut child = pair.slave.spawn_command(CommandBuilder::new("bash"))?;
//! let mut reader = pair.master.try_clone_reader()?;
//! // pump reader / write keystrokes via pair.master.take_writer()
//! # Ok::<(), anyhow::Error>(())
//! ```
use std::io::Result as IoResult;

pub mod cmdbuilder;
pub use cmdbuilder::CommandBuilder;

#[cfg(unix)]
pub mod unix;

/// The dimensions of the visible display area of the pty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    /// The number of lines of text
    pub rows: u16,
    /// The number of columns of text
    pub cols: u16,
    /// Width of a cell in pixels; some systems ignore this.
    pub pixel_width: u16,
    /// Height of a cell in pixels; some systems ignore this.
    pub pixel_height: u16,
}

impl PtySize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Default for PtySize {
    fn default() -> Self {
        PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// The master/control end of the pty.
///
/// Reading and resizing may happen concurrently from different tasks;
/// the implementation synchronizes access to the underlying descriptor.
/// Dropping the master closes the descriptor.
pub trait MasterPty: Send + Sync {
    /// Inform the kernel, and thus the child, that the window resized.
    /// Generates SIGWINCH for the child process group.
    fn resize(&self, size: PtySize) -> anyhow::Result<()>;
    /// Retrieve the size of the pty as known by the kernel.
    fn get_size(&self) -> anyhow::Result<PtySize>;
    /// Obtain a readable handle; output from the child is readable here.
    /// A read returning 0 indicates that the child side has gone away
    /// (platform EIO quirks are normalized to EOF).
    fn try_clone_reader(&self) -> anyhow::Result<Box<dyn std::io::Read + Send>>;
    /// Obtain a writable handle; data written here appears to the child
    /// as if typed on its terminal.
    fn take_writer(&self) -> anyhow::Result<Box<dyn std::io::Write + Send>>;
}

/// The slave end of the pty; used to spawn the child process.
pub trait SlavePty {
    /// Spawn the command described by the builder with the pty as its
    /// controlling terminal and stdio.
    fn spawn_command(&self, cmd: CommandBuilder) -> anyhow::Result<Box<dyn Child>>;
}

/// A child process spawned into the pty.
pub trait Child: std::fmt::Debug + Send {
    /// Poll for completion without blocking.
    fn try_wait(&mut self) -> IoResult<Option<ExitStatus>>;
    /// Terminate the child and every process in its group.  The child
    /// was made a session leader at spawn, so signalling the group
    /// guarantees that no descendant survives the pty handle.
    fn kill(&mut self) -> IoResult<()>;
    /// Block until the child has completed, yielding its exit status.
    fn wait(&mut self) -> IoResult<ExitStatus>;
    /// The child's process id.
    fn process_id(&self) -> u32;
}

/// The exit status of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    code: u32,
}

impl ExitStatus {
    pub fn with_exit_code(code: u32) -> Self {
        Self { code }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn exit_code(&self) -> u32 {
        self.code
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> ExitStatus {
        ExitStatus {
            code: status.code().map(|c| c as u32).unwrap_or(1),
        }
    }
}

/// A master/slave pair returned by `openpty`.
pub struct PtyPair {
    pub master: Box<dyn MasterPty>,
    pub slave: Box<dyn SlavePty>,
}

/// Open a new pty with the given initial size and return the pair.
#[cfg(unix)]
pub fn openpty(size: PtySize) -> anyhow::Result<PtyPair> {
    unix::openpty(size)
}
