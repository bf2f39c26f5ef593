//! The transport seam: something that can be connected to, and a connected
//! session that can spawn remote processes with piped standard streams.
//!
//! Two implementations are provided:
//! - [`ssh::SshConnector`]: OpenSSH multiplexed sessions via the `openssh` crate
//! - [`loopback::LoopbackConnector`]: an in-process "remote" rooted at a local directory

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod loopback;
pub mod ssh;

/// Type alias for boxed write stream (remote stdin)
pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;
/// Type alias for boxed read stream (remote stdout/stderr)
pub type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;

/// Exit status of a remote process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    code: Option<i32>,
}

impl ExitStatus {
    pub fn from_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    /// The process ended without an exit code, e.g. it was killed by a signal.
    pub fn unknown() -> Self {
        Self { code: None }
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit status {code}"),
            None => write!(f, "unknown exit status"),
        }
    }
}

/// A spawned remote process. The standard streams are handed out once; the
/// exit future resolves when the remote process is gone.
pub struct RemoteProcess {
    stdin: Option<BoxedWrite>,
    stdout: Option<BoxedRead>,
    stderr: Option<BoxedRead>,
    exit: BoxFuture<'static, std::io::Result<ExitStatus>>,
}

impl RemoteProcess {
    pub fn new(
        stdin: BoxedWrite,
        stdout: BoxedRead,
        stderr: BoxedRead,
        exit: BoxFuture<'static, std::io::Result<ExitStatus>>,
    ) -> Self {
        Self {
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr: Some(stderr),
            exit,
        }
    }

    pub fn take_stdin(&mut self) -> Option<BoxedWrite> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<BoxedRead> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<BoxedRead> {
        self.stderr.take()
    }

    /// Waits for the remote process to exit. Streams that were not taken are
    /// closed first so the remote side is not left waiting on them.
    pub async fn wait(self) -> std::io::Result<ExitStatus> {
        let Self {
            stdin,
            stdout,
            stderr,
            exit,
        } = self;
        drop(stdin);
        drop(stdout);
        drop(stderr);
        exit.await
    }
}

impl std::fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcess")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish_non_exhaustive()
    }
}

/// An open session to one host.
pub trait Session: Send + Sync {
    /// Starts `command` on the remote host. The command line is interpreted by
    /// the remote shell.
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, crate::Result<RemoteProcess>>;

    /// Tears the session down.
    fn close(self: Box<Self>) -> BoxFuture<'static, crate::Result<()>>;
}

/// Opens sessions to one host.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, crate::Result<Box<dyn Session>>>;
}
