//! In-process session rooted at a local directory.
//!
//! Copy-program invocations (`scp -t <dir>`, `scp -f <path>`) are served by an
//! in-process implementation of the remote half of the protocol, connected to
//! the caller through in-memory pipes. Every other command runs locally via
//! `sh -c` with the root as working directory. Relative paths are resolved
//! against the root, absolute paths are used as-is.

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;

use super::{BoxedRead, BoxedWrite, Connector, ExitStatus, RemoteProcess, Session};
use crate::error::Error;
use crate::protocol::{self, Direction, ScpCommand};

mod sink;
mod source;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    root: std::path::PathBuf,
}

impl LoopbackConnector {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Connector for LoopbackConnector {
    fn connect(&self) -> BoxFuture<'_, crate::Result<Box<dyn Session>>> {
        async move {
            let metadata = tokio::fs::metadata(&self.root).await.map_err(|err| {
                Error::Connection(format!(
                    "There was an error while creating a client: {}: {err}",
                    self.root.display()
                ))
            })?;
            if !metadata.is_dir() {
                return Err(Error::Connection(format!(
                    "There was an error while creating a client: {} is not a directory",
                    self.root.display()
                )));
            }
            Ok(Box::new(LoopbackSession {
                root: self.root.clone(),
            }) as Box<dyn Session>)
        }
        .boxed()
    }
}

#[derive(Debug)]
pub struct LoopbackSession {
    root: std::path::PathBuf,
}

impl LoopbackSession {
    fn spawn_copy_program(&self, command: ScpCommand) -> RemoteProcess {
        let (client_stdin, remote_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut remote_stdout, client_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut remote_stderr, client_stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let path = self.root.join(&command.path);
        let task = tokio::spawn(async move {
            let result = match command.direction {
                Direction::Sink => {
                    sink::receive(&path, command.recursive, remote_stdin, &mut remote_stdout).await
                }
                Direction::Source => {
                    source::send(&path, command.recursive, remote_stdin, &mut remote_stdout).await
                }
            };
            match result {
                Ok(()) => 0,
                Err(err) => {
                    tracing::debug!("loopback copy program failed: {err:#}");
                    let line = format!("{}scp: {err}\n", protocol::ERROR_LINE as char);
                    // the peer may already be gone, nothing to report to then
                    let _ = remote_stdout.write_all(line.as_bytes()).await;
                    let _ = remote_stderr
                        .write_all(format!("scp: {err:#}\n").as_bytes())
                        .await;
                    1
                }
            }
        });
        let exit = async move {
            task.await
                .map(ExitStatus::from_code)
                .map_err(std::io::Error::other)
        }
        .boxed();
        RemoteProcess::new(
            Box::new(client_stdin) as BoxedWrite,
            Box::new(client_stdout) as BoxedRead,
            Box::new(client_stderr) as BoxedRead,
            exit,
        )
    }

    fn spawn_shell(&self, command: &str) -> crate::Result<RemoteProcess> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|err| {
                Error::Connection(format!(
                    "There was an error while establishing a session: {err}"
                ))
            })?;
        let missing = |stream: &str| {
            Error::Connection(format!(
                "There was an error while establishing a session: no {stream} pipe"
            ))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        let exit = async move { child.wait().await.map(ExitStatus::from) }.boxed();
        Ok(RemoteProcess::new(
            Box::new(stdin) as BoxedWrite,
            Box::new(stdout) as BoxedRead,
            Box::new(stderr) as BoxedRead,
            exit,
        ))
    }
}

impl Session for LoopbackSession {
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, crate::Result<RemoteProcess>> {
        async move {
            match ScpCommand::parse(command) {
                Some(copy) => {
                    tracing::debug!("loopback copy program: {copy:?}");
                    Ok(self.spawn_copy_program(copy))
                }
                None => {
                    tracing::debug!("loopback shell command: {command}");
                    self.spawn_shell(command)
                }
            }
        }
        .boxed()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, crate::Result<()>> {
        async { Ok(()) }.boxed()
    }
}
