use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;

use super::{BoxedRead, BoxedWrite, Connector, ExitStatus, RemoteProcess, Session};
use crate::error::Error;
use crate::host::{Credential, HostDescriptor};

/// Opens OpenSSH multiplexed sessions (the local `ssh` binary and its
/// configuration, keys and agent are used).
#[derive(Debug, Clone)]
pub struct SshConnector {
    host: HostDescriptor,
    connect_timeout: Option<std::time::Duration>,
}

impl SshConnector {
    pub fn new(host: HostDescriptor) -> Self {
        Self {
            host,
            connect_timeout: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn builder(&self) -> openssh::SessionBuilder {
        let mut builder = openssh::SessionBuilder::default();
        builder
            .port(self.host.port)
            .known_hosts_check(openssh::KnownHosts::Accept);
        if let Some(user) = &self.host.user {
            builder.user(user.clone());
        }
        if let Credential::KeyFile(path) = &self.host.credential {
            builder.keyfile(path);
        }
        if let Some(timeout) = self.connect_timeout {
            builder.connect_timeout(timeout);
        }
        builder
    }
}

impl Connector for SshConnector {
    fn connect(&self) -> BoxFuture<'_, crate::Result<Box<dyn Session>>> {
        async move {
            tracing::debug!("Connecting to SSH destination: {}", self.host);
            let session = self
                .builder()
                .connect(&self.host.address)
                .await
                .map_err(|err| {
                    Error::Connection(format!(
                        "There was an error while creating a client: {err}"
                    ))
                })?;
            Ok(Box::new(SshSession {
                session: Arc::new(session),
            }) as Box<dyn Session>)
        }
        .boxed()
    }
}

#[derive(Debug)]
pub struct SshSession {
    session: Arc<openssh::Session>,
}

impl Session for SshSession {
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, crate::Result<RemoteProcess>> {
        async move {
            tracing::debug!("Running remote command: {command}");
            let mut child = self
                .session
                .clone()
                .arc_command("sh")
                .arg("-c")
                .arg(command)
                .stdin(openssh::Stdio::piped())
                .stdout(openssh::Stdio::piped())
                .stderr(openssh::Stdio::piped())
                .spawn()
                .await
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
            let stdin = child.stdin().take().ok_or_else(|| missing("stdin"))?;
            let stdout = child.stdout().take().ok_or_else(|| missing("stdout"))?;
            let stderr = child.stderr().take().ok_or_else(|| missing("stderr"))?;
            let exit = async move {
                child
                    .wait()
                    .await
                    .map(ExitStatus::from)
                    .map_err(std::io::Error::other)
            }
            .boxed();
            Ok(RemoteProcess::new(
                Box::new(stdin) as BoxedWrite,
                Box::new(stdout) as BoxedRead,
                Box::new(stderr) as BoxedRead,
                exit,
            ))
        }
        .boxed()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, crate::Result<()>> {
        async move {
            match Arc::try_unwrap(self.session) {
                Ok(session) => session.close().await.map_err(|err| {
                    Error::Connection(format!("failed to close SSH session: {err}"))
                }),
                Err(_) => {
                    // a remote process still holds the session, it goes away with it
                    tracing::debug!("SSH session still in use, leaving it to be dropped");
                    Ok(())
                }
            }
        }
        .boxed()
    }
}
