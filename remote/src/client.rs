//! One host: command execution, scripts, file transfer and edit-in-place.
//!
//! Every call runs on one session. Without sticky mode that session is opened
//! for the call and closed when the call ends, whatever the outcome. In sticky
//! mode the session is kept in the client until [`HostClient::close_session`];
//! calls on one sticky client are serialized on it.

use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::instrument;

use crate::error::{Error, LocalIoContext, Result};
use crate::host::HostDescriptor;
use crate::protocol::{ScpCommand, stream_error};
use crate::response::Response;
use crate::session::{BoxedRead, Connector, ExitStatus, RemoteProcess, Session, ssh};
use crate::{pull, push, shell_escape};

const EXEC_PREFIX: &str = "There was an error while executing the command: ";
const UPLOAD_PREFIX: &str = "There was an error while uploading: ";
const DOWNLOAD_PREFIX: &str = "There was an error while downloading: ";

/// Per-host client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Keep one session open across calls until [`HostClient::close_session`].
    pub sticky: bool,
    /// Copy program started on the remote side for transfers.
    pub scp_program: String,
    /// Where [`HostClient::run_script`] puts the script on the remote host.
    pub script_path: String,
    /// Bound on establishing the SSH connection, `None` leaves it to ssh.
    pub connect_timeout: Option<std::time::Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sticky: false,
            scp_program: "scp".to_string(),
            script_path: "/tmp/fleet-script".to_string(),
            connect_timeout: None,
        }
    }
}

enum SessionState {
    Closed,
    Open(Box<dyn Session>),
}

/// A session lent to one call.
enum Lease<'a> {
    Scoped(Box<dyn Session>),
    Sticky(tokio::sync::MappedMutexGuard<'a, Box<dyn Session>>),
}

impl Lease<'_> {
    fn session(&self) -> &dyn Session {
        match self {
            Lease::Scoped(session) => &**session,
            Lease::Sticky(session) => &***session,
        }
    }

    async fn release(self) {
        let Lease::Scoped(session) = self else {
            return;
        };
        if let Err(err) = session.close().await {
            tracing::warn!("failed to close session: {err}");
        }
    }
}

async fn read_all(stream: Option<BoxedRead>) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buffer).await.map_err(stream_error)?;
    }
    Ok(buffer)
}

fn split_remote_path(remote_path: &str) -> Result<(String, String)> {
    let path = std::path::Path::new(remote_path);
    let name = path
        .file_name()
        .ok_or_else(|| Error::Protocol(format!("remote path {remote_path:?} has no file name")))?
        .to_string_lossy()
        .into_owned();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().into_owned(),
        _ => ".".to_string(),
    };
    Ok((dir, name))
}

pub struct HostClient {
    host: HostDescriptor,
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    state: tokio::sync::Mutex<SessionState>,
}

impl std::fmt::Debug for HostClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostClient")
            .field("host", &self.host)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HostClient {
    pub fn new(host: HostDescriptor, connector: Arc<dyn Connector>, config: ClientConfig) -> Self {
        Self {
            host,
            connector,
            config,
            state: tokio::sync::Mutex::new(SessionState::Closed),
        }
    }

    /// Client that reaches `host` through OpenSSH.
    pub fn ssh(host: HostDescriptor, config: ClientConfig) -> Self {
        let connector =
            ssh::SshConnector::new(host.clone()).with_connect_timeout(config.connect_timeout);
        Self::new(host, Arc::new(connector), config)
    }

    pub fn host(&self) -> &HostDescriptor {
        &self.host
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn acquire(&self) -> Result<Lease<'_>> {
        if !self.config.sticky {
            return Ok(Lease::Scoped(self.connector.connect().await?));
        }
        let mut state = self.state.lock().await;
        if let SessionState::Closed = *state {
            tracing::debug!("opening sticky session to {}", self.host);
            *state = SessionState::Open(self.connector.connect().await?);
        }
        tokio::sync::MutexGuard::try_map(state, |state| match state {
            SessionState::Open(session) => Some(session),
            SessionState::Closed => None,
        })
        .map(Lease::Sticky)
        .map_err(|_| {
            Error::Connection(
                "There was an error while establishing a session: no open session".to_string(),
            )
        })
    }

    /// Gives the lease back. A sticky session whose transport failed is
    /// dropped so the next call reconnects.
    async fn finish<T>(&self, lease: Lease<'_>, result: Result<T>) -> Result<T> {
        let sticky = matches!(lease, Lease::Sticky(_));
        lease.release().await;
        if sticky && matches!(result, Err(Error::Connection(_))) {
            tracing::warn!("sticky session to {} is broken, dropping it", self.host);
            if let Err(err) = self.close_session().await {
                tracing::debug!("failed closing broken session to {}: {err}", self.host);
            }
        }
        result
    }

    fn response(&self) -> Response {
        Response::new(self.host.address.clone())
    }

    fn check_status(
        &self,
        mut response: Response,
        status: ExitStatus,
        prefix: &str,
    ) -> Result<Response> {
        response.exit_code = status.code();
        if status.success() {
            return Ok(response);
        }
        Err(Error::CommandFailed {
            message: format!("{prefix}{status}"),
            status,
            response: Box::new(response),
        })
    }

    async fn wait(process: RemoteProcess, prefix: &str) -> Result<ExitStatus> {
        process
            .wait()
            .await
            .map_err(|err| Error::Connection(format!("{prefix}{err}")))
    }

    async fn run_in(&self, session: &dyn Session, command: &str) -> Result<Response> {
        let mut process = session.exec(command).await?;
        // nothing is fed to plain commands
        drop(process.take_stdin());
        let stdout = process.take_stdout();
        let stderr = process.take_stderr();
        let (stdout, stderr, status) = tokio::join!(
            read_all(stdout),
            read_all(stderr),
            Self::wait(process, EXEC_PREFIX)
        );
        let response = self.response().with_output(&stdout?, &stderr?);
        self.check_status(response, status?, EXEC_PREFIX)
    }

    async fn upload_in(
        &self,
        session: &dyn Session,
        local_path: &std::path::Path,
        remote_path: &str,
    ) -> Result<Response> {
        let (remote_dir, name) = split_remote_path(remote_path)?;
        let command = ScpCommand::sink(&self.config.scp_program, &remote_dir).to_command_line();
        let mut process = session.exec(&command).await?;
        let stdin = process.take_stdin().ok_or_else(|| {
            Error::Connection(format!("{UPLOAD_PREFIX}remote stdin is not available"))
        })?;
        let stdout = process.take_stdout();
        let stderr = process.take_stderr();
        let (encoded, stdout, stderr, status) = tokio::join!(
            push::encode(local_path, &name, stdin),
            read_all(stdout),
            read_all(stderr),
            Self::wait(process, UPLOAD_PREFIX)
        );
        match encoded {
            // the receiver went away, its exit status tells why
            Err(Error::Connection(reason))
                if status.as_ref().is_ok_and(|status| !status.success()) =>
            {
                tracing::debug!("upload stream closed early: {reason}");
            }
            Err(err) => return Err(err),
            Ok(summary) => tracing::debug!("uploaded {:?}: {}", local_path, summary),
        }
        let response = self.response().with_output(&stdout?, &stderr?);
        self.check_status(response, status?, UPLOAD_PREFIX)
    }

    async fn download_in(
        &self,
        session: &dyn Session,
        remote_path: &str,
        local_path: &std::path::Path,
    ) -> Result<Response> {
        let command = ScpCommand::source(&self.config.scp_program, remote_path).to_command_line();
        let mut process = session.exec(&command).await?;
        let stdin = process.take_stdin();
        let stdout = process.take_stdout();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            return Err(Error::Connection(format!(
                "{DOWNLOAD_PREFIX}remote streams are not available"
            )));
        };
        let stderr = process.take_stderr();
        let (decoded, stderr, status) = tokio::join!(
            pull::decode(local_path, stdout, stdin),
            read_all(stderr),
            Self::wait(process, DOWNLOAD_PREFIX)
        );
        let summary = decoded?;
        tracing::debug!("downloaded {remote_path:?}: {summary}");
        let response = self.response().with_output(&[], &stderr?);
        self.check_status(response, status?, DOWNLOAD_PREFIX)
    }

    async fn run_on_file_in<F>(
        &self,
        session: &dyn Session,
        remote_path: &str,
        transform: F,
    ) -> Result<Response>
    where
        F: FnOnce(String) -> String + Send,
    {
        let (_, name) = split_remote_path(remote_path)?;
        let tmp_dir = tempfile::tempdir().local_context(|| "failed creating a temporary directory")?;
        let local_path = tmp_dir.path().join(name);
        self.download_in(session, remote_path, &local_path).await?;
        let content = tokio::fs::read_to_string(&local_path)
            .await
            .local_context(|| format!("failed reading downloaded {:?}", local_path))?;
        let content = transform(content);
        tokio::fs::write(&local_path, content)
            .await
            .local_context(|| format!("failed writing {:?}", local_path))?;
        self.run_in(session, &format!("rm -f {}", shell_escape(remote_path)))
            .await?;
        self.upload_in(session, &local_path, remote_path).await
    }

    /// Runs `command` through the remote shell and captures its output.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn run(&self, command: &str) -> Result<Response> {
        let lease = self.acquire().await?;
        let result = self.run_in(lease.session(), command).await;
        self.finish(lease, result).await
    }

    /// Uploads a local script to [`ClientConfig::script_path`], makes it
    /// executable and runs it.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn run_script(&self, local_script: &std::path::Path) -> Result<Response> {
        let lease = self.acquire().await?;
        let session = lease.session();
        let script = shell_escape(&self.config.script_path);
        let result = match self.upload_in(session, local_script, &self.config.script_path).await {
            Ok(_) => {
                self.run_in(session, &format!("chmod +x {script} && {script}"))
                    .await
            }
            Err(err) => Err(err),
        };
        self.finish(lease, result).await
    }

    /// Downloads `remote_path`, passes its content through `transform` and
    /// writes the result back to the same remote path.
    #[instrument(skip(self, transform), fields(host = %self.host))]
    pub async fn run_on_file<F>(&self, remote_path: &str, transform: F) -> Result<Response>
    where
        F: FnOnce(String) -> String + Send,
    {
        let lease = self.acquire().await?;
        let result = self
            .run_on_file_in(lease.session(), remote_path, transform)
            .await;
        self.finish(lease, result).await
    }

    /// Copies a local file or directory to `remote_path`. The remote parent
    /// directory must exist; the top-level entry is named after the last
    /// component of `remote_path`.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn upload(&self, local_path: &std::path::Path, remote_path: &str) -> Result<Response> {
        let lease = self.acquire().await?;
        let result = self.upload_in(lease.session(), local_path, remote_path).await;
        self.finish(lease, result).await
    }

    /// Copies a remote file or directory to `local_path`. See
    /// [`pull::NamingPolicy`] for how the local name is chosen.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn download(&self, remote_path: &str, local_path: &std::path::Path) -> Result<Response> {
        let lease = self.acquire().await?;
        let result = self.download_in(lease.session(), remote_path, local_path).await;
        self.finish(lease, result).await
    }

    /// Opens the sticky session now instead of on first use. Without sticky
    /// mode this only checks that a session can be established.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn open_session(&self) -> Result<()> {
        let lease = self.acquire().await?;
        lease.release().await;
        Ok(())
    }

    /// Closes the sticky session, if one is open.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn close_session(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock().await, SessionState::Closed);
        match previous {
            SessionState::Open(session) => {
                tracing::debug!("closing sticky session to {}", self.host);
                session.close().await
            }
            SessionState::Closed => Ok(()),
        }
    }
}
