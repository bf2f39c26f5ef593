//! Fan-out of one operation to many hosts.
//!
//! Every targeted host gets its own task which performs the host call and
//! delivers exactly one value: the response to the host's result sink, or the
//! error to its error sink. Tasks share nothing and are not ordered relative to
//! each other. The caller is expected to drain the sinks.

use std::future::Future;
use std::sync::Arc;

use crate::client::HostClient;
use crate::error::{Error, Result};
use crate::response::Response;

/// Edit applied to a remote file's content by [`Fleet::run_on_file`].
pub type Transform = Arc<dyn Fn(String) -> String + Send + Sync>;

/// A fleet member together with the sinks its outcomes go to. Several hosts
/// may share the same sinks.
#[derive(Debug, Clone)]
pub struct Host {
    pub client: Arc<HostClient>,
    pub results: async_channel::Sender<Response>,
    pub errors: async_channel::Sender<Error>,
}

impl Host {
    pub fn new(
        client: Arc<HostClient>,
        results: async_channel::Sender<Response>,
        errors: async_channel::Sender<Error>,
    ) -> Self {
        Self {
            client,
            results,
            errors,
        }
    }
}

/// Which fleet members an operation goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    All,
    /// Positions in the fleet, as passed to [`Fleet::new`]. Repeated indices
    /// are targeted once.
    Only(Vec<usize>),
}

/// Tasks started by one dispatch. Dropping it leaves them running.
#[derive(Debug)]
#[must_use = "dropping the dispatch detaches the host tasks, call join() to wait for them"]
pub struct Dispatch {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Dispatch {
    /// Number of hosts the operation was started on.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits until every host task has delivered its outcome.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!("host task failed: {err}");
            }
        }
    }
}

/// Fixed, ordered set of hosts.
#[derive(Debug, Clone)]
pub struct Fleet {
    hosts: Vec<Host>,
}

impl Fleet {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self { hosts }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    fn resolve(&self, targets: &Targets) -> Result<Vec<usize>> {
        match targets {
            Targets::All => Ok((0..self.hosts.len()).collect()),
            Targets::Only(indices) => {
                let mut resolved = Vec::with_capacity(indices.len());
                for &index in indices {
                    if index >= self.hosts.len() {
                        return Err(Error::InvalidTarget {
                            index,
                            len: self.hosts.len(),
                        });
                    }
                    if !resolved.contains(&index) {
                        resolved.push(index);
                    }
                }
                Ok(resolved)
            }
        }
    }

    fn dispatch<F, Fut>(&self, targets: &Targets, operation: F) -> Result<Dispatch>
    where
        F: Fn(usize, Arc<HostClient>) -> Fut,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        let indices = self.resolve(targets)?;
        tracing::debug!("dispatching to hosts {:?}", indices);
        let handles = indices
            .into_iter()
            .map(|index| {
                let host = &self.hosts[index];
                let call = operation(index, host.client.clone());
                let results = host.results.clone();
                let errors = host.errors.clone();
                tokio::spawn(async move {
                    match call.await {
                        Ok(response) => {
                            if results.send(response).await.is_err() {
                                tracing::warn!("result sink of host {index} is closed");
                            }
                        }
                        Err(err) => {
                            tracing::debug!("host {index} failed: {err}");
                            if errors.send(err).await.is_err() {
                                tracing::warn!("error sink of host {index} is closed");
                            }
                        }
                    }
                })
            })
            .collect();
        Ok(Dispatch { handles })
    }

    pub fn run(&self, targets: &Targets, command: &str) -> Result<Dispatch> {
        self.dispatch(targets, |_, client| {
            let command = command.to_string();
            async move { client.run(&command).await }
        })
    }

    pub fn run_script(&self, targets: &Targets, local_script: &std::path::Path) -> Result<Dispatch> {
        self.dispatch(targets, |_, client| {
            let local_script = local_script.to_path_buf();
            async move { client.run_script(&local_script).await }
        })
    }

    pub fn upload(
        &self,
        targets: &Targets,
        local_path: &std::path::Path,
        remote_path: &str,
    ) -> Result<Dispatch> {
        self.dispatch(targets, |_, client| {
            let local_path = local_path.to_path_buf();
            let remote_path = remote_path.to_string();
            async move { client.upload(&local_path, &remote_path).await }
        })
    }

    /// Downloads `remote_path` from each host to `local_path` suffixed with the
    /// host's position, e.g. `out.log0`, `out.log1`.
    pub fn download(
        &self,
        targets: &Targets,
        remote_path: &str,
        local_path: &std::path::Path,
    ) -> Result<Dispatch> {
        self.dispatch(targets, |index, client| {
            let local_path = indexed_path(local_path, index);
            let remote_path = remote_path.to_string();
            async move { client.download(&remote_path, &local_path).await }
        })
    }

    pub fn run_on_file(
        &self,
        targets: &Targets,
        remote_path: &str,
        transform: Transform,
    ) -> Result<Dispatch> {
        self.dispatch(targets, |_, client| {
            let remote_path = remote_path.to_string();
            let transform = transform.clone();
            async move {
                client
                    .run_on_file(&remote_path, move |content| transform(content))
                    .await
            }
        })
    }
}

/// Appends the fleet position to a local path.
pub fn indexed_path(path: &std::path::Path, index: usize) -> std::path::PathBuf {
    let mut indexed = path.as_os_str().to_owned();
    indexed.push(index.to_string());
    indexed.into()
}
