/// Outcome of an operation on one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Address of the host the operation ran on.
    pub host: String,
    /// Exit code of the last remote command, `None` if it was killed by a signal
    /// or never reported one.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Response {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub(crate) fn with_output(mut self, stdout: &[u8], stderr: &[u8]) -> Self {
        self.stdout = String::from_utf8_lossy(stdout).into_owned();
        self.stderr = String::from_utf8_lossy(stderr).into_owned();
        self
    }
}
