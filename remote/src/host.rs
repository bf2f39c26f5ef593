pub const DEFAULT_PORT: u16 = 22;

/// How the SSH transport authenticates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credential {
    /// Whatever the local ssh configuration and agent provide.
    #[default]
    Default,
    /// A private key file.
    KeyFile(std::path::PathBuf),
}

/// Where a host lives and how to log into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDescriptor {
    pub user: Option<String>,
    pub address: String,
    pub port: u16,
    pub credential: Credential,
}

impl HostDescriptor {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            user: None,
            address: address.into(),
            port: DEFAULT_PORT,
            credential: Credential::Default,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    /// Parses `[user@]host[:port]`. IPv6 addresses must be bracketed when a
    /// port is given, e.g. `root@[::1]:2222`.
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let re = regex::Regex::new(
            r"^(?:(?P<user>[^@]+)@)?(?P<host>\[[^\]]+\]|[^:@\[\]]+)(?::(?P<port>\d+))?$",
        )?;
        let captures = re
            .captures(spec)
            .ok_or_else(|| anyhow::anyhow!("invalid host {spec:?}, expected [user@]host[:port]"))?;
        let host = &captures["host"];
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let mut descriptor = Self::new(host);
        if let Some(user) = captures.name("user") {
            descriptor = descriptor.with_user(user.as_str());
        }
        if let Some(port) = captures.name("port") {
            let port = port
                .as_str()
                .parse::<u16>()
                .map_err(|err| anyhow::anyhow!("invalid port in {spec:?}: {err}"))?;
            descriptor = descriptor.with_port(port);
        }
        Ok(descriptor)
    }
}

impl std::fmt::Display for HostDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        if self.address.contains(':') {
            write!(f, "[{}]", self.address)?;
        } else {
            write!(f, "{}", self.address)?;
        }
        if self.port != DEFAULT_PORT {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}
