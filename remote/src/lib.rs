//! Remote command execution and legacy `scp` copy protocol over SSH sessions
//!
//! The crate is layered bottom-up:
//!
//! - [`protocol`]: frame constants, header rendering/parsing and the remote program invocation
//! - [`push`]: the upload encoder, writes a local file or tree as a frame stream
//! - [`pull`]: the download decoder, a state machine that rebuilds a tree from a frame stream
//! - [`session`]: the seam to the transport (OpenSSH, or an in-process loopback)
//! - [`client`]: [`HostClient`], one host with a lazily opened (optionally sticky) session
//! - [`fleet`]: [`Fleet`], fan-out of one operation to many hosts with per-host result/error sinks
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> anyhow::Result<()> {
//! let host = remote::HostDescriptor::parse("deploy@10.0.0.7:2222")?;
//! let client = remote::HostClient::ssh(host, remote::ClientConfig::default());
//! let response = client.run("uname -a").await?;
//! println!("{}", response.stdout);
//! client.upload("./build/app".as_ref(), "/opt/app").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod fleet;
pub mod host;
pub mod protocol;
pub mod pull;
pub mod push;
pub mod response;
pub mod session;

pub use client::{ClientConfig, HostClient};
pub use error::{Error, Result};
pub use fleet::{Dispatch, Fleet, Host, Targets};
pub use host::{Credential, HostDescriptor};
pub use response::Response;

/// Quotes a string for safe use as a single word in a POSIX shell command.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Splits a command line into words following POSIX shell quoting rules for
/// single quotes, double quotes and backslashes. Returns `None` when a quote is
/// left unterminated. No expansion of any kind is performed.
pub fn shell_split(line: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        c => current.push(c),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => {
                            let escaped = chars.next()?;
                            if !matches!(escaped, '"' | '\\' | '$' | '`') {
                                current.push('\\');
                            }
                            current.push(escaped);
                        }
                        c => current.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                current.push(chars.next()?);
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Some(words)
}
