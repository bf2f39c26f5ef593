//! Sending half of the copy protocol (`scp -f`), run in-process by the
//! loopback session.

use anyhow::{Context, bail};
use async_recursion::async_recursion;
use std::os::unix::fs::PermissionsExt;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
};

use crate::protocol::{self, RemoteEntry};

/// Waits for the receiver to accept the previous frame.
async fn expect_ack<R: AsyncBufRead + Unpin>(input: &mut R) -> anyhow::Result<()> {
    let status = input
        .read_u8()
        .await
        .context("receiver closed the stream")?;
    if status == protocol::ACK {
        return Ok(());
    }
    let mut line = Vec::new();
    input.read_until(b'\n', &mut line).await?;
    bail!("receiver refused: {}", protocol::trim_line(&line))
}

#[async_recursion]
async fn send_entry<R, W>(
    path: &std::path::Path,
    input: &mut R,
    output: &mut W,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("{}: No such file or directory", path.display()))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());
    let mode = metadata.permissions().mode() & 0o7777;
    if metadata.is_dir() {
        let header = RemoteEntry::directory(name, mode).header_line();
        output.write_all(header.as_bytes()).await?;
        output.flush().await?;
        expect_ack(input).await?;
        let mut entries = tokio::fs::read_dir(path)
            .await
            .with_context(|| format!("{}: cannot read directory", path.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            send_entry(&entry.path(), input, output).await?;
        }
        output.write_all(b"E\n").await?;
        output.flush().await?;
        return expect_ack(input).await;
    }
    if !metadata.is_file() {
        bail!("{}: not a regular file", path.display());
    }
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("{}: cannot open", path.display()))?;
    let header = RemoteEntry::file(name, mode, metadata.len()).header_line();
    output.write_all(header.as_bytes()).await?;
    output.flush().await?;
    expect_ack(input).await?;
    let sent = tokio::io::copy(&mut (&mut file).take(metadata.len()), output).await?;
    if sent != metadata.len() {
        bail!("{}: file shrank while sending", path.display());
    }
    output.write_all(&[protocol::ACK]).await?;
    output.flush().await?;
    expect_ack(input).await
}

/// Sends `path` (a file, or with `recursive` a whole tree) to the receiver.
/// The stream simply ends after the last entry, like the real program does.
pub(crate) async fn send<R, W>(
    path: &std::path::Path,
    recursive: bool,
    input: R,
    output: &mut W,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut input = tokio::io::BufReader::new(input);
    expect_ack(&mut input).await?;
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("{}: No such file or directory", path.display()))?;
    if metadata.is_dir() && !recursive {
        bail!("{}: not a regular file", path.display());
    }
    send_entry(path, &mut input, output).await
}
