//! Receiving half of the copy protocol (`scp -t`), run in-process by the
//! loopback session.

use anyhow::{Context, anyhow, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{self, EntryKind, RemoteEntry};

async fn ack<W: AsyncWrite + Unpin>(output: &mut W) -> anyhow::Result<()> {
    output.write_all(&[protocol::ACK]).await?;
    output.flush().await?;
    Ok(())
}

/// Writes everything pushed at `target`. When `target` is an existing directory
/// the top-level entry is created inside it, otherwise the top-level entry
/// becomes `target` itself.
pub(crate) async fn receive<R, W>(
    target: &std::path::Path,
    recursive: bool,
    input: R,
    output: &mut W,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut input = tokio::io::BufReader::new(input);
    let target_is_dir = tokio::fs::metadata(target)
        .await
        .map(|md| md.is_dir())
        .unwrap_or(false);
    let mut directories: Vec<std::path::PathBuf> = Vec::new();
    let mut line = Vec::new();
    ack(output).await?;
    loop {
        let control = match input.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        };
        line.clear();
        input.read_until(b'\n', &mut line).await?;
        let text = protocol::trim_line(&line);
        let kind = match control {
            protocol::TIMES => {
                ack(output).await?;
                continue;
            }
            protocol::END_DIR => {
                directories
                    .pop()
                    .ok_or_else(|| anyhow!("unexpected end of directory"))?;
                ack(output).await?;
                continue;
            }
            protocol::ERROR_LINE => bail!("{text}"),
            protocol::WARNING_LINE => {
                tracing::warn!("sender warning: {text}");
                continue;
            }
            protocol::FILE_HEADER => EntryKind::File,
            protocol::DIR_HEADER => EntryKind::Directory,
            other => bail!("unexpected control byte {other:#04x}"),
        };
        let entry = RemoteEntry::parse_header(kind, &text)?;
        let path = match directories.last() {
            Some(parent) => parent.join(&entry.name),
            None if target_is_dir => target.join(&entry.name),
            None => target.to_path_buf(),
        };
        match entry.kind {
            EntryKind::Directory => {
                if !recursive {
                    bail!("received directory {:?} without -r", entry.name);
                }
                if !tokio::fs::metadata(&path)
                    .await
                    .map(|md| md.is_dir())
                    .unwrap_or(false)
                {
                    tokio::fs::DirBuilder::new()
                        .mode(entry.mode)
                        .create(&path)
                        .await
                        .with_context(|| format!("{}: cannot create directory", path.display()))?;
                }
                directories.push(path);
                ack(output).await?;
            }
            EntryKind::File => {
                ack(output).await?;
                let mut file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(entry.mode)
                    .open(&path)
                    .await
                    .with_context(|| format!("{}: cannot create file", path.display()))?;
                let copied = tokio::io::copy(&mut (&mut input).take(entry.size), &mut file).await?;
                if copied != entry.size {
                    bail!(
                        "{}: truncated, expected {} bytes, got {}",
                        path.display(),
                        entry.size,
                        copied
                    );
                }
                file.flush().await?;
                let status = input.read_u8().await?;
                if status != protocol::ACK {
                    bail!("{}: sender reported failure", path.display());
                }
                ack(output).await?;
            }
        }
    }
    if !directories.is_empty() {
        bail!("stream ended inside {} open directories", directories.len());
    }
    Ok(())
}
