//! Upload encoder.
//!
//! Serializes a local file or tree as a continuous frame stream. The encoder
//! never waits for the receiver's acknowledgements: whatever the receiver sends
//! back ends up on the remote process' stdout, which the caller captures.

use async_recursion::async_recursion;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

use crate::error::{Error, LocalIoContext, Result};
use crate::protocol::{self, RemoteEntry, TransferSummary, stream_error};

async fn write_frame<W: AsyncWrite + Unpin + Send>(output: &mut W, frame: &[u8]) -> Result<()> {
    output.write_all(frame).await.map_err(stream_error)
}

fn entry_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string())
}

async fn push_file<W: AsyncWrite + Unpin + Send>(
    path: &std::path::Path,
    name: &str,
    output: &mut W,
    summary: &mut TransferSummary,
) -> Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .local_context(|| format!("failed opening {:?} for upload", path))?;
    let size = file
        .metadata()
        .await
        .local_context(|| format!("failed reading metadata of {:?}", path))?
        .len();
    let header = RemoteEntry::file(name, protocol::PUSH_FILE_MODE, size).header_line();
    write_frame(output, header.as_bytes()).await?;
    let mut remaining = size;
    let mut buffer = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = buffer.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let read = file
            .read(&mut buffer[..want])
            .await
            .local_context(|| format!("failed reading {:?}", path))?;
        if read == 0 {
            return Err(Error::local_io(anyhow::anyhow!(
                "{:?} shrank while uploading, {} of {} bytes missing",
                path,
                remaining,
                size
            )));
        }
        write_frame(output, &buffer[..read]).await?;
        remaining -= read as u64;
    }
    write_frame(output, &[protocol::ACK]).await?;
    summary.files += 1;
    summary.bytes += size;
    tracing::debug!("sent file {:?} as {:?} ({} bytes)", path, name, size);
    Ok(())
}

#[async_recursion]
async fn push_directory<W: AsyncWrite + Unpin + Send>(
    path: &std::path::Path,
    name: &str,
    output: &mut W,
    summary: &mut TransferSummary,
) -> Result<()> {
    let mut entries = tokio::fs::read_dir(path)
        .await
        .local_context(|| format!("cannot open directory {:?} for reading", path))?;
    let header = RemoteEntry::directory(name, protocol::PUSH_DIR_MODE).header_line();
    write_frame(output, header.as_bytes()).await?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .local_context(|| format!("failed traversing directory {:?}", path))?
    {
        let entry_path = entry.path();
        // follows symlinks, a dangling link shows up as an error here
        let metadata = match tokio::fs::metadata(&entry_path).await {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::warn!("skipping {:?}: {}", entry_path, err);
                continue;
            }
        };
        let child_name = entry_name(&entry_path);
        if metadata.is_dir() {
            push_directory(&entry_path, &child_name, output, summary).await?;
        } else if metadata.is_file() {
            push_file(&entry_path, &child_name, output, summary).await?;
        } else {
            tracing::warn!(
                "skipping {:?}: neither a regular file nor a directory",
                entry_path
            );
        }
    }
    write_frame(output, b"E\n").await?;
    summary.directories += 1;
    Ok(())
}

/// Writes `local_path` to `output` as a frame stream whose top-level entry is
/// called `name`, then shuts the stream down so the receiver sees the end of
/// input.
#[instrument(skip(output))]
pub async fn encode<W: AsyncWrite + Unpin + Send>(
    local_path: &std::path::Path,
    name: &str,
    output: W,
) -> Result<TransferSummary> {
    let metadata = tokio::fs::metadata(local_path)
        .await
        .local_context(|| format!("failed reading metadata of {:?}", local_path))?;
    let mut output = tokio::io::BufWriter::new(output);
    let mut summary = TransferSummary::default();
    if metadata.is_dir() {
        push_directory(local_path, name, &mut output, &mut summary).await?;
    } else if metadata.is_file() {
        push_file(local_path, name, &mut output, &mut summary).await?;
    } else {
        return Err(Error::local_io(anyhow::anyhow!(
            "{:?} is neither a regular file nor a directory",
            local_path
        )));
    }
    output.flush().await.map_err(stream_error)?;
    output.shutdown().await.map_err(stream_error)?;
    tracing::info!("upload of {:?} done, {}", local_path, summary);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_is_sent_with_fixed_mode_and_trailing_nul() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("local.txt");
        tokio::fs::write(&path, b"hello").await?;
        let mut output = Vec::new();
        let summary = encode(&path, "renamed.txt", &mut output).await?;
        assert_eq!(output, b"C0644 5 renamed.txt\nhello\0");
        assert_eq!(summary.files, 1);
        assert_eq!(summary.bytes, 5);
        Ok(())
    }

    #[tokio::test]
    async fn empty_file_still_gets_its_terminator() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("empty");
        tokio::fs::write(&path, b"").await?;
        let mut output = Vec::new();
        encode(&path, "empty", &mut output).await?;
        assert_eq!(output, b"C0644 0 empty\n\0");
        Ok(())
    }

    #[tokio::test]
    async fn directory_tree_is_bracketed_by_headers() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let root = tmp_dir.path().join("tree");
        tokio::fs::create_dir_all(root.join("sub")).await?;
        tokio::fs::write(root.join("sub").join("leaf"), b"xy").await?;
        let mut output = Vec::new();
        let summary = encode(&root, "top", &mut output).await?;
        assert_eq!(output, b"D0755 0 top\nD0755 0 sub\nC0644 2 leaf\nxy\0E\nE\n");
        assert_eq!(summary.directories, 2);
        assert_eq!(summary.files, 1);
        Ok(())
    }

    #[tokio::test]
    async fn dangling_links_are_skipped() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let root = tmp_dir.path().join("tree");
        tokio::fs::create_dir(&root).await?;
        tokio::fs::symlink(tmp_dir.path().join("missing"), root.join("dangling")).await?;
        let mut output = Vec::new();
        encode(&root, "tree", &mut output).await?;
        assert_eq!(output, b"D0755 0 tree\nE\n");
        Ok(())
    }

    #[tokio::test]
    async fn missing_local_path_is_a_local_error() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut output = Vec::new();
        let err = encode(&tmp_dir.path().join("nope"), "nope", &mut output)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LocalIo { .. }), "{err:?}");
        assert!(output.is_empty());
    }
}
