//! Download decoder.
//!
//! Reads frames sent by the remote source program, rebuilds the files and
//! directories they describe under a local destination and acknowledges each
//! frame. Already written files are left in place when the transfer fails.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

use crate::error::{Error, LocalIoContext, Result};
use crate::protocol::{self, EntryKind, RemoteEntry, TransferSummary, stream_error};

/// Upper bound of a single read of file content off the stream.
pub const CHUNK_SIZE: usize = 4096;

/// Where the top-level entry of a download lands and what it is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingPolicy {
    pub destination: std::path::PathBuf,
    /// Name given to the first entry of the stream instead of the one the
    /// remote side sends. `None` keeps the remote name.
    pub specified_name: Option<String>,
}

impl NamingPolicy {
    /// Decides from the current state of `target`:
    /// - missing: create `target` itself
    /// - existing directory: put the remote entry inside it, keeping its name
    /// - existing file: overwrite `target`
    pub async fn for_target(target: &std::path::Path) -> Result<Self> {
        let is_dir = match tokio::fs::metadata(target).await {
            Ok(metadata) => metadata.is_dir(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => {
                return Err(Error::local_io(anyhow::Error::new(err).context(format!(
                    "failed reading metadata of {:?}",
                    target
                ))));
            }
        };
        if is_dir {
            return Ok(Self {
                destination: target.to_path_buf(),
                specified_name: None,
            });
        }
        let name = target.file_name().ok_or_else(|| {
            Error::local_io(anyhow::anyhow!("{:?} does not name a file", target))
        })?;
        let destination = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        Ok(Self {
            destination,
            specified_name: Some(name.to_string_lossy().into_owned()),
        })
    }
}

/// Current destination directory of a download. Each `D` frame descends one
/// level and each `E` frame goes back to the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCursor {
    current: std::path::PathBuf,
    depth: usize,
}

impl TransferCursor {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            current: root.into(),
            depth: 0,
        }
    }

    pub fn current(&self) -> &std::path::Path {
        &self.current
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn descend(&mut self, name: &str) {
        self.current.push(name);
        self.depth += 1;
    }

    pub fn ascend(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::Protocol(
                "end of directory received outside of any directory".to_string(),
            ));
        }
        self.current.pop();
        self.depth -= 1;
        Ok(())
    }
}

#[derive(Debug)]
enum DecoderState {
    AwaitFrame,
    InDirectory(usize),
    Done,
    Failed(Error),
}

impl DecoderState {
    fn after_cursor_move(cursor: &TransferCursor) -> Self {
        match cursor.depth() {
            0 => DecoderState::AwaitFrame,
            depth => DecoderState::InDirectory(depth),
        }
    }
}

struct Decoder<R, W> {
    input: tokio::io::BufReader<R>,
    output: W,
    cursor: TransferCursor,
    specified_name: Option<String>,
    summary: TransferSummary,
    line: Vec<u8>,
}

impl<R, W> Decoder<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn ack(&mut self) -> Result<()> {
        self.output
            .write_all(&[protocol::ACK])
            .await
            .map_err(stream_error)?;
        self.output.flush().await.map_err(stream_error)
    }

    async fn read_line(&mut self) -> Result<String> {
        self.line.clear();
        self.input
            .read_until(b'\n', &mut self.line)
            .await
            .map_err(stream_error)?;
        Ok(protocol::trim_line(&self.line))
    }

    /// Only the first entry of the stream may be renamed.
    fn next_name(&mut self, remote_name: &str) -> String {
        self.specified_name
            .take()
            .unwrap_or_else(|| remote_name.to_string())
    }

    async fn step(&mut self, state: DecoderState) -> Result<DecoderState> {
        if let DecoderState::InDirectory(depth) = &state {
            tracing::trace!("awaiting frame at depth {depth} in {:?}", self.cursor.current());
        }
        let control = match self.input.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(DecoderState::Done);
            }
            Err(err) => return Err(stream_error(err)),
        };
        match control {
            protocol::ACK => Ok(state),
            protocol::END_DIR => {
                self.read_line().await?;
                self.cursor.ascend()?;
                self.ack().await?;
                Ok(DecoderState::after_cursor_move(&self.cursor))
            }
            protocol::STREAM_END => {
                self.ack().await?;
                Ok(DecoderState::Done)
            }
            protocol::ERROR_LINE => {
                let text = self.read_line().await?;
                Err(Error::Remote(text))
            }
            protocol::WARNING_LINE => {
                let text = self.read_line().await?;
                tracing::warn!("remote warning: {text}");
                Ok(state)
            }
            protocol::DIR_HEADER => {
                let line = self.read_line().await?;
                let entry = RemoteEntry::parse_header(EntryKind::Directory, &line)?;
                self.ack().await?;
                let name = self.next_name(&entry.name);
                self.cursor.descend(&name);
                let path = self.cursor.current();
                tokio::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(entry.mode)
                    .create(path)
                    .await
                    .local_context(|| format!("cannot create directory {:?}", path))?;
                self.summary.directories += 1;
                Ok(DecoderState::after_cursor_move(&self.cursor))
            }
            protocol::FILE_HEADER => {
                let line = self.read_line().await?;
                let entry = RemoteEntry::parse_header(EntryKind::File, &line)?;
                self.ack().await?;
                let name = self.next_name(&entry.name);
                let path = self.cursor.current().join(&name);
                self.receive_file(&path, &entry).await?;
                Ok(state)
            }
            other => {
                tracing::debug!("stopping at unknown control byte {other:#04x}");
                Ok(DecoderState::Done)
            }
        }
    }

    async fn receive_file(&mut self, path: &std::path::Path, entry: &RemoteEntry) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(entry.mode)
            .open(path)
            .await
            .local_context(|| format!("cannot open {:?} for writing", path))?;
        let mut buffer = [0u8; CHUNK_SIZE];
        let mut remaining = entry.size;
        while remaining > 0 {
            let want = CHUNK_SIZE.min(usize::try_from(remaining).unwrap_or(CHUNK_SIZE));
            let read = self
                .input
                .read(&mut buffer[..want])
                .await
                .map_err(stream_error)?;
            if read == 0 {
                return Err(Error::Protocol(format!(
                    "stream ended inside {:?}, {} of {} bytes missing",
                    entry.name, remaining, entry.size
                )));
            }
            file.write_all(&buffer[..read])
                .await
                .local_context(|| format!("failed writing {:?}", path))?;
            remaining -= read as u64;
        }
        file.flush()
            .await
            .local_context(|| format!("failed writing {:?}", path))?;
        let status = match self.input.read_u8().await {
            Ok(status) => status,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::Protocol(format!(
                    "stream ended before the status of {:?}",
                    entry.name
                )));
            }
            Err(err) => return Err(stream_error(err)),
        };
        match status {
            protocol::ACK => {}
            protocol::WARNING_LINE => {
                let text = self.read_line().await?;
                tracing::warn!("remote warning after {:?}: {text}", entry.name);
            }
            protocol::ERROR_LINE => {
                let text = self.read_line().await?;
                return Err(Error::Remote(text));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected status {other:#04x} after {:?}",
                    entry.name
                )));
            }
        }
        self.ack().await?;
        self.summary.files += 1;
        self.summary.bytes += entry.size;
        tracing::debug!("received {:?} ({} bytes)", path, entry.size);
        Ok(())
    }

    async fn run(mut self) -> Result<TransferSummary> {
        self.ack().await?;
        let mut state = DecoderState::AwaitFrame;
        loop {
            state = match state {
                DecoderState::Done => return Ok(self.summary),
                DecoderState::Failed(err) => return Err(err),
                active => match self.step(active).await {
                    Ok(next) => next,
                    Err(err) => DecoderState::Failed(err),
                },
            };
        }
    }
}

/// Reads the frame stream on `input` into `local_target`, sending
/// acknowledgements to `output`. Names follow [`NamingPolicy::for_target`].
#[instrument(skip(input, output))]
pub async fn decode<R, W>(
    local_target: &std::path::Path,
    input: R,
    output: W,
) -> Result<TransferSummary>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let policy = NamingPolicy::for_target(local_target).await?;
    tracing::debug!("download naming: {:?}", policy);
    let decoder = Decoder {
        input: tokio::io::BufReader::new(input),
        output,
        cursor: TransferCursor::new(policy.destination),
        specified_name: policy.specified_name,
        summary: TransferSummary::default(),
        line: Vec::new(),
    };
    let summary = decoder.run().await?;
    tracing::info!("download into {:?} done, {}", local_target, summary);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn missing_target_renames_the_top_level_file() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let target = tmp_dir.path().join("C");
        let mut acks = Vec::new();
        decode(&target, &b"C0644 5 B\nhello\0"[..], &mut acks).await?;
        assert_eq!(tokio::fs::read_to_string(&target).await?, "hello");
        assert!(!tmp_dir.path().join("B").exists());
        // priming, header, body
        assert_eq!(acks, vec![0u8; 3]);
        Ok(())
    }

    #[tokio::test]
    async fn existing_directory_keeps_the_remote_name() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let mut acks = Vec::new();
        decode(tmp_dir.path(), &b"C0600 2 B\nhi\0"[..], &mut acks).await?;
        let path = tmp_dir.path().join("B");
        assert_eq!(tokio::fs::read_to_string(&path).await?, "hi");
        let mode = tokio::fs::metadata(&path).await?.permissions();
        assert_eq!(std::os::unix::fs::PermissionsExt::mode(&mode) & 0o777, 0o600);
        Ok(())
    }

    #[tokio::test]
    async fn existing_file_is_overwritten() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let target = tmp_dir.path().join("old");
        tokio::fs::write(&target, b"previous longer content").await?;
        let mut acks = Vec::new();
        decode(&target, &b"C0644 3 other\nnew\0"[..], &mut acks).await?;
        assert_eq!(tokio::fs::read_to_string(&target).await?, "new");
        Ok(())
    }

    #[tokio::test]
    async fn tree_is_rebuilt_and_only_the_top_is_renamed() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let target = tmp_dir.path().join("copy");
        let mut stream = Vec::new();
        stream.extend_from_slice(b"D0755 0 original\n");
        stream.extend_from_slice(b"C0644 3 a\nabc\0");
        stream.extend_from_slice(b"D0700 0 nested\n");
        stream.extend_from_slice(b"C0644 1 b\nz\0");
        stream.extend_from_slice(b"E\nE\n\n");
        let mut acks = Vec::new();
        let summary = decode(&target, stream.as_slice(), &mut acks).await?;
        assert_eq!(tokio::fs::read_to_string(target.join("a")).await?, "abc");
        assert_eq!(
            tokio::fs::read_to_string(target.join("nested").join("b")).await?,
            "z"
        );
        assert_eq!(summary.directories, 2);
        assert_eq!(summary.files, 2);
        // priming + D + 2 per file + D + 2 per file + E + E + stream end
        assert_eq!(acks.len(), 10);
        Ok(())
    }

    #[tokio::test]
    async fn error_line_fails_with_its_text() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut acks = Vec::new();
        let err = decode(
            &tmp_dir.path().join("x"),
            &b"\x01scp: /nope: No such file or directory\n"[..],
            &mut acks,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Remote(_)), "{err:?}");
        assert!(err.to_string().contains("No such file"));
    }

    #[tokio::test]
    async fn end_of_directory_at_top_level_is_rejected() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut acks = Vec::new();
        let err = decode(tmp_dir.path(), &b"E\n"[..], &mut acks)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err:?}");
    }

    #[tokio::test]
    #[traced_test]
    async fn padding_and_warnings_are_skipped() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let target = tmp_dir.path().join("f");
        let mut acks = Vec::new();
        decode(&target, &b"\0\0\x02careful\nC0644 1 f\n!\0"[..], &mut acks).await?;
        assert_eq!(tokio::fs::read_to_string(&target).await?, "!");
        assert!(logs_contain("remote warning: careful"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn warning_after_file_body_keeps_the_file() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let target = tmp_dir.path().join("f");
        let mut acks = Vec::new();
        let summary = decode(&target, &b"C0644 1 f\n!\x02just a notice\n\n"[..], &mut acks).await?;
        assert_eq!(tokio::fs::read_to_string(&target).await?, "!");
        assert_eq!(summary.files, 1);
        assert!(logs_contain("just a notice"));
        // priming, header, body, stream end
        assert_eq!(acks, vec![0u8; 4]);
        Ok(())
    }

    #[tokio::test]
    async fn error_after_file_body_fails() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut acks = Vec::new();
        let err = decode(
            &tmp_dir.path().join("f"),
            &b"C0644 1 f\n!\x01read failed\n"[..],
            &mut acks,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Remote(ref text) if text == "read failed"), "{err:?}");
    }

    #[tokio::test]
    async fn unknown_control_byte_ends_the_transfer() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let target = tmp_dir.path().join("f");
        let mut acks = Vec::new();
        decode(&target, &b"C0644 1 f\n!\0Zgarbage"[..], &mut acks).await?;
        assert_eq!(tokio::fs::read_to_string(&target).await?, "!");
        Ok(())
    }

    #[tokio::test]
    async fn truncated_file_is_a_protocol_error() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut acks = Vec::new();
        let err = decode(&tmp_dir.path().join("f"), &b"C0644 10 f\nshort"[..], &mut acks)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err:?}");
        assert!(err.to_string().contains("5 of 10 bytes missing"), "{err}");
    }

    #[tokio::test]
    async fn large_file_arrives_in_bounded_chunks() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let target = tmp_dir.path().join("big");
        let content: Vec<u8> = (0..3 * CHUNK_SIZE + 17).map(|i| (i % 251) as u8).collect();
        let mut stream = format!("C0644 {} big\n", content.len()).into_bytes();
        stream.extend_from_slice(&content);
        stream.push(0);
        let mut acks = Vec::new();
        decode(&target, stream.as_slice(), &mut acks).await?;
        assert_eq!(tokio::fs::read(&target).await?, content);
        Ok(())
    }

    #[test]
    fn cursor_tracks_depth() {
        let mut cursor = TransferCursor::new("/dst");
        cursor.descend("a");
        cursor.descend("b");
        assert_eq!(cursor.current(), std::path::Path::new("/dst/a/b"));
        assert_eq!(cursor.depth(), 2);
        cursor.ascend().unwrap();
        cursor.ascend().unwrap();
        assert_eq!(cursor.current(), std::path::Path::new("/dst"));
        assert!(cursor.ascend().is_err());
    }
}
