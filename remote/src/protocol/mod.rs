//! Wire format of the legacy copy sub-protocol.
//!
//! Every frame starts with a single control byte. Header frames (`C`, `D`) and
//! the textual notices (`0x01`, `0x02`) are terminated by a newline; file
//! headers are followed by exactly `size` raw bytes and one status byte.

use crate::error::Error;

/// "previous frame accepted, proceed"
pub const ACK: u8 = 0x00;
/// fatal error line from the peer
pub const ERROR_LINE: u8 = 0x01;
/// non-fatal warning line from the peer
pub const WARNING_LINE: u8 = 0x02;
/// announces a file
pub const FILE_HEADER: u8 = b'C';
/// announces a directory
pub const DIR_HEADER: u8 = b'D';
/// leaves the current directory
pub const END_DIR: u8 = b'E';
/// modification/access times, sent by `scp -p`
pub const TIMES: u8 = b'T';
/// no more entries
pub const STREAM_END: u8 = b'\n';

/// Mode used for every file the push encoder sends.
pub const PUSH_FILE_MODE: u32 = 0o644;
/// Mode used for every directory the push encoder sends.
pub const PUSH_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn control_byte(self) -> u8 {
        match self {
            EntryKind::File => FILE_HEADER,
            EntryKind::Directory => DIR_HEADER,
        }
    }
}

/// One node of a tree being transferred, as announced by a `C` or `D` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub kind: EntryKind,
    pub name: String,
    pub mode: u32,
    /// Byte length of the content, always 0 for directories.
    pub size: u64,
}

impl RemoteEntry {
    pub fn file(name: impl Into<String>, mode: u32, size: u64) -> Self {
        Self {
            kind: EntryKind::File,
            name: name.into(),
            mode,
            size,
        }
    }

    pub fn directory(name: impl Into<String>, mode: u32) -> Self {
        Self {
            kind: EntryKind::Directory,
            name: name.into(),
            mode,
            size: 0,
        }
    }

    /// Renders the full header line, control byte and trailing newline included.
    pub fn header_line(&self) -> String {
        format!(
            "{}{:04o} {} {}\n",
            self.kind.control_byte() as char,
            self.mode & 0o7777,
            self.size,
            self.name
        )
    }

    /// Parses the remainder of a header line, i.e. everything after the control
    /// byte, without the trailing newline.
    pub fn parse_header(kind: EntryKind, line: &str) -> Result<Self, Error> {
        let fields: Vec<&str> = line.splitn(3, ' ').collect();
        let [mode, size, name] = fields.as_slice() else {
            return Err(Error::Protocol(format!(
                "expected 3 fields in header {:?}, got {}",
                line,
                fields.len()
            )));
        };
        let mode = u32::from_str_radix(mode, 8)
            .map_err(|err| Error::Protocol(format!("invalid mode {mode:?}: {err}")))?;
        let size = size
            .parse::<u64>()
            .map_err(|err| Error::Protocol(format!("invalid size {size:?}: {err}")))?;
        if name.is_empty() || *name == "." || *name == ".." || name.contains('/') {
            return Err(Error::Protocol(format!("invalid entry name {name:?}")));
        }
        Ok(Self {
            kind,
            name: name.to_string(),
            mode,
            size,
        })
    }
}

/// Strips the line terminator (and a stray carriage return) from a line read off the wire.
pub fn trim_line(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

/// Role the remote program plays in a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `-t`: the remote side receives what we push
    Sink,
    /// `-f`: the remote side sends what we pull
    Source,
}

/// Invocation of the remote copy program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpCommand {
    pub program: String,
    pub direction: Direction,
    pub recursive: bool,
    pub path: String,
}

impl ScpCommand {
    pub fn sink(program: &str, path: &str) -> Self {
        Self {
            program: program.to_string(),
            direction: Direction::Sink,
            recursive: true,
            path: path.to_string(),
        }
    }

    pub fn source(program: &str, path: &str) -> Self {
        Self {
            program: program.to_string(),
            direction: Direction::Source,
            recursive: true,
            path: path.to_string(),
        }
    }

    pub fn to_command_line(&self) -> String {
        let mut flags = String::from("-");
        if self.direction == Direction::Sink {
            flags.push('q');
        }
        if self.recursive {
            flags.push('r');
        }
        flags.push(match self.direction {
            Direction::Sink => 't',
            Direction::Source => 'f',
        });
        format!(
            "{} {} {}",
            self.program,
            flags,
            crate::shell_escape(&self.path)
        )
    }

    /// Recognizes a command line produced by [`ScpCommand::to_command_line`] (or
    /// an equivalent hand-written one). Returns `None` for anything else.
    pub fn parse(command_line: &str) -> Option<Self> {
        let words = crate::shell_split(command_line)?;
        let (program, args) = words.split_first()?;
        let is_scp = std::path::Path::new(program)
            .file_name()
            .is_some_and(|name| name == "scp");
        if !is_scp {
            return None;
        }
        let mut direction = None;
        let mut recursive = false;
        let mut path = None;
        for arg in args {
            if let Some(flags) = arg.strip_prefix('-') {
                for flag in flags.chars() {
                    match flag {
                        't' => direction = Some(Direction::Sink),
                        'f' => direction = Some(Direction::Source),
                        'r' => recursive = true,
                        'q' | 'v' | 'p' | 'd' => {}
                        _ => return None,
                    }
                }
            } else if path.replace(arg.clone()).is_some() {
                return None;
            }
        }
        Some(Self {
            program: program.clone(),
            direction: direction?,
            recursive,
            path: path?,
        })
    }
}

/// Counts of what one transfer moved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

impl std::fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "files: {}, directories: {}, bytes: {}",
            self.files, self.directories, self.bytes
        )
    }
}

/// Maps a failure on the session's byte streams.
pub(crate) fn stream_error(err: std::io::Error) -> Error {
    Error::Connection(format!("remote stream failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_is_rendered_in_octal() {
        let entry = RemoteEntry::file("notes.txt", PUSH_FILE_MODE, 1234);
        assert_eq!(entry.header_line(), "C0644 1234 notes.txt\n");
        let dir = RemoteEntry::directory("sub", PUSH_DIR_MODE);
        assert_eq!(dir.header_line(), "D0755 0 sub\n");
    }

    #[test]
    fn header_name_may_contain_spaces() {
        let entry = RemoteEntry::parse_header(EntryKind::File, "0600 5 my file.txt").unwrap();
        assert_eq!(entry, RemoteEntry::file("my file.txt", 0o600, 5));
    }

    #[test]
    fn header_with_missing_fields_is_rejected() {
        let err = RemoteEntry::parse_header(EntryKind::File, "0644 12").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err:?}");
        assert!(err.to_string().contains("expected 3 fields"));
    }

    #[test]
    fn header_with_bad_numbers_is_rejected() {
        let err = RemoteEntry::parse_header(EntryKind::File, "0899 12 a").unwrap_err();
        assert!(err.to_string().contains("invalid mode"), "{err}");
        let err = RemoteEntry::parse_header(EntryKind::Directory, "0755 -1 a").unwrap_err();
        assert!(err.to_string().contains("invalid size"), "{err}");
    }

    #[test]
    fn header_name_cannot_escape_the_destination() {
        for name in ["..", ".", "a/b", ""] {
            let line = format!("0644 1 {name}");
            assert!(
                RemoteEntry::parse_header(EntryKind::File, &line).is_err(),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn scp_command_line_round_trips() {
        let sink = ScpCommand::sink("scp", "/tmp/with space");
        assert_eq!(sink.to_command_line(), "scp -qrt '/tmp/with space'");
        assert_eq!(ScpCommand::parse(&sink.to_command_line()), Some(sink));
        let source = ScpCommand::source("/usr/bin/scp", "/var/log/x");
        assert_eq!(source.to_command_line(), "/usr/bin/scp -rf '/var/log/x'");
        assert_eq!(ScpCommand::parse(&source.to_command_line()), Some(source));
    }

    #[test]
    fn non_scp_commands_are_not_recognized() {
        assert_eq!(ScpCommand::parse("echo -t hello"), None);
        assert_eq!(ScpCommand::parse("scp -z /tmp"), None);
        assert_eq!(ScpCommand::parse("scp /tmp"), None);
    }
}
