use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::traits::{RecvBuf, Transport, TransportKind, MAX_RETRIES, RETRY_SLEEP};

/// File-backed pseudo-channel: one escaped record per line.
///
/// Files are a degenerate transport — already whole-message-per-record, so
/// the framing layer never splits over them, and there is no meaningful
/// pending count. Records escape `\` and newline so arbitrary bytes survive
/// the line discipline.
pub struct FileTransport {
    path: PathBuf,
    mode: Mode,
    file: Option<File>,
    /// Read offset of the next unconsumed byte.
    offset: u64,
    pending_line: BytesMut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Append,
    Read,
}

impl FileTransport {
    /// Transport that appends records to `path`.
    pub fn writer(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: Mode::Append,
            file: None,
            offset: 0,
            pending_line: BytesMut::new(),
        }
    }

    /// Transport that consumes records from `path`.
    pub fn reader(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: Mode::Read,
            file: None,
            offset: 0,
            pending_line: BytesMut::new(),
        }
    }

    fn path_str(&self) -> String {
        self.path.display().to_string()
    }

    /// Pull available bytes from the file into the line buffer.
    fn fill_from_file(&mut self) -> Result<usize> {
        let file = self.file.as_mut().ok_or(TransportError::Closed)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = Vec::new();
        let read = file.read_to_end(&mut chunk)?;
        self.offset += read as u64;
        self.pending_line.extend_from_slice(&chunk);
        Ok(read)
    }

    /// Extract the next complete record from the line buffer, if any.
    fn take_record(&mut self) -> Option<Vec<u8>> {
        let nl = self.pending_line.iter().position(|&b| b == b'\n')?;
        let line = self.pending_line.split_to(nl + 1);
        Some(unescape_record(&line[..nl]))
    }
}

fn escape_record(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 1);
    for &b in message {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_record(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    let mut iter = line.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'n') => out.push(b'\n'),
            Some(&esc) => out.push(esc),
            None => out.push(b'\\'),
        }
    }
    out
}

impl Transport for FileTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::File
    }

    fn address(&self) -> &str {
        self.path.to_str().unwrap_or("<non-utf8 path>")
    }

    fn is_file(&self) -> bool {
        true
    }

    fn open(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = match self.mode {
            Mode::Append => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path),
            // A reader may start before its writer; create the file so the
            // first poll finds it empty rather than missing.
            Mode::Read => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.path),
        }
        .map_err(|source| TransportError::Os {
            op: "open",
            name: self.path_str(),
            source,
        })?;
        debug!(path = %self.path.display(), mode = ?self.mode, "file channel opened");
        self.file = Some(file);
        Ok(())
    }

    fn send(&mut self, message: &[u8]) -> Result<()> {
        if self.mode != Mode::Append {
            return Err(TransportError::InvalidAddress(
                "file channel opened for reading".to_string(),
            ));
        }
        let file = self.file.as_mut().ok_or(TransportError::Closed)?;
        let mut record = escape_record(message);
        record.push(b'\n');
        file.write_all(&record)?;
        file.flush()?;
        trace!(path = %self.path.display(), bytes = message.len(), "file send");
        Ok(())
    }

    fn recv(&mut self, mut buf: RecvBuf<'_>) -> Result<usize> {
        if self.mode != Mode::Read {
            return Err(TransportError::InvalidAddress(
                "file channel opened for writing".to_string(),
            ));
        }

        for _ in 0..MAX_RETRIES {
            if let Some(record) = self.take_record() {
                trace!(path = %self.path.display(), bytes = record.len(), "file recv");
                return buf.fill(&record);
            }
            if self.fill_from_file()? == 0 {
                // Nothing new yet; the writer may still be appending.
                std::thread::sleep(RETRY_SLEEP);
            }
        }
        Err(TransportError::Timeout {
            attempts: MAX_RETRIES,
        })
    }

    fn pending(&mut self) -> Result<usize> {
        // Files have no true pending count; report whether anything is unread.
        if self.mode != Mode::Read || self.file.is_none() {
            return Ok(0);
        }
        if !self.pending_line.is_empty() {
            return Ok(1);
        }
        let len = std::fs::metadata(&self.path)?.len();
        Ok(usize::from(len > self.offset))
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }
}

impl std::fmt::Debug for FileTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTransport")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("open", &self.file.is_some())
            .finish()
    }
}
