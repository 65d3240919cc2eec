//! File-backed transport
//!
//! Frames are stored back to back, each prefixed with its length as a
//! little-endian `u64`. Writes go through a `BufWriter` sized by
//! [`Transport::set_buffer`]; frames larger than the buffer bypass it, so the
//! staging buffer never rejects a write.

use super::{Transport, TransportKind};
use crate::error::{AdaptioError, Result, ResultExt};
use crate::types::Mode;
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default staging buffer per file transport
pub const DEFAULT_FILE_BUFFER: usize = 64 * 1024;

#[derive(Debug)]
enum Handle {
    Closed,
    Writer(BufWriter<File>),
    Reader(BufReader<File>),
}

/// Sequential file channel
#[derive(Debug)]
pub struct FileTransport {
    path: Option<PathBuf>,
    buffer_size: usize,
    handle: Handle,
    frames: u64,
}

impl Default for FileTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTransport {
    /// Transport whose file is named by [`Transport::open`]
    pub fn new() -> Self {
        Self {
            path: None,
            buffer_size: DEFAULT_FILE_BUFFER,
            handle: Handle::Closed,
            frames: 0,
        }
    }

    /// Transport bound to a fixed path; the name given to `open` is ignored
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new()
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Frames written or read since open
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Count the frames already stored in `path` (0 when it does not exist)
    pub fn count_frames(path: &Path) -> Result<u64> {
        if !path.exists() {
            return Ok(0);
        }
        let mut transport = FileTransport::with_path(path);
        transport.open("", Mode::Read)?;
        let mut count = 0;
        while transport.read(None)?.is_some() {
            count += 1;
        }
        transport.close()?;
        Ok(count)
    }

    fn not_open(op: &str) -> AdaptioError {
        AdaptioError::InvalidState(format!("{} on a file transport that is not open", op))
    }
}

impl Transport for FileTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::File
    }

    fn open(&mut self, name: &str, mode: Mode) -> Result<()> {
        if !matches!(self.handle, Handle::Closed) {
            return Err(AdaptioError::InvalidState("file transport already open".into()));
        }
        let path = self.path.clone().unwrap_or_else(|| PathBuf::from(name));

        if mode.is_write() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {:?}", parent))?;
            }
        }

        let file = match mode {
            Mode::Write => File::create(&path),
            Mode::Append => OpenOptions::new().create(true).append(true).open(&path),
            Mode::Read => File::open(&path),
        }
        .with_context(|| format!("opening {:?} for {}", path, mode))?;

        self.handle = match mode {
            Mode::Read => Handle::Reader(BufReader::with_capacity(self.buffer_size, file)),
            _ => Handle::Writer(BufWriter::with_capacity(self.buffer_size, file)),
        };
        self.path = Some(path);
        self.frames = 0;
        tracing::trace!("Opened file transport {:?} ({})", self.path, mode);
        Ok(())
    }

    fn set_buffer(&mut self, size: usize) {
        self.buffer_size = size.max(1);
    }

    fn write(&mut self, frame: Bytes) -> Result<()> {
        let Handle::Writer(writer) = &mut self.handle else {
            return Err(Self::not_open("write"));
        };
        writer.write_all(&(frame.len() as u64).to_le_bytes())?;
        writer.write_all(&frame)?;
        self.frames += 1;
        Ok(())
    }

    fn read(&mut self, _timeout: Option<Duration>) -> Result<Option<Bytes>> {
        let Handle::Reader(reader) = &mut self.handle else {
            return Err(Self::not_open("read"));
        };

        let mut header = [0u8; 8];
        let mut filled = 0;
        while filled < header.len() {
            match reader.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(AdaptioError::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "truncated frame header",
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        let len = usize::try_from(u64::from_le_bytes(header)).map_err(|_| {
            AdaptioError::Serialization("frame length does not fit in memory".into())
        })?;
        let mut frame = vec![0u8; len];
        reader
            .read_exact(&mut frame)
            .context("reading frame body")?;
        self.frames += 1;
        Ok(Some(Bytes::from(frame)))
    }

    fn flush(&mut self) -> Result<()> {
        if let Handle::Writer(writer) = &mut self.handle {
            writer.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let handle = std::mem::replace(&mut self.handle, Handle::Closed);
        if let Handle::Writer(mut writer) = handle {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !matches!(self.handle, Handle::Closed)
    }
}
