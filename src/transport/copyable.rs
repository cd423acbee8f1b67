use std::{
    io::{self, Cursor, SeekFrom},
    path::Path,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    fs::File,
    io::{AsyncRead, AsyncSeek, ReadBuf},
};

pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// A finite byte source that can be copied to a remote host.
///
/// Transports only read and seek; dropping the value closes it.
pub trait Copyable: AsyncRead + AsyncSeek + Send + Unpin {
    fn size(&self) -> u64;

    fn mode(&self) -> u32 {
        DEFAULT_FILE_MODE
    }
}

#[derive(Debug)]
pub struct FileCopyable {
    file: File,
    size: u64,
    mode: u32,
}

impl FileCopyable {
    /// Opens a regular file, keeping its permission bits for the remote copy.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        Ok(Self {
            file,
            size: meta.len(),
            mode: file_mode(&meta),
        })
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    DEFAULT_FILE_MODE
}

impl Copyable for FileCopyable {
    fn size(&self) -> u64 {
        self.size
    }

    fn mode(&self) -> u32 {
        self.mode
    }
}

impl AsyncRead for FileCopyable {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

impl AsyncSeek for FileCopyable {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.file).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.file).poll_complete(cx)
    }
}

/// In-memory content, e.g. a rendered config file.
#[derive(Debug, Clone)]
pub struct BytesCopyable {
    inner: Cursor<Vec<u8>>,
    mode: u32,
}

impl BytesCopyable {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: Cursor::new(bytes.into()),
            mode: DEFAULT_FILE_MODE,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

impl Copyable for BytesCopyable {
    fn size(&self) -> u64 {
        self.inner.get_ref().len() as u64
    }

    fn mode(&self) -> u32 {
        self.mode
    }
}

impl AsyncRead for BytesCopyable {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncSeek for BytesCopyable {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.inner).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.inner).poll_complete(cx)
    }
}
