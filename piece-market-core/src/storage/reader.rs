//! Scoped read handle returned by piece storage backends.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use super::StorageError;

/// Exclusively owned stream over a window of a stored piece.
///
/// The underlying resource (file descriptor, connection) is released when the
/// reader is dropped, on every exit path.
pub struct PieceReader {
    inner: Pin<Box<dyn AsyncRead + Send>>,
    length: u64,
}

impl PieceReader {
    /// Wraps a backend stream that yields exactly `length` bytes.
    pub fn new(inner: impl AsyncRead + Send + 'static, length: u64) -> Self {
        Self {
            inner: Box::pin(inner),
            length,
        }
    }

    /// Number of bytes this reader yields.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Reads the whole window into memory and releases the handle.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the stream failed or ended early
    pub async fn read_to_vec(mut self) -> Result<Vec<u8>, StorageError> {
        let mut buffer = vec![0u8; self.length as usize];
        self.read_exact(&mut buffer).await?;
        Ok(buffer)
    }
}

impl AsyncRead for PieceReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.get_mut().inner.as_mut().poll_read(cx, buf)
    }
}

impl fmt::Debug for PieceReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PieceReader")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_to_vec_returns_window() {
        let reader = PieceReader::new(&b"window"[..], 6);
        assert_eq!(reader.len(), 6);
        assert_eq!(reader.read_to_vec().await.unwrap(), b"window");
    }

    #[tokio::test]
    async fn test_read_to_vec_fails_on_short_stream() {
        let reader = PieceReader::new(&b"short"[..], 10);
        let result = reader.read_to_vec().await;

        match result {
            Err(StorageError::Io(error)) => {
                assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof)
            }
            other => panic!("Expected UnexpectedEof, got {other:?}"),
        }
    }
}
