//! Audio source collaborator for continuous listening

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, Result};

/// Default frame size: 32ms of 16kHz mono PCM16
pub const DEFAULT_FRAME_BYTES: usize = 1024;

/// A source of raw audio frames
///
/// End of stream is signalled with [`Error::EndOfStream`].
#[async_trait]
pub trait AudioSource: Send {
    /// Read the next frame (typically 20-30ms of audio)
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndOfStream`] when exhausted, or a transport error
    async fn read_frame(&mut self) -> Result<Vec<u8>>;

    /// Release any resources held by the source
    ///
    /// # Errors
    ///
    /// Returns error if the underlying resource fails to close
    async fn close(&mut self) -> Result<()>;
}

/// Reads fixed-size frames from any async byte stream (stdin, files, pipes)
pub struct ReaderSource<R> {
    reader: R,
    frame_bytes: usize,
    finished: bool,
}

impl<R> ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Create a source producing frames of `frame_bytes` bytes
    ///
    /// A zero frame size falls back to [`DEFAULT_FRAME_BYTES`].
    #[must_use]
    pub fn new(reader: R, frame_bytes: usize) -> Self {
        let frame_bytes = if frame_bytes == 0 {
            DEFAULT_FRAME_BYTES
        } else {
            frame_bytes
        };

        Self {
            reader,
            frame_bytes,
            finished: false,
        }
    }
}

#[async_trait]
impl<R> AudioSource for ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        if self.finished {
            return Err(Error::EndOfStream);
        }

        let mut frame = vec![0u8; self.frame_bytes];
        let mut filled = 0;

        while filled < frame.len() {
            let n = self.reader.read(&mut frame[filled..]).await?;
            if n == 0 {
                self.finished = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Err(Error::EndOfStream);
        }

        // Short trailing frame is delivered as-is
        frame.truncate(filled);
        Ok(frame)
    }

    async fn close(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}
