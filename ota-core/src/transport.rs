// Transport collaborator interface for fetching a firmware image.
//
// The read contract deliberately distinguishes the three things a
// zero-length read can mean on the wire: bytes arrived, the connection is
// open but idle, or the peer closed. A transport error is a fourth,
// separate case and is never folded into a clean close.

use core::fmt;

/// Result of one blocking read from the image stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRead {
    /// `n` bytes were placed at the start of the buffer.
    Data(usize),
    /// The connection is still open but no bytes are available right now.
    Pending,
    /// The transfer finished or the peer closed the connection cleanly.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Could not establish the connection to the firmware source.
    Connect(String),
    /// The transport failed mid-stream.
    Io(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Connect(detail) => write!(f, "connection failed: {detail}"),
            StreamError::Io(detail) => write!(f, "transport error: {detail}"),
        }
    }
}

impl std::error::Error for StreamError {}

/// An open, authenticated response stream carrying a raw firmware image.
pub trait ImageStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<StreamRead, StreamError>;

    /// Whether the transport delivered the full declared response body.
    /// Loop exit alone is not proof of completeness.
    fn is_complete(&self) -> bool;
}

/// Factory for one download attempt against the configured remote source.
pub trait FirmwareFetcher {
    type Stream: ImageStream;

    fn open(&mut self) -> Result<Self::Stream, StreamError>;
}
