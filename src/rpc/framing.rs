use std::fmt;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame body size: 1 MiB.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Wire framing for stdio JSON-RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// One JSON object per line.
    #[default]
    Newline,
    /// `u32` little-endian body length, then the UTF-8 JSON body
    /// (native-messaging hosts).
    LengthPrefixed,
}

impl Framing {
    /// Parse a CLI/config framing name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "newline" => Some(Self::Newline),
            "length-prefixed" => Some(Self::LengthPrefixed),
            _ => None,
        }
    }
}

/// Errors from frame reading/writing.
#[derive(Debug)]
pub enum FrameError {
    /// A frame exceeded [`MAX_FRAME_LEN`].
    TooLarge(usize),
    /// The body was not valid UTF-8.
    InvalidUtf8,
    /// Underlying I/O failure.
    Io(std::io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge(len) => {
                write!(f, "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")
            }
            Self::InvalidUtf8 => write!(f, "frame body is not valid UTF-8"),
            Self::Io(e) => write!(f, "frame I/O error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Read one frame. `Ok(None)` signals a clean EOF.
///
/// # Errors
///
/// Returns `FrameError::TooLarge` for oversized frames (the connection
/// should be terminated), `FrameError::InvalidUtf8`, or `FrameError::Io`.
pub async fn read_frame<R>(
    reader: &mut BufReader<R>,
    framing: Framing,
) -> Result<Option<String>, FrameError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match framing {
        Framing::Newline => loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Ok(None);
            }
            if n > MAX_FRAME_LEN {
                return Err(FrameError::TooLarge(n));
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(trimmed.to_owned()));
        },
        Framing::LengthPrefixed => {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(e) => return Err(FrameError::Io(e)),
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > MAX_FRAME_LEN {
                return Err(FrameError::TooLarge(len));
            }
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            String::from_utf8(body)
                .map(Some)
                .map_err(|_| FrameError::InvalidUtf8)
        }
    }
}

/// Write one frame and flush.
///
/// # Errors
///
/// Returns `FrameError::TooLarge` when the body exceeds the limit, or
/// `FrameError::Io`.
pub async fn write_frame<W>(
    writer: &mut W,
    framing: Framing,
    body: &str,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body.len()));
    }
    match framing {
        Framing::Newline => {
            writer.write_all(body.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        Framing::LengthPrefixed => {
            #[allow(clippy::cast_possible_truncation)]
            let len = (body.len() as u32).to_le_bytes();
            writer.write_all(&len).await?;
            writer.write_all(body.as_bytes()).await?;
        }
    }
    writer.flush().await?;
    Ok(())
}
