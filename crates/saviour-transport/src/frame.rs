//! Wire framing: a `u32` big-endian length followed by the UTF-8 text
//! `"<topic> <payload>"`. The topic runs to the first space; the
//! payload is everything after it and may itself contain spaces.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// Upper bound on a single frame; a status or command payload is small,
/// so anything near this is a corrupt length prefix.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub topic: String,
    pub payload: String,
}

impl Frame {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Whether any subscription in `subs` prefix-matches this frame's
    /// topic. Prefix semantics: a subscription to `status/` matches
    /// every module's status topic.
    pub fn matches<'a, I>(&self, subs: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        subs.into_iter().any(|s| self.topic.starts_with(s.as_str()))
    }

    pub fn encode(&self) -> Vec<u8> {
        let text_len = self.topic.len() + 1 + self.payload.len();
        let mut buf = Vec::with_capacity(4 + text_len);
        buf.extend_from_slice(&(text_len as u32).to_be_bytes());
        buf.extend_from_slice(self.topic.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.payload.as_bytes());
        buf
    }

    pub fn decode(text: &str) -> Result<Self, TransportError> {
        let (topic, payload) = text
            .split_once(' ')
            .ok_or_else(|| TransportError::Malformed(text.chars().take(64).collect()))?;
        if topic.is_empty() {
            return Err(TransportError::Malformed("empty topic".to_string()));
        }
        Ok(Self::new(topic, payload))
    }
}

/// Read one frame from `reader`. Returns `Closed` on clean EOF at a
/// frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, TransportError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::Oversize(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let text = String::from_utf8(body)
        .map_err(|_| TransportError::Malformed("invalid UTF-8".to_string()))?;
    Frame::decode(&text)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), TransportError> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}
