use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;


pub const LENGTH_PREFIX_LEN: usize = size_of::<u32>();

/// Reassembles length-prefixed frames from arbitrarily split chunks of a byte stream.
///
/// Each frame is a little-endian u32 length followed by that many payload bytes. A length of zero,
///  or one that has the sign bit set when read as i32, is a protocol violation, as is a length
///  above the configured maximum.
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> FrameDecoder {
        FrameDecoder {
            buf: BytesMut::new(),
            max_frame_len,
        }
    }

    /// Appends `data` and pushes the payload of every frame it completes to `frames`. The payloads
    ///  share one allocation, and consumed bytes are dropped from the reassembly buffer in a single
    ///  step at the end. Incomplete trailing frames stay buffered.
    ///
    /// Frames that were complete before an invalid length prefix are still pushed to `frames`
    ///  before the error is returned.
    pub fn unpack(&mut self, data: &[u8], frames: &mut Vec<Bytes>) -> anyhow::Result<()> {
        self.buf.extend_from_slice(data);

        let mut offset = 0;
        let mut ranges = Vec::new();
        let result = loop {
            let mut remaining = &self.buf[offset..];
            if remaining.len() < LENGTH_PREFIX_LEN {
                break Ok(());
            }

            let len = remaining.get_i32_le();
            if len <= 0 {
                break Err(anyhow!("invalid frame length {}", len));
            }
            let len = len as usize;
            if len > self.max_frame_len {
                break Err(anyhow!("frame length {} exceeds maximum of {}", len, self.max_frame_len));
            }
            if remaining.len() < len {
                break Ok(());
            }

            let start = offset + LENGTH_PREFIX_LEN;
            ranges.push(start..start + len);
            offset = start + len;
        };

        if offset > 0 {
            let consumed = self.buf.split_to(offset).freeze();
            trace!("unpacked {} frames ({} bytes), {} bytes left over", ranges.len(), offset, self.buf.len());
            frames.extend(ranges.into_iter().map(|r| consumed.slice(r)));
        }
        if result.is_err() {
            // there is no way to find the next frame boundary
            self.buf.clear();
        }
        result
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}


/// Builds outbound frames: reserves the length prefix, lets the caller append the payload, then
///  patches the length and hands off the frame. The internal buffer is reused across frames.
pub struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new(capacity: usize) -> FrameWriter {
        FrameWriter {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_frame(&mut self, fill: impl FnOnce(&mut BytesMut)) -> anyhow::Result<Bytes> {
        self.buf.clear();
        self.buf.put_u32_le(0);
        fill(&mut self.buf);

        let payload_len = self.buf.len() - LENGTH_PREFIX_LEN;
        if payload_len == 0 {
            self.buf.clear();
            bail!("empty frame");
        }
        if payload_len > i32::MAX as usize {
            self.buf.clear();
            bail!("frame payload of {} bytes is too big", payload_len);
        }

        self.buf[..LENGTH_PREFIX_LEN].copy_from_slice(&(payload_len as u32).to_le_bytes());
        Ok(self.buf.split().freeze())
    }
}

/// Wraps a payload in a frame, for callers that do not go through the shared writer.
pub fn frame_payload(payload: &[u8]) -> anyhow::Result<Bytes> {
    FrameWriter::new(LENGTH_PREFIX_LEN + payload.len())
        .write_frame(|buf| buf.put_slice(payload))
}
