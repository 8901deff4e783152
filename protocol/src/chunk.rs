//! Chunk framing inside a packet payload. Each chunk is a msgpack `bin`,
//! so a payload is a plain concatenation of length-prefixed chunks.

use anyhow::Result;
use common::InterconnectError;
use rmp::decode::read_bin_len;
use rmp::encode::write_bin_len;
use std::io::Write;

#[inline]
fn bin_prefix_len(len: usize) -> usize {
    if len < 256 {
        2
    } else if len <= u16::MAX as usize {
        3
    } else {
        5
    }
}

/// Bytes a chunk of `len` bytes occupies in a payload.
#[inline]
pub fn framed_len(len: usize) -> usize {
    bin_prefix_len(len) + len
}

pub fn write_chunk(stream: &mut impl Write, chunk: &[u8]) -> Result<()> {
    let len = u32::try_from(chunk.len())?;
    write_bin_len(stream, len)?;
    stream.write_all(chunk)?;
    Ok(())
}

pub struct ChunkReader<'a> {
    payload: &'a [u8],
}

impl<'a> ChunkReader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self { payload }
    }

    fn malformed(&mut self, reason: String) -> Option<Result<&'a [u8]>> {
        self.payload = &[];
        Some(Err(InterconnectError::MalformedPacket(reason.into()).into()))
    }
}

impl<'a> Iterator for ChunkReader<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.payload.is_empty() {
            return None;
        }
        let mut stream = self.payload;
        let len = match read_bin_len(&mut stream) {
            Ok(len) => len as usize,
            Err(e) => return self.malformed(format!("bad chunk prefix: {e}")),
        };
        if stream.len() < len {
            return self.malformed(format!(
                "chunk of {len} bytes truncated to {}",
                stream.len()
            ));
        }
        let (chunk, rest) = stream.split_at(len);
        self.payload = rest;
        Some(Ok(chunk))
    }
}
