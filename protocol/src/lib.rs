use anyhow::{bail, Result};
use common::InterconnectError;
use rmp::decode::{read_i32, read_u32};
use rmp::encode::{write_i32, write_u32};
use std::fmt;
use std::io::{Read, Write};
use std::ops::BitOr;

pub mod chunk;

pub use chunk::{framed_len, write_chunk, ChunkReader};

// Every header field is a fixed-width msgpack integer: a marker byte and four value bytes.
const FIELD_SIZE: usize = 5;
const FIELD_COUNT: usize = 15;
const CHECKSUM_OFFSET: usize = HEADER_SIZE - FIELD_SIZE;

pub const HEADER_SIZE: usize = FIELD_SIZE * FIELD_COUNT;
/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Independent flag bits carried by every packet.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u32);

impl Flags {
    pub const ACK: Flags = Flags(1);
    pub const STOP: Flags = Flags(2);
    pub const EOS: Flags = Flags(4);
    pub const NAK: Flags = Flags(8);
    const KNOWN: u32 = 1 | 2 | 4 | 8;

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Result<Self, InterconnectError> {
        if bits & !Self::KNOWN != 0 {
            return Err(InterconnectError::MalformedPacket(
                format!("unknown flag bits {bits:#x}").into(),
            ));
        }
        Ok(Flags(bits))
    }

    #[inline]
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("-");
        }
        let names = [
            (Flags::ACK, "ACK"),
            (Flags::STOP, "STOP"),
            (Flags::EOS, "EOS"),
            (Flags::NAK, "NAK"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Packet header. Identity fields are copied verbatim into acknowledgements
/// so the sender can find its connection again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub total_len: u32,
    pub flags: Flags,
    pub motion_node_id: i32,
    pub recv_slice_index: i32,
    pub send_slice_index: i32,
    pub src_content_id: i32,
    pub dst_content_id: i32,
    pub src_listener_port: u32,
    pub dst_listener_port: u32,
    pub src_pid: i32,
    pub dst_pid: i32,
    pub session_id: i32,
    pub instance_id: u32,
    pub sequence: u32,
    pub checksum: u32,
}

impl Header {
    /// Sequence zero is reserved for the connection handshake.
    #[inline]
    pub fn is_handshake(&self) -> bool {
        self.sequence == 0
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(HEADER_SIZE)
    }

    pub const fn payload_max_size(max_packet_size: usize) -> usize {
        max_packet_size.saturating_sub(HEADER_SIZE)
    }
}

pub fn consume_header(stream: &mut impl Read) -> Result<Header> {
    let total_len = read_u32(stream)?;
    let flags = Flags::from_bits(read_u32(stream)?)?;
    Ok(Header {
        total_len,
        flags,
        motion_node_id: read_i32(stream)?,
        recv_slice_index: read_i32(stream)?,
        send_slice_index: read_i32(stream)?,
        src_content_id: read_i32(stream)?,
        dst_content_id: read_i32(stream)?,
        src_listener_port: read_u32(stream)?,
        dst_listener_port: read_u32(stream)?,
        src_pid: read_i32(stream)?,
        dst_pid: read_i32(stream)?,
        session_id: read_i32(stream)?,
        instance_id: read_u32(stream)?,
        sequence: read_u32(stream)?,
        checksum: read_u32(stream)?,
    })
}

pub fn write_header(stream: &mut impl Write, header: &Header) -> Result<()> {
    write_u32(stream, header.total_len)?;
    write_u32(stream, header.flags.bits())?;
    write_i32(stream, header.motion_node_id)?;
    write_i32(stream, header.recv_slice_index)?;
    write_i32(stream, header.send_slice_index)?;
    write_i32(stream, header.src_content_id)?;
    write_i32(stream, header.dst_content_id)?;
    write_u32(stream, header.src_listener_port)?;
    write_u32(stream, header.dst_listener_port)?;
    write_i32(stream, header.src_pid)?;
    write_i32(stream, header.dst_pid)?;
    write_i32(stream, header.session_id)?;
    write_u32(stream, header.instance_id)?;
    write_u32(stream, header.sequence)?;
    write_u32(stream, header.checksum)?;
    Ok(())
}

/// crc32c over the whole packet with the checksum value bytes taken as zero.
fn compute_checksum(packet: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&packet[..CHECKSUM_OFFSET + 1]);
    let crc = crc32c::crc32c_append(crc, &[0; FIELD_SIZE - 1]);
    crc32c::crc32c_append(crc, &packet[HEADER_SIZE..])
}

/// Finalize a packet assembled in place: `packet` starts with a reserved
/// header slot followed by the payload. Fills in `total_len` and, when
/// enabled, the checksum, both in `header` and in the bytes.
pub fn seal(packet: &mut [u8], header: &mut Header, checksum: bool) -> Result<()> {
    if packet.len() < HEADER_SIZE {
        bail!(InterconnectError::MalformedPacket(
            format!("packet of {} bytes has no room for a header", packet.len()).into()
        ));
    }
    if packet.len() > MAX_DATAGRAM_SIZE {
        bail!(InterconnectError::PayloadTooLarge(packet.len()));
    }
    if header.is_handshake() && packet.len() != HEADER_SIZE {
        bail!(InterconnectError::MalformedPacket(
            "handshake packets carry no payload".into()
        ));
    }
    header.total_len = packet.len() as u32;
    header.checksum = 0;
    let mut slot = &mut packet[..HEADER_SIZE];
    write_header(&mut slot, header)?;
    if checksum {
        header.checksum = compute_checksum(packet);
        let mut slot = &mut packet[CHECKSUM_OFFSET..HEADER_SIZE];
        write_u32(&mut slot, header.checksum)?;
    }
    Ok(())
}

pub fn encode(header: &Header, payload: &[u8], checksum: bool) -> Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len());
    packet.resize(HEADER_SIZE, 0);
    packet.extend_from_slice(payload);
    let mut header = *header;
    seal(&mut packet, &mut header, checksum)?;
    Ok(packet)
}

/// Parse a datagram into its header and payload.
pub fn decode(bytes: &[u8], checksum: bool) -> Result<(Header, &[u8])> {
    if bytes.len() < HEADER_SIZE {
        bail!(InterconnectError::MalformedPacket(
            format!("datagram of {} bytes is shorter than a header", bytes.len()).into()
        ));
    }
    let mut stream = &bytes[..HEADER_SIZE];
    let header = consume_header(&mut stream)
        .map_err(|e| InterconnectError::MalformedPacket(e.to_string().into()))?;
    if header.total_len as usize != bytes.len() {
        bail!(InterconnectError::MalformedPacket(
            format!(
                "length field {} does not match datagram length {}",
                header.total_len,
                bytes.len()
            )
            .into()
        ));
    }
    if checksum {
        let computed = compute_checksum(bytes);
        if computed != header.checksum {
            bail!(InterconnectError::ChecksumMismatch {
                expected: header.checksum,
                computed,
            });
        }
    }
    let payload = &bytes[HEADER_SIZE..];
    if header.is_handshake() && !payload.is_empty() {
        bail!(InterconnectError::MalformedPacket(
            "handshake packet with payload".into()
        ));
    }
    Ok((header, payload))
}
