use log::{debug, trace};

use resol_vbus::{
    chrono::Utc,
    live_data_decoder::{data_from_checked_bytes, length_from_bytes},
    live_data_encoder,
    utils::{calc_and_compare_checksum_v0, has_msb_set},
    Data, Header, Packet as VBusPacket, StreamBlobLength::{BlobLength, Malformed, Partial},
    Telegram,
};

use thiserror::Error as ThisError;

/// The byte that starts every VBus frame. It is the only byte on the wire with its MSB set.
pub const SYNC_BYTE: u8 = 0xAA;

/// Maximum number of 4-byte frames a packet can carry.
pub const MAX_FRAME_COUNT: usize = 127;

/// Maximum number of payload bytes a packet can carry.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_COUNT * 4;

const PACKET_HEADER_LEN: usize = 10;
const PACKET_FRAME_LEN: usize = 6;
const DATAGRAM_LEN: usize = 16;
const TELEGRAM_HEADER_LEN: usize = 8;
const TELEGRAM_FRAME_LEN: usize = 9;

/// Maximum number of bytes a single packet occupies on the wire.
pub const MAX_FRAME_LEN: usize = PACKET_HEADER_LEN + MAX_FRAME_COUNT * PACKET_FRAME_LEN;

const PROTOCOL_PACKET: u8 = 0x10;
const PROTOCOL_DATAGRAM: u8 = 0x20;
const PROTOCOL_TELEGRAM: u8 = 0x30;

/// A checksum-validated VBus packet (protocol version 1.0).
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// The VBus address of the sender.
    pub source_address: u16,

    /// The VBus address of the receiver.
    pub destination_address: u16,

    /// The packet command, `0x0100` for regular live data.
    pub command: u16,

    /// The frame data with septett bits already restored.
    pub payload: Vec<u8>,

    /// Whether the header and all frame checksums matched.
    pub checksum_valid: bool,
}

impl Packet {
    /// Create a new packet with a valid checksum flag.
    pub fn new(
        source_address: u16,
        destination_address: u16,
        command: u16,
        payload: Vec<u8>,
    ) -> Packet {
        Packet {
            source_address,
            destination_address,
            command,
            payload,
            checksum_valid: true,
        }
    }

    /// Return a short identification string, e.g. `0010_7E11_0100`.
    pub fn id_string(&self) -> String {
        format!(
            "{:04X}_{:04X}_{:04X}",
            self.destination_address, self.source_address, self.command
        )
    }
}

/// Reasons why the bytes at the front of the buffer do not form a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum DecodeError {
    /// More bytes are needed before a decision can be made.
    #[error("incomplete frame")]
    IncompleteFrame,

    /// The frame is complete but one of its checksums does not match.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// The bytes cannot be a valid frame (truncated, unknown protocol version).
    #[error("malformed frame")]
    MalformedFrame,
}

/// Why the frame at the front of the buffer was rejected.
///
/// Only called for bytes that `length_from_bytes` reported as malformed and
/// that start with a sync byte.
fn rejection_reason(buf: &[u8]) -> DecodeError {
    let len = buf.len();
    if has_msb_set(&buf[1..len.min(6)]) {
        return DecodeError::MalformedFrame;
    }

    let header_len = match buf[5] & 0xF0 {
        PROTOCOL_PACKET => PACKET_HEADER_LEN,
        PROTOCOL_DATAGRAM => DATAGRAM_LEN,
        PROTOCOL_TELEGRAM => TELEGRAM_HEADER_LEN,
        _ => return DecodeError::MalformedFrame,
    };
    if has_msb_set(&buf[1..len.min(header_len)]) {
        return DecodeError::MalformedFrame;
    }
    if !calc_and_compare_checksum_v0(&buf[1..header_len]) {
        return DecodeError::ChecksumMismatch;
    }

    let frame_len = match buf[5] & 0xF0 {
        PROTOCOL_PACKET => PACKET_HEADER_LEN + usize::from(buf[8]) * PACKET_FRAME_LEN,
        PROTOCOL_TELEGRAM => {
            TELEGRAM_HEADER_LEN
                + usize::from(Telegram::frame_count_from_command(buf[6])) * TELEGRAM_FRAME_LEN
        }
        _ => header_len,
    };
    if has_msb_set(&buf[header_len..len.min(frame_len)]) {
        DecodeError::MalformedFrame
    } else {
        DecodeError::ChecksumMismatch
    }
}

impl From<&VBusPacket> for Packet {
    fn from(packet: &VBusPacket) -> Packet {
        Packet::new(
            packet.header.source_address,
            packet.header.destination_address,
            packet.command,
            packet.valid_frame_data().to_vec(),
        )
    }
}

/// Incremental decoder turning a raw VBus byte stream into `Packet`s.
///
/// Bytes are appended with `extend_from_slice` and decoded with `decode` or
/// `drain_packets`. After any error the decoder skips the offending sync byte
/// and rescans for the next one, so a corrupted frame never takes a following
/// valid frame down with it.
///
/// # Examples
///
/// ```
/// use vbus_bridge::{encode_packet, FrameDecoder, Packet};
///
/// let packet = Packet::new(0x7E11, 0x0010, 0x0100, vec![0xF5, 0x00, 0x00, 0x00]);
///
/// let mut decoder = FrameDecoder::new();
/// decoder.extend_from_slice(&encode_packet(&packet));
///
/// assert_eq!(vec![packet], decoder.drain_packets());
/// ```
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> FrameDecoder {
        FrameDecoder {
            buf: Vec::with_capacity(MAX_FRAME_LEN),
        }
    }

    /// Number of bytes waiting to be decoded.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Discard all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Append received bytes. Anything in front of the first sync byte is dropped
    /// right away, so input without sync bytes never accumulates.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        if self.buf.is_empty() {
            match bytes.iter().position(|b| *b == SYNC_BYTE) {
                Some(idx) => self.buf.extend_from_slice(&bytes[idx..]),
                None => trace!("Skipping {} bytes without sync byte", bytes.len()),
            }
        } else {
            self.buf.extend_from_slice(bytes);
        }
    }

    fn skip_sync_byte(&mut self) {
        self.buf.drain(0..1);
    }

    /// Try to decode the next packet from the buffered bytes.
    ///
    /// Valid datagrams and telegrams are consumed silently since they carry
    /// no field data. On `ChecksumMismatch` and `MalformedFrame` the decoder
    /// has already advanced past the bad frame start, so calling `decode`
    /// again resumes with the next candidate frame.
    pub fn decode(&mut self) -> Result<Packet, DecodeError> {
        loop {
            match self.buf.iter().position(|b| *b == SYNC_BYTE) {
                Some(0) => {}
                Some(idx) => {
                    self.buf.drain(0..idx);
                }
                None => {
                    self.buf.clear();
                    return Err(DecodeError::IncompleteFrame);
                }
            }

            let len = match length_from_bytes(&self.buf) {
                BlobLength(len) => len,
                // A second sync byte inside a pending frame means it was cut short.
                Partial if has_msb_set(&self.buf[1..]) => {
                    self.skip_sync_byte();
                    return Err(DecodeError::MalformedFrame);
                }
                Partial => return Err(DecodeError::IncompleteFrame),
                Malformed => {
                    let err = rejection_reason(&self.buf);
                    self.skip_sync_byte();
                    return Err(err);
                }
            };

            let data = data_from_checked_bytes(Utc::now(), 0, &self.buf[0..len]);
            self.buf.drain(0..len);

            match data {
                Data::Packet(ref packet) => return Ok(Packet::from(packet)),
                other => trace!("Skipping {}", other.id_string()),
            }
        }
    }

    /// Decode every complete packet currently buffered. Bad frames are dropped
    /// and logged, an incomplete trailing frame stays buffered.
    pub fn drain_packets(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        loop {
            match self.decode() {
                Ok(packet) => {
                    trace!("Decoded packet {}", packet.id_string());
                    packets.push(packet);
                }
                Err(DecodeError::IncompleteFrame) => break,
                Err(err) => debug!("Dropping frame: {}", err),
            }
        }
        packets
    }
}

/// Decode all packets contained in a single buffered read.
pub fn decode_all(bytes: &[u8]) -> Vec<Packet> {
    let mut decoder = FrameDecoder::new();
    decoder.extend_from_slice(bytes);
    decoder.drain_packets()
}

/// Encode a packet into its live / wire representation.
///
/// Payloads are padded with zeros to a multiple of four bytes; anything
/// beyond `MAX_PAYLOAD_LEN` is not encoded.
pub fn encode_packet(packet: &Packet) -> Vec<u8> {
    let payload_len = packet.payload.len().min(MAX_PAYLOAD_LEN);

    let mut frame_data = [0u8; MAX_PAYLOAD_LEN];
    frame_data[0..payload_len].copy_from_slice(&packet.payload[0..payload_len]);

    let data = Data::Packet(VBusPacket {
        header: Header {
            timestamp: Utc::now(),
            channel: 0,
            destination_address: packet.destination_address,
            source_address: packet.source_address,
            protocol_version: PROTOCOL_PACKET,
        },
        command: packet.command,
        frame_count: ((payload_len + 3) / 4) as u8,
        frame_data,
    });

    let mut bytes = vec![0u8; live_data_encoder::length_from_data(&data)];
    live_data_encoder::bytes_from_data(&data, &mut bytes);
    bytes
}
