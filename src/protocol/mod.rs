//! Wire protocol for the microphone stream.
//!
//! Every datagram carries exactly one packet and starts with a 32-bit
//! little-endian magic. The mnemonic reads in reversed byte order
//! ("MMIC", "MOON", "PING", ...). All multi-byte integers on the wire are
//! little-endian and every structure is serialized field by field, so host
//! struct padding never reaches the network.

/// Audio data packet magic ("MMIC").
pub const AUDIO_MAGIC: u32 = 0x4D4D_4943;
/// Handshake magic ("MOON").
pub const HANDSHAKE_MAGIC: u32 = 0x4D4F_4F4E;
/// Byte-reversed handshake magic ("NOOM"), tolerated for clients that build
/// the magic with the wrong endianness.
pub const HANDSHAKE_MAGIC_ALT: u32 = 0x4E4F_4F4D;
/// Heartbeat ping magic ("PING"), host to client.
pub const PING_MAGIC: u32 = 0x5049_4E47;
/// Ping echo magic ("PONG"). Reserved: no current client emits it.
pub const PONG_MAGIC: u32 = 0x504F_4E47;
/// Control magic ("STOP"): host paused, client must stop transmitting.
pub const CTRL_STOP: u32 = 0x5354_4F50;
/// Control magic ("STRT"): host resumed, client may transmit again.
pub const CTRL_START: u32 = 0x5354_5254;

/// Size of the audio packet header in bytes.
pub const HEADER_SIZE: usize = 20;
/// Size of an encoded handshake in bytes.
pub const HANDSHAKE_SIZE: usize = 93;
/// Size of a control packet in bytes.
pub const CONTROL_SIZE: usize = 8;
/// Size of a ping/pong packet in bytes.
pub const PING_SIZE: usize = 12;

/// Bit 31 of the rate field: payload is raw little-endian i16 PCM instead of
/// a compressed voice frame.
pub const RAW_FLAG: u32 = 0x8000_0000;

/// Protocol version carried in the handshake.
pub const PROTOCOL_VERSION: u8 = 2;

/// Handshake flag: re-apply side effects even if nothing changed.
pub const FLAG_FORCE_UPDATE: u8 = 0x01;

/// Audio packet header (20 bytes, little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Always [`AUDIO_MAGIC`].
    pub magic: u32,
    /// Per-client counter starting at 0; wraps without error.
    pub sequence: u32,
    /// Sender wall clock in microseconds. Diagnostic only, never used for
    /// ordering.
    pub timestamp_us: u64,
    /// Low 31 bits: payload sample rate in Hz. Bit 31: [`RAW_FLAG`].
    pub rate_and_flags: u32,
}

impl PacketHeader {
    /// Parse a header from the start of a datagram.
    ///
    /// Returns `None` for anything shorter than [`HEADER_SIZE`] or with the
    /// wrong magic; no field is read before the length check.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }

        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != AUDIO_MAGIC {
            return None;
        }

        let sequence = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let timestamp_us = u64::from_le_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);
        let rate_and_flags = u32::from_le_bytes([data[16], data[17], data[18], data[19]]);

        Some(PacketHeader {
            magic,
            sequence,
            timestamp_us,
            rate_and_flags,
        })
    }

    /// Encode the header into `buffer`. Returns the number of bytes written,
    /// 0 if the buffer is too small.
    pub fn encode(&self, buffer: &mut [u8]) -> usize {
        if buffer.len() < HEADER_SIZE {
            return 0;
        }

        buffer[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buffer[4..8].copy_from_slice(&self.sequence.to_le_bytes());
        buffer[8..16].copy_from_slice(&self.timestamp_us.to_le_bytes());
        buffer[16..20].copy_from_slice(&self.rate_and_flags.to_le_bytes());

        HEADER_SIZE
    }

    /// Sample rate of the payload in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.rate_and_flags & !RAW_FLAG
    }

    /// Whether the payload is uncompressed PCM.
    pub fn is_raw(&self) -> bool {
        self.rate_and_flags & RAW_FLAG != 0
    }
}

/// Parsed audio packet: header plus a borrowed payload.
///
/// An empty payload is legal (header-only datagram) and is ignored upstream.
#[derive(Debug)]
pub struct AudioPacket<'a> {
    pub header: PacketHeader,
    pub payload: &'a [u8],
}

impl<'a> AudioPacket<'a> {
    /// Parse a complete audio datagram.
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        let header = PacketHeader::parse(data)?;
        Some(AudioPacket {
            header,
            payload: &data[HEADER_SIZE..],
        })
    }
}

/// Builder for outgoing audio packets.
///
/// Keeps the wrapping sequence counter and a preallocated datagram buffer so
/// the send path never allocates.
pub struct AudioPacketBuilder {
    sequence: u32,
    buffer: Vec<u8>,
}

impl AudioPacketBuilder {
    /// `max_payload` bounds the payload accepted by [`build`](Self::build).
    pub fn new(max_payload: usize) -> Self {
        Self {
            sequence: 0,
            buffer: vec![0u8; HEADER_SIZE + max_payload],
        }
    }

    /// Frame one payload. Returns the complete datagram slice, or `None` if
    /// the payload exceeds the preallocated buffer.
    ///
    /// `rate` is the payload sample rate; `raw` sets [`RAW_FLAG`].
    pub fn build(&mut self, payload: &[u8], rate: u32, raw: bool, timestamp_us: u64) -> Option<&[u8]> {
        let total = HEADER_SIZE + payload.len();
        if total > self.buffer.len() {
            return None;
        }

        let header = PacketHeader {
            magic: AUDIO_MAGIC,
            sequence: self.sequence,
            timestamp_us,
            rate_and_flags: if raw { rate | RAW_FLAG } else { rate & !RAW_FLAG },
        };

        header.encode(&mut self.buffer);
        self.buffer[HEADER_SIZE..total].copy_from_slice(payload);
        self.sequence = self.sequence.wrapping_add(1);

        Some(&self.buffer[..total])
    }

    /// Next sequence number to be emitted.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Client handshake (95 bytes on the wire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// 0 or 1, as vouched by the pairing state of the coexisting
    /// game-streaming host.
    pub pair_status: u8,
    /// 16-byte client identifier.
    pub unique_id: [u8; 16],
    /// Device name, at most 64 bytes.
    pub device_name: String,
    /// Requested display width, 0 = no request.
    pub display_width: u16,
    /// Requested display height, 0 = no request.
    pub display_height: u16,
    /// Flag bits, see [`FLAG_FORCE_UPDATE`].
    pub flags: u8,
}

impl Handshake {
    /// Parse and validate a handshake datagram.
    ///
    /// Accepts both [`HANDSHAKE_MAGIC`] and [`HANDSHAKE_MAGIC_ALT`]; rejects
    /// any other magic, a version other than [`PROTOCOL_VERSION`], a
    /// uniqueid length other than 16, a device name longer than 64 bytes, or
    /// a pair status outside {0, 1}.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HANDSHAKE_SIZE {
            return None;
        }

        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != HANDSHAKE_MAGIC && magic != HANDSHAKE_MAGIC_ALT {
            return None;
        }

        let version = data[4];
        if version != PROTOCOL_VERSION {
            return None;
        }

        let pair_status = data[5];
        if pair_status > 1 {
            return None;
        }

        let uniqueid_len = data[6] as usize;
        if uniqueid_len != 16 {
            return None;
        }
        let mut unique_id = [0u8; 16];
        unique_id.copy_from_slice(&data[7..23]);

        let devicename_len = data[23] as usize;
        if devicename_len > 64 {
            return None;
        }
        let name_field = &data[24..88];
        let device_name = String::from_utf8_lossy(&name_field[..devicename_len])
            .trim_end_matches('\0')
            .to_string();

        let display_width = u16::from_le_bytes([data[88], data[89]]);
        let display_height = u16::from_le_bytes([data[90], data[91]]);
        let flags = data[92];

        Some(Handshake {
            pair_status,
            unique_id,
            device_name,
            display_width,
            display_height,
            flags,
        })
    }

    /// Encode into a fixed 95-byte datagram.
    pub fn encode(&self, buffer: &mut [u8]) -> usize {
        if buffer.len() < HANDSHAKE_SIZE {
            return 0;
        }

        buffer[..HANDSHAKE_SIZE].fill(0);
        buffer[0..4].copy_from_slice(&HANDSHAKE_MAGIC.to_le_bytes());
        buffer[4] = PROTOCOL_VERSION;
        buffer[5] = self.pair_status;
        buffer[6] = 16;
        buffer[7..23].copy_from_slice(&self.unique_id);

        let name = self.device_name.as_bytes();
        let name_len = name.len().min(64);
        buffer[23] = name_len as u8;
        buffer[24..24 + name_len].copy_from_slice(&name[..name_len]);

        buffer[88..90].copy_from_slice(&self.display_width.to_le_bytes());
        buffer[90..92].copy_from_slice(&self.display_height.to_le_bytes());
        buffer[92] = self.flags;

        HANDSHAKE_SIZE
    }

    /// Whether the FORCE_UPDATE flag is set.
    pub fn force_update(&self) -> bool {
        self.flags & FLAG_FORCE_UPDATE != 0
    }

    /// Unique id rendered for logs and stats.
    pub fn unique_id_string(&self) -> String {
        String::from_utf8_lossy(&self.unique_id)
            .trim_end_matches('\0')
            .to_string()
    }
}

/// Control packet (8 bytes): STOP or START plus a reserved word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPacket {
    pub magic: u32,
}

impl ControlPacket {
    pub fn stop() -> Self {
        Self { magic: CTRL_STOP }
    }

    pub fn start() -> Self {
        Self { magic: CTRL_START }
    }

    /// Parse a control datagram. Length must be exactly [`CONTROL_SIZE`].
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != CONTROL_SIZE {
            return None;
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != CTRL_STOP && magic != CTRL_START {
            return None;
        }
        Some(ControlPacket { magic })
    }

    pub fn encode(&self, buffer: &mut [u8]) -> usize {
        if buffer.len() < CONTROL_SIZE {
            return 0;
        }
        buffer[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buffer[4..8].fill(0);
        CONTROL_SIZE
    }
}

/// Heartbeat ping (12 bytes). The timestamp is the host wall clock in
/// microseconds and is purely informational; the client treats any valid
/// ping as a liveness witness and never echoes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPacket {
    pub timestamp_us: u64,
}

impl PingPacket {
    /// Parse a ping datagram. Length must be exactly [`PING_SIZE`].
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != PING_SIZE {
            return None;
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != PING_MAGIC {
            return None;
        }
        let timestamp_us = u64::from_le_bytes([
            data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
        ]);
        Some(PingPacket { timestamp_us })
    }

    pub fn encode(&self, buffer: &mut [u8]) -> usize {
        if buffer.len() < PING_SIZE {
            return 0;
        }
        buffer[0..4].copy_from_slice(&PING_MAGIC.to_le_bytes());
        buffer[4..12].copy_from_slice(&self.timestamp_us.to_le_bytes());
        PING_SIZE
    }
}

/// Reserved ping echo (12 bytes, "PONG" + echoed host timestamp).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongPacket {
    pub timestamp_us: u64,
}

impl PongPacket {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != PING_SIZE {
            return None;
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != PONG_MAGIC {
            return None;
        }
        let timestamp_us = u64::from_le_bytes([
            data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
        ]);
        Some(PongPacket { timestamp_us })
    }
}

/// Leading magic of a datagram, if it is long enough to carry one.
pub fn peek_magic(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader {
            magic: AUDIO_MAGIC,
            sequence: 12345,
            timestamp_us: 9_876_543_210,
            rate_and_flags: 16000,
        };

        let mut buffer = [0u8; HEADER_SIZE];
        assert_eq!(header.encode(&mut buffer), HEADER_SIZE);

        let parsed = PacketHeader::parse(&buffer).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.sample_rate(), 16000);
        assert!(!parsed.is_raw());

        // Re-encoding yields an identical byte prefix.
        let mut buffer2 = [0u8; HEADER_SIZE];
        parsed.encode(&mut buffer2);
        assert_eq!(buffer, buffer2);
    }

    #[test]
    fn test_header_raw_flag() {
        let header = PacketHeader {
            magic: AUDIO_MAGIC,
            sequence: 0,
            timestamp_us: 0,
            rate_and_flags: 48000 | RAW_FLAG,
        };
        assert!(header.is_raw());
        assert_eq!(header.sample_rate(), 48000);
    }

    #[test]
    fn test_header_short_input() {
        let mut buffer = [0u8; HEADER_SIZE];
        PacketHeader {
            magic: AUDIO_MAGIC,
            sequence: 1,
            timestamp_us: 2,
            rate_and_flags: 3,
        }
        .encode(&mut buffer);

        for len in 0..HEADER_SIZE {
            assert!(PacketHeader::parse(&buffer[..len]).is_none());
        }
    }

    #[test]
    fn test_header_wrong_magic() {
        let mut buffer = [0u8; HEADER_SIZE];
        buffer[0..4].copy_from_slice(&HANDSHAKE_MAGIC.to_le_bytes());
        assert!(PacketHeader::parse(&buffer).is_none());
    }

    #[test]
    fn test_audio_packet_empty_payload() {
        let mut buffer = [0u8; HEADER_SIZE];
        PacketHeader {
            magic: AUDIO_MAGIC,
            sequence: 7,
            timestamp_us: 0,
            rate_and_flags: 24000,
        }
        .encode(&mut buffer);

        let packet = AudioPacket::parse(&buffer).unwrap();
        assert_eq!(packet.header.sequence, 7);
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_builder_sequence_advances() {
        let mut builder = AudioPacketBuilder::new(64);
        let a = builder.build(&[1, 2, 3], 16000, false, 100).unwrap().to_vec();
        let b = builder.build(&[4, 5], 16000, false, 200).unwrap().to_vec();

        let pa = AudioPacket::parse(&a).unwrap();
        let pb = AudioPacket::parse(&b).unwrap();
        assert_eq!(pa.header.sequence, 0);
        assert_eq!(pb.header.sequence, 1);
        assert_eq!(pa.payload, &[1, 2, 3]);
        assert_eq!(pb.payload, &[4, 5]);
    }

    #[test]
    fn test_builder_oversized_payload() {
        let mut builder = AudioPacketBuilder::new(8);
        assert!(builder.build(&[0u8; 9], 48000, true, 0).is_none());
    }

    fn sample_handshake() -> Handshake {
        Handshake {
            pair_status: 1,
            unique_id: *b"0123456789ABCDEF",
            device_name: "vita".to_string(),
            display_width: 0,
            display_height: 0,
            flags: 0,
        }
    }

    #[test]
    fn test_handshake_roundtrip() {
        let hs = sample_handshake();
        let mut buffer = [0u8; HANDSHAKE_SIZE];
        assert_eq!(hs.encode(&mut buffer), HANDSHAKE_SIZE);

        let parsed = Handshake::parse(&buffer).unwrap();
        assert_eq!(parsed, hs);
        assert_eq!(parsed.device_name, "vita");
        assert_eq!(parsed.unique_id_string(), "0123456789ABCDEF");
    }

    #[test]
    fn test_handshake_alt_magic_accepted() {
        let hs = sample_handshake();
        let mut buffer = [0u8; HANDSHAKE_SIZE];
        hs.encode(&mut buffer);
        buffer[0..4].copy_from_slice(&HANDSHAKE_MAGIC_ALT.to_le_bytes());
        assert!(Handshake::parse(&buffer).is_some());
    }

    #[test]
    fn test_handshake_other_magics_rejected() {
        let hs = sample_handshake();
        let mut buffer = [0u8; HANDSHAKE_SIZE];
        hs.encode(&mut buffer);

        for magic in [AUDIO_MAGIC, PING_MAGIC, CTRL_STOP, 0xDEAD_BEEF, 0] {
            buffer[0..4].copy_from_slice(&magic.to_le_bytes());
            assert!(Handshake::parse(&buffer).is_none(), "magic {magic:08X}");
        }
    }

    #[test]
    fn test_handshake_rejects_bad_fields() {
        let hs = sample_handshake();
        let mut buffer = [0u8; HANDSHAKE_SIZE];

        hs.encode(&mut buffer);
        buffer[4] = 1; // wrong version
        assert!(Handshake::parse(&buffer).is_none());

        hs.encode(&mut buffer);
        buffer[5] = 2; // pair_status out of range
        assert!(Handshake::parse(&buffer).is_none());

        hs.encode(&mut buffer);
        buffer[6] = 8; // uniqueid_len must be 16
        assert!(Handshake::parse(&buffer).is_none());

        hs.encode(&mut buffer);
        buffer[23] = 65; // devicename too long
        assert!(Handshake::parse(&buffer).is_none());
    }

    #[test]
    fn test_control_roundtrip() {
        let mut buffer = [0u8; CONTROL_SIZE];
        ControlPacket::stop().encode(&mut buffer);
        assert_eq!(ControlPacket::parse(&buffer).unwrap().magic, CTRL_STOP);

        ControlPacket::start().encode(&mut buffer);
        assert_eq!(ControlPacket::parse(&buffer).unwrap().magic, CTRL_START);

        // Length is part of the contract.
        assert!(ControlPacket::parse(&buffer[..7]).is_none());
        let long = [0u8; 9];
        assert!(ControlPacket::parse(&long).is_none());
    }

    #[test]
    fn test_ping_roundtrip() {
        let ping = PingPacket {
            timestamp_us: 1_700_000_000_000_000,
        };
        let mut buffer = [0u8; PING_SIZE];
        assert_eq!(ping.encode(&mut buffer), PING_SIZE);
        assert_eq!(PingPacket::parse(&buffer).unwrap(), ping);
        assert!(PingPacket::parse(&buffer[..11]).is_none());
    }

    #[test]
    fn test_peek_magic() {
        assert_eq!(peek_magic(&[0x43, 0x49, 0x4D, 0x4D]), Some(AUDIO_MAGIC));
        assert_eq!(peek_magic(&[1, 2, 3]), None);
    }
}
