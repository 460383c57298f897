//! uTP packet framing: 20-byte big-endian header, an extension chain that in
//! practice carries at most one selective-ACK bitmap, and the payload.

use crate::error::{UtpError, UtpResult};

pub const HEADER_SIZE: usize = 20;
pub const PROTOCOL_VERSION: u8 = 1;

const EXTENSION_NONE: u8 = 0;
const EXTENSION_SELECTIVE_ACK: u8 = 1;
const SELECTIVE_ACK_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data,
    Fin,
    State,
    Reset,
    Syn,
}

impl PacketType {
    fn to_nibble(self) -> u8 {
        match self {
            PacketType::Data => 0,
            PacketType::Fin => 1,
            PacketType::State => 2,
            PacketType::Reset => 3,
            PacketType::Syn => 4,
        }
    }

    fn from_nibble(raw: u8) -> UtpResult<Self> {
        match raw {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Fin),
            2 => Ok(PacketType::State),
            3 => Ok(PacketType::Reset),
            4 => Ok(PacketType::Syn),
            _ => Err(UtpError::MalformedPacket("unknown packet type")),
        }
    }
}

/// Bitmap over the 32 sequence numbers after `ack_nr + 1`: bit `i` set means
/// `ack_nr + 2 + i` has been received out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelectiveAck(pub u32);

impl SelectiveAck {
    pub fn is_set(&self, bit: u32) -> bool {
        bit < 32 && self.0 & (1 << bit) != 0
    }

    pub fn set(&mut self, bit: u32) {
        if bit < 32 {
            self.0 |= 1 << bit;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Sequence numbers the bitmap marks as received, given the ack it rode
    /// on.
    pub fn acked_seqs(&self, ack_nr: u16) -> impl Iterator<Item = u16> + '_ {
        (0..32u32)
            .filter(|bit| self.is_set(*bit))
            .map(move |bit| ack_nr.wrapping_add(2).wrapping_add(bit as u16))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub ptype: PacketType,
    pub connection_id: u16,
    /// Sender clock at transmit time, microseconds, truncated to 32 bits.
    pub timestamp_micros: u32,
    /// Receiver-measured one-way delay echoed back to the sender.
    pub timestamp_diff_micros: u32,
    /// Advertised receive window in bytes.
    pub wnd_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
    pub selective_ack: Option<SelectiveAck>,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn encoded_len(&self) -> usize {
        let ext = if self.selective_ack.is_some() {
            2 + SELECTIVE_ACK_BYTES
        } else {
            0
        };
        HEADER_SIZE + ext + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push((self.ptype.to_nibble() << 4) | PROTOCOL_VERSION);
        out.push(if self.selective_ack.is_some() {
            EXTENSION_SELECTIVE_ACK
        } else {
            EXTENSION_NONE
        });
        out.extend_from_slice(&self.connection_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp_micros.to_be_bytes());
        out.extend_from_slice(&self.timestamp_diff_micros.to_be_bytes());
        out.extend_from_slice(&self.wnd_size.to_be_bytes());
        out.extend_from_slice(&self.seq_nr.to_be_bytes());
        out.extend_from_slice(&self.ack_nr.to_be_bytes());
        if let Some(sack) = self.selective_ack {
            out.push(EXTENSION_NONE); // terminates the chain
            out.push(SELECTIVE_ACK_BYTES as u8);
            out.extend_from_slice(&sack.0.to_le_bytes());
        }
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> UtpResult<Packet> {
        if buf.len() < HEADER_SIZE {
            return Err(UtpError::MalformedPacket("truncated header"));
        }
        let version = buf[0] & 0x0f;
        if version != PROTOCOL_VERSION {
            return Err(UtpError::MalformedPacket("unknown version"));
        }
        let ptype = PacketType::from_nibble(buf[0] >> 4)?;
        let mut next_extension = buf[1];
        let connection_id = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp_micros = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let timestamp_diff_micros = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let wnd_size = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let seq_nr = u16::from_be_bytes([buf[16], buf[17]]);
        let ack_nr = u16::from_be_bytes([buf[18], buf[19]]);

        let mut at = HEADER_SIZE;
        let mut selective_ack = None;
        while next_extension != EXTENSION_NONE {
            if buf.len() < at + 2 {
                return Err(UtpError::MalformedPacket("unterminated extension chain"));
            }
            let this_extension = next_extension;
            next_extension = buf[at];
            let len = buf[at + 1] as usize;
            at += 2;
            if buf.len() < at + len {
                return Err(UtpError::MalformedPacket("truncated extension"));
            }
            if this_extension == EXTENSION_SELECTIVE_ACK {
                if len < SELECTIVE_ACK_BYTES {
                    return Err(UtpError::MalformedPacket("short selective ack"));
                }
                selective_ack = Some(SelectiveAck(u32::from_le_bytes([
                    buf[at],
                    buf[at + 1],
                    buf[at + 2],
                    buf[at + 3],
                ])));
            }
            // Unknown extensions are length-prefixed, so they are skipped
            // rather than rejected.
            at += len;
        }

        Ok(Packet {
            ptype,
            connection_id,
            timestamp_micros,
            timestamp_diff_micros,
            wnd_size,
            seq_nr,
            ack_nr,
            selective_ack,
            payload: buf[at..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ptype: PacketType, sack: Option<SelectiveAck>, payload: Vec<u8>) -> Packet {
        Packet {
            ptype,
            connection_id: 0x1234,
            timestamp_micros: 1_000_000,
            timestamp_diff_micros: 250,
            wnd_size: 1_048_576,
            seq_nr: 42,
            ack_nr: 41,
            selective_ack: sack,
            payload,
        }
    }

    #[test]
    fn round_trip_all_types() {
        for ptype in [
            PacketType::Data,
            PacketType::Fin,
            PacketType::State,
            PacketType::Reset,
            PacketType::Syn,
        ] {
            let pkt = sample(ptype, None, vec![1, 2, 3]);
            assert_eq!(Packet::decode(&pkt.encode()).unwrap(), pkt);
        }
    }

    #[test]
    fn round_trip_selective_ack() {
        let mut sack = SelectiveAck::default();
        sack.set(0);
        sack.set(5);
        sack.set(31);
        let pkt = sample(PacketType::State, Some(sack), Vec::new());
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
        let seqs: Vec<u16> = decoded.selective_ack.unwrap().acked_seqs(41).collect();
        assert_eq!(seqs, vec![43, 48, 74]);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut raw = sample(PacketType::Data, None, Vec::new()).encode();
        raw[0] = (raw[0] & 0xf0) | 0x02;
        assert_eq!(
            Packet::decode(&raw),
            Err(UtpError::MalformedPacket("unknown version"))
        );
    }

    #[test]
    fn rejects_unterminated_extension_chain() {
        let mut raw = sample(PacketType::State, None, Vec::new()).encode();
        // Claim an extension follows, but provide no extension bytes.
        raw[1] = 1;
        assert_eq!(
            Packet::decode(&raw),
            Err(UtpError::MalformedPacket("unterminated extension chain"))
        );
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(Packet::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn skips_unknown_extension() {
        let pkt = sample(PacketType::Data, None, vec![0xaa, 0xbb]);
        let mut raw = pkt.encode();
        // Splice in an unknown extension (id 7, two bytes) before the payload.
        raw[1] = 7;
        raw.truncate(HEADER_SIZE);
        raw.extend_from_slice(&[0, 2, 0xde, 0xad, 0xaa, 0xbb]);
        let decoded = Packet::decode(&raw).unwrap();
        assert_eq!(decoded.payload, vec![0xaa, 0xbb]);
        assert_eq!(decoded.selective_ack, None);
    }
}
