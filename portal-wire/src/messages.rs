//! The overlay message set: a selector-tagged SSZ union shared by every
//! Portal sub-network. Encoding is derived; the wrapper layer maps decoder
//! failures onto typed errors and enforces the per-message list bounds.

use crate::constants::{
    MAX_CONTENT_KEY_SIZE, MAX_ENRS_PER_RESPONSE, MAX_FINDNODES_DISTANCES, MAX_KEYS_PER_OFFER,
};
use crate::content_key::RawContentKey;
use crate::enr::Enr;
use crate::error::{WireError, WireResult};
use crate::types::Distance;
use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};

pub const SELECTOR_PING: u8 = 0x00;
pub const SELECTOR_PONG: u8 = 0x01;
pub const SELECTOR_FINDNODES: u8 = 0x02;
pub const SELECTOR_NODES: u8 = 0x03;
pub const SELECTOR_FINDCONTENT: u8 = 0x04;
pub const SELECTOR_CONTENT: u8 = 0x05;
pub const SELECTOR_OFFER: u8 = 0x06;
pub const SELECTOR_ACCEPT: u8 = 0x07;

/// Liveness probe carrying the sender's record sequence number and a custom
/// payload (the storage radius for history/state/beacon networks).
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Ping {
    pub enr_seq: u64,
    pub custom_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Pong {
    pub enr_seq: u64,
    pub custom_payload: Vec<u8>,
}

/// Requests ENRs from the named log2-distance buckets. Distance 0 asks for
/// the recipient's own record.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FindNodes {
    pub distances: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Nodes {
    /// Number of response messages in the full answer. Always 1 here; kept
    /// on the wire for spec compatibility.
    pub total: u8,
    pub enrs: Vec<Enr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FindContent {
    pub content_key: RawContentKey,
}

/// The three-way CONTENT response union.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum Content {
    /// Content is too large for one message; dial back over uTP with this
    /// connection id.
    ConnectionId(u16),
    /// The content itself, inline.
    Payload(Vec<u8>),
    /// Not stored here; these peers are closer to it.
    Enrs(Vec<Enr>),
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Offer {
    pub content_keys: Vec<RawContentKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Accept {
    pub connection_id: u16,
    /// Flag i set iff offered key i is wanted.
    pub content_keys: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    FindNodes(FindNodes),
    Nodes(Nodes),
    FindContent(FindContent),
    Content(Content),
    Offer(Offer),
    Accept(Accept),
}

impl Message {
    pub fn selector(&self) -> u8 {
        match self {
            Message::Ping(_) => SELECTOR_PING,
            Message::Pong(_) => SELECTOR_PONG,
            Message::FindNodes(_) => SELECTOR_FINDNODES,
            Message::Nodes(_) => SELECTOR_NODES,
            Message::FindContent(_) => SELECTOR_FINDCONTENT,
            Message::Content(_) => SELECTOR_CONTENT,
            Message::Offer(_) => SELECTOR_OFFER,
            Message::Accept(_) => SELECTOR_ACCEPT,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    pub fn decode(buf: &[u8]) -> WireResult<Message> {
        let message = Message::from_ssz_bytes(buf).map_err(WireError::from_ssz)?;
        message.check_limits()?;
        Ok(message)
    }

    /// The derived decoder accepts unbounded lists; the protocol does not.
    fn check_limits(&self) -> WireResult<()> {
        let too_long = |len: usize, limit: usize| WireError::ListTooLong { len, limit };
        match self {
            Message::FindNodes(find) if find.distances.len() > MAX_FINDNODES_DISTANCES => {
                Err(too_long(find.distances.len(), MAX_FINDNODES_DISTANCES))
            }
            Message::Nodes(nodes) if nodes.enrs.len() > MAX_ENRS_PER_RESPONSE => {
                Err(too_long(nodes.enrs.len(), MAX_ENRS_PER_RESPONSE))
            }
            Message::FindContent(find) if find.content_key.0.len() > MAX_CONTENT_KEY_SIZE => {
                Err(too_long(find.content_key.0.len(), MAX_CONTENT_KEY_SIZE))
            }
            Message::Content(Content::Enrs(enrs)) if enrs.len() > MAX_ENRS_PER_RESPONSE => {
                Err(too_long(enrs.len(), MAX_ENRS_PER_RESPONSE))
            }
            Message::Offer(offer) if offer.content_keys.len() > MAX_KEYS_PER_OFFER => {
                Err(too_long(offer.content_keys.len(), MAX_KEYS_PER_OFFER))
            }
            Message::Accept(accept) if accept.content_keys.len() > MAX_KEYS_PER_OFFER => {
                Err(too_long(accept.content_keys.len(), MAX_KEYS_PER_OFFER))
            }
            _ => Ok(()),
        }
    }
}

/// Builds the PING/PONG custom payload advertising a storage radius.
pub fn radius_payload(radius: Distance) -> Vec<u8> {
    radius.to_le_bytes().to_vec()
}

/// Extracts a radius from a PING/PONG custom payload.
pub fn parse_radius(payload: &[u8]) -> Option<Distance> {
    let raw: [u8; 32] = payload.try_into().ok()?;
    Some(Distance::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeKeypair;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn sample_enrs(n: usize) -> Vec<Enr> {
        let mut rng = StdRng::seed_from_u64(42);
        (0..n)
            .map(|i| {
                NodeKeypair::generate(&mut rng)
                    .make_enr(i as u64, Some("10.0.0.1:9009".parse().unwrap()))
            })
            .collect()
    }

    #[test]
    fn ping_pong_round_trip() {
        let msg = Message::Ping(Ping {
            enr_seq: 17,
            custom_payload: radius_payload(Distance::MAX),
        });
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        if let Message::Ping(ping) = decoded {
            assert_eq!(parse_radius(&ping.custom_payload), Some(Distance::MAX));
        }
    }

    #[test]
    fn selector_byte_leads_the_encoding() {
        let msg = Message::Pong(Pong {
            enr_seq: 1,
            custom_payload: Vec::new(),
        });
        assert_eq!(msg.encode()[0], SELECTOR_PONG);
        assert_eq!(msg.selector(), SELECTOR_PONG);
    }

    #[test]
    fn findnodes_round_trip() {
        let msg = Message::FindNodes(FindNodes {
            distances: vec![0, 255, 254, 240],
        });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn nodes_round_trip() {
        let msg = Message::Nodes(Nodes {
            total: 1,
            enrs: sample_enrs(3),
        });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn content_union_round_trip() {
        for content in [
            Content::ConnectionId(0xbeef),
            Content::Payload(vec![1, 2, 3, 4]),
            Content::Enrs(sample_enrs(2)),
        ] {
            let msg = Message::Content(content);
            assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn offer_accept_round_trip() {
        let offer = Message::Offer(Offer {
            content_keys: vec![
                RawContentKey(vec![0x00; 33]),
                RawContentKey(vec![0x01; 33]),
                RawContentKey(vec![0x02; 33]),
            ],
        });
        assert_eq!(Message::decode(&offer.encode()).unwrap(), offer);

        let accept = Message::Accept(Accept {
            connection_id: 0x1234,
            content_keys: vec![true, false, true],
        });
        assert_eq!(Message::decode(&accept.encode()).unwrap(), accept);
    }

    #[test]
    fn unknown_selector_is_a_typed_error() {
        assert_eq!(
            Message::decode(&[0x4f, 0, 0]),
            Err(WireError::UnknownSelector(0x4f))
        );
    }

    #[test]
    fn content_unknown_union_selector() {
        assert_eq!(
            Message::decode(&[SELECTOR_CONTENT, 0x03, 0]),
            Err(WireError::UnknownSelector(0x03))
        );
    }

    #[test]
    fn oversized_offer_is_rejected() {
        let offer = Message::Offer(Offer {
            content_keys: vec![RawContentKey(vec![0x00; 33]); MAX_KEYS_PER_OFFER + 1],
        });
        assert!(matches!(
            Message::decode(&offer.encode()),
            Err(WireError::ListTooLong { .. })
        ));
    }
}
