use portal_wire::messages::{self, Accept, FindContent, FindNodes, Message, Offer, Ping};
use portal_wire::types::Distance;
use portal_wire::RawContentKey;
use proptest::prelude::*;

proptest! {
    #[test]
    fn ping_round_trips(enr_seq in any::<u64>(), payload in proptest::collection::vec(any::<u8>(), 0..64)) {
        let msg = Message::Ping(Ping { enr_seq, custom_payload: payload });
        prop_assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn findnodes_round_trips(distances in proptest::collection::vec(0u16..=256, 0..64)) {
        let msg = Message::FindNodes(FindNodes { distances });
        prop_assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn findcontent_round_trips(key in proptest::collection::vec(any::<u8>(), 0..80)) {
        let msg = Message::FindContent(FindContent { content_key: RawContentKey(key) });
        prop_assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn offer_round_trips(keys in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..40), 0..16)) {
        let msg = Message::Offer(Offer {
            content_keys: keys.into_iter().map(RawContentKey).collect(),
        });
        prop_assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn accept_round_trips(connection_id in any::<u16>(), bits in proptest::collection::vec(any::<bool>(), 0..64)) {
        let msg = Message::Accept(Accept { connection_id, content_keys: bits });
        prop_assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn radius_payload_round_trips(raw in any::<[u8; 32]>()) {
        let radius = Distance(raw);
        prop_assert_eq!(messages::parse_radius(&messages::radius_payload(radius)), Some(radius));
    }

    /// Arbitrary bytes either decode into a message that re-encodes
    /// canonically, or fail with a typed error; never a panic.
    #[test]
    fn decoder_is_total(raw in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = Message::decode(&raw);
    }
}
