//! Signed node records. The overlay treats ENRs as opaque signed blobs; the
//! only structure this crate relies on is the embedded public key (for the
//! node id), the sequence number, and the UDP endpoint.

use crate::error::{WireError, WireResult};
use crate::types::NodeId;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::SocketAddrV4;

const PUBKEY_SIZE: usize = 32;
const SIGNATURE_SIZE: usize = 64;
const MIN_ENR_SIZE: usize = PUBKEY_SIZE + 8 + 1 + SIGNATURE_SIZE;

/// A signed record binding a node id to its transport coordinates.
#[derive(Clone, PartialEq, Eq)]
pub struct Enr {
    pub public_key: [u8; PUBKEY_SIZE],
    pub seq: u64,
    pub udp: Option<SocketAddrV4>,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Enr {
    pub fn node_id(&self) -> NodeId {
        let digest = Sha256::digest(self.public_key);
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&digest);
        NodeId(raw)
    }

    /// The byte string that the record signature covers.
    pub fn signed_payload(public_key: &[u8; PUBKEY_SIZE], seq: u64, udp: Option<SocketAddrV4>) -> Vec<u8> {
        let mut out = Vec::with_capacity(PUBKEY_SIZE + 8 + 7);
        out.extend_from_slice(public_key);
        out.extend_from_slice(&seq.to_be_bytes());
        match udp {
            Some(addr) => {
                out.push(1);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            None => out.push(0),
        }
        out
    }

    pub fn verify(&self) -> WireResult<()> {
        let key = VerifyingKey::from_bytes(&self.public_key)
            .map_err(|e| WireError::InvalidEnr(e.to_string()))?;
        let payload = Self::signed_payload(&self.public_key, self.seq, self.udp);
        let sig = Signature::from_bytes(&self.signature);
        key.verify(&payload, &sig)
            .map_err(|_| WireError::BadEnrSignature)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Self::signed_payload(&self.public_key, self.seq, self.udp);
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn decode(buf: &[u8]) -> WireResult<Enr> {
        if buf.len() < MIN_ENR_SIZE {
            return Err(WireError::Truncated {
                needed: MIN_ENR_SIZE,
                had: buf.len(),
            });
        }
        let mut public_key = [0u8; PUBKEY_SIZE];
        public_key.copy_from_slice(&buf[..PUBKEY_SIZE]);
        let mut seq_raw = [0u8; 8];
        seq_raw.copy_from_slice(&buf[PUBKEY_SIZE..PUBKEY_SIZE + 8]);
        let seq = u64::from_be_bytes(seq_raw);
        let mut at = PUBKEY_SIZE + 8;
        let udp = match buf[at] {
            0 => {
                at += 1;
                None
            }
            1 => {
                at += 1;
                if buf.len() < at + 6 + SIGNATURE_SIZE {
                    return Err(WireError::Truncated {
                        needed: at + 6 + SIGNATURE_SIZE,
                        had: buf.len(),
                    });
                }
                let ip = std::net::Ipv4Addr::new(buf[at], buf[at + 1], buf[at + 2], buf[at + 3]);
                let port = u16::from_be_bytes([buf[at + 4], buf[at + 5]]);
                at += 6;
                Some(SocketAddrV4::new(ip, port))
            }
            other => {
                return Err(WireError::InvalidEnr(format!(
                    "unknown endpoint tag {other}"
                )));
            }
        };
        if buf.len() != at + SIGNATURE_SIZE {
            return Err(WireError::InvalidEnr("bad record length".to_string()));
        }
        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&buf[at..at + SIGNATURE_SIZE]);
        Ok(Enr {
            public_key,
            seq,
            udp,
            signature,
        })
    }

    /// Canonical `enr:<base64url>` text form, used for bootnode lists and
    /// the persisted identity record.
    pub fn to_text(&self) -> String {
        format!("enr:{}", URL_SAFE_NO_PAD.encode(self.encode()))
    }

    pub fn from_text(text: &str) -> WireResult<Enr> {
        let body = text
            .strip_prefix("enr:")
            .ok_or_else(|| WireError::InvalidEnr("missing enr: prefix".to_string()))?;
        let raw = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|e| WireError::InvalidEnr(e.to_string()))?;
        Enr::decode(&raw)
    }
}

impl fmt::Debug for Enr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enr")
            .field("node_id", &self.node_id())
            .field("seq", &self.seq)
            .field("udp", &self.udp)
            .finish()
    }
}

// In overlay messages a record is an opaque byte list; the record codec
// above defines those bytes.
impl ssz::Encode for Enr {
    fn is_ssz_fixed_len() -> bool {
        false
    }

    fn ssz_bytes_len(&self) -> usize {
        self.encode().len()
    }

    fn ssz_append(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.encode());
    }
}

impl ssz::Decode for Enr {
    fn is_ssz_fixed_len() -> bool {
        false
    }

    fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, ssz::DecodeError> {
        Enr::decode(bytes).map_err(|err| ssz::DecodeError::BytesInvalid(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeKeypair;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn text_round_trip() {
        let mut rng = StdRng::seed_from_u64(7);
        let keypair = NodeKeypair::generate(&mut rng);
        let enr = keypair.make_enr(3, Some("127.0.0.1:9000".parse().unwrap()));
        let text = enr.to_text();
        let back = Enr::from_text(&text).unwrap();
        assert_eq!(back, enr);
        back.verify().unwrap();
    }

    #[test]
    fn tampered_record_fails_verification() {
        let mut rng = StdRng::seed_from_u64(8);
        let keypair = NodeKeypair::generate(&mut rng);
        let mut enr = keypair.make_enr(1, None);
        enr.seq = 2;
        assert_eq!(enr.verify(), Err(WireError::BadEnrSignature));
    }

    #[test]
    fn node_id_is_key_digest() {
        let mut rng = StdRng::seed_from_u64(9);
        let keypair = NodeKeypair::generate(&mut rng);
        let enr = keypair.make_enr(1, None);
        assert_eq!(enr.node_id(), keypair.node_id());
    }
}
