use crate::enr::Enr;
use crate::types::NodeId;
use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};
use std::net::SocketAddrV4;

/// The local node's signing identity. The node id is the SHA-256 digest of
/// the public key, so it is uniformly distributed over the keyspace.
pub struct NodeKeypair {
    signing: SigningKey,
}

impl NodeKeypair {
    pub fn generate<R: rand::RngCore + rand::CryptoRng>(rng: &mut R) -> Self {
        Self {
            signing: SigningKey::generate(rng),
        }
    }

    pub fn from_secret_bytes(raw: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&raw),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn node_id(&self) -> NodeId {
        let digest = Sha256::digest(self.public_bytes());
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&digest);
        NodeId(raw)
    }

    /// Builds and signs a fresh record for this identity.
    pub fn make_enr(&self, seq: u64, udp: Option<SocketAddrV4>) -> Enr {
        let public_key = self.public_bytes();
        let payload = Enr::signed_payload(&public_key, seq, udp);
        let signature = self.signing.sign(&payload).to_bytes();
        Enr {
            public_key,
            seq,
            udp,
            signature,
        }
    }
}
