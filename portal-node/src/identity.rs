//! Identity and bootnode persistence. Four reserved keys in the durable
//! store rehydrate the node across restarts: `enr`, `privateKey`,
//! `publicKey`, and `peers` (a JSON array of ENR text records).

use crate::error::{NodeError, NodeResult};
use portal_store::kv::KvStore;
use portal_wire::enr::Enr;
use portal_wire::identity::NodeKeypair;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const KEY_ENR: &str = "enr";
pub const KEY_PRIVATE: &str = "privateKey";
pub const KEY_PUBLIC: &str = "publicKey";
pub const KEY_PEERS: &str = "peers";

/// On-disk shape of the `peers` record: ENRs in text form.
#[derive(Debug, Serialize, Deserialize, Default)]
struct PeerRecord(Vec<String>);

pub struct PersistedIdentity {
    pub keypair: NodeKeypair,
    pub enr: Enr,
    pub bootnodes: Vec<Enr>,
}

impl PersistedIdentity {
    /// Loads the stored identity, or mints and persists a fresh one.
    pub fn load_or_create<K: KvStore, R: rand::RngCore + rand::CryptoRng>(
        kv: &K,
        rng: &mut R,
    ) -> NodeResult<Self> {
        let keypair = match kv.get(KEY_PRIVATE)? {
            Some(raw) => {
                let secret: [u8; 32] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| NodeError::CorruptIdentity("privateKey length".to_string()))?;
                let keypair = NodeKeypair::from_secret_bytes(secret);
                debug!(node_id = %keypair.node_id(), "rehydrated identity");
                keypair
            }
            None => {
                let keypair = NodeKeypair::generate(rng);
                kv.put(KEY_PRIVATE, &keypair.secret_bytes())?;
                kv.put(KEY_PUBLIC, &keypair.public_bytes())?;
                info!(node_id = %keypair.node_id(), "generated fresh identity");
                keypair
            }
        };

        let enr = match kv.get(KEY_ENR)? {
            Some(raw) => {
                let text = String::from_utf8(raw)
                    .map_err(|_| NodeError::CorruptIdentity("enr encoding".to_string()))?;
                let enr = Enr::from_text(&text)?;
                if enr.node_id() != keypair.node_id() {
                    return Err(NodeError::CorruptIdentity(
                        "stored enr does not match private key".to_string(),
                    ));
                }
                enr
            }
            None => {
                let enr = keypair.make_enr(1, None);
                kv.put(KEY_ENR, enr.to_text().as_bytes())?;
                enr
            }
        };

        let bootnodes = match kv.get(KEY_PEERS)? {
            Some(raw) => {
                let record: PeerRecord = serde_json::from_slice(&raw)
                    .map_err(|e| NodeError::CorruptIdentity(e.to_string()))?;
                record
                    .0
                    .iter()
                    .filter_map(|t| Enr::from_text(t).ok())
                    .collect()
            }
            None => Vec::new(),
        };

        Ok(Self {
            keypair,
            enr,
            bootnodes,
        })
    }

    /// Persists the current record and peer set for the next start.
    pub fn save_peers<K: KvStore>(kv: &K, enr: &Enr, peers: &[Enr]) -> NodeResult<()> {
        kv.put(KEY_ENR, enr.to_text().as_bytes())?;
        let record = PeerRecord(peers.iter().map(Enr::to_text).collect());
        let encoded = serde_json::to_vec(&record)
            .map_err(|e| NodeError::CorruptIdentity(e.to_string()))?;
        kv.put(KEY_PEERS, &encoded)?;
        Ok(())
    }
}
