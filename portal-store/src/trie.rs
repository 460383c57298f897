//! Index-keyed Merkle-Patricia trie roots, as used by the execution layer
//! for `transactions_root` and `receipts_root`. Only construction-and-hash
//! is needed here; there is no lookup or proof surface.

use alloy_primitives::keccak256;
use alloy_rlp::Header;

#[derive(Debug)]
enum Node {
    Empty,
    Leaf {
        path: Vec<u8>,
        value: Vec<u8>,
    },
    Extension {
        path: Vec<u8>,
        child: Box<Node>,
    },
    Branch {
        children: [Option<Box<Node>>; 16],
        value: Option<Vec<u8>>,
    },
}

impl Default for Node {
    fn default() -> Self {
        Node::Empty
    }
}

fn empty_children() -> [Option<Box<Node>>; 16] {
    std::array::from_fn(|_| None)
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn make_leaf(path: &[u8], value: Vec<u8>) -> Box<Node> {
    Box::new(Node::Leaf {
        path: path.to_vec(),
        value,
    })
}

fn insert(node: Node, path: &[u8], value: Vec<u8>) -> Node {
    match node {
        Node::Empty => Node::Leaf {
            path: path.to_vec(),
            value,
        },
        Node::Leaf {
            path: leaf_path,
            value: leaf_value,
        } => {
            let common = common_prefix(&leaf_path, path);
            if common == leaf_path.len() && common == path.len() {
                return Node::Leaf {
                    path: leaf_path,
                    value,
                };
            }
            let mut children = empty_children();
            let mut branch_value = None;
            if leaf_path.len() == common {
                branch_value = Some(leaf_value);
            } else {
                children[leaf_path[common] as usize] =
                    Some(make_leaf(&leaf_path[common + 1..], leaf_value));
            }
            if path.len() == common {
                branch_value = Some(value);
            } else {
                children[path[common] as usize] = Some(make_leaf(&path[common + 1..], value));
            }
            let branch = Node::Branch {
                children,
                value: branch_value,
            };
            if common > 0 {
                Node::Extension {
                    path: path[..common].to_vec(),
                    child: Box::new(branch),
                }
            } else {
                branch
            }
        }
        Node::Extension {
            path: ext_path,
            child,
        } => {
            let common = common_prefix(&ext_path, path);
            if common == ext_path.len() {
                return Node::Extension {
                    path: ext_path,
                    child: Box::new(insert(*child, &path[common..], value)),
                };
            }
            let mut children = empty_children();
            let sub = if ext_path.len() == common + 1 {
                child
            } else {
                Box::new(Node::Extension {
                    path: ext_path[common + 1..].to_vec(),
                    child,
                })
            };
            children[ext_path[common] as usize] = Some(sub);
            let mut branch_value = None;
            if path.len() == common {
                branch_value = Some(value);
            } else {
                children[path[common] as usize] = Some(make_leaf(&path[common + 1..], value));
            }
            let branch = Node::Branch {
                children,
                value: branch_value,
            };
            if common > 0 {
                Node::Extension {
                    path: path[..common].to_vec(),
                    child: Box::new(branch),
                }
            } else {
                branch
            }
        }
        Node::Branch {
            mut children,
            value: branch_value,
        } => {
            if path.is_empty() {
                return Node::Branch {
                    children,
                    value: Some(value),
                };
            }
            let slot = path[0] as usize;
            let existing = children[slot].take().map(|b| *b).unwrap_or(Node::Empty);
            children[slot] = Some(Box::new(insert(existing, &path[1..], value)));
            Node::Branch {
                children,
                value: branch_value,
            }
        }
    }
}

/// Hex-prefix encoding of a nibble path (leaf flag 0x20).
fn hex_prefix(path: &[u8], leaf: bool) -> Vec<u8> {
    let flag: u8 = if leaf { 0x20 } else { 0x00 };
    let mut out;
    if path.len() % 2 == 1 {
        out = Vec::with_capacity(path.len() / 2 + 1);
        out.push(flag | 0x10 | path[0]);
        for pair in path[1..].chunks_exact(2) {
            out.push((pair[0] << 4) | pair[1]);
        }
    } else {
        out = Vec::with_capacity(path.len() / 2 + 1);
        out.push(flag);
        for pair in path.chunks_exact(2) {
            out.push((pair[0] << 4) | pair[1]);
        }
    }
    out
}

fn append_rlp_string(out: &mut Vec<u8>, s: &[u8]) {
    if s.len() == 1 && s[0] < 0x80 {
        out.push(s[0]);
        return;
    }
    Header {
        list: false,
        payload_length: s.len(),
    }
    .encode(out);
    out.extend_from_slice(s);
}

fn wrap_rlp_list(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    out
}

/// Full RLP encoding of a node.
fn encode_node(node: &Node) -> Vec<u8> {
    match node {
        Node::Empty => vec![0x80],
        Node::Leaf { path, value } => {
            let mut payload = Vec::new();
            append_rlp_string(&mut payload, &hex_prefix(path, true));
            append_rlp_string(&mut payload, value);
            wrap_rlp_list(payload)
        }
        Node::Extension { path, child } => {
            let mut payload = Vec::new();
            append_rlp_string(&mut payload, &hex_prefix(path, false));
            payload.extend_from_slice(&node_ref(child));
            wrap_rlp_list(payload)
        }
        Node::Branch { children, value } => {
            let mut payload = Vec::new();
            for child in children {
                match child {
                    Some(child) => payload.extend_from_slice(&node_ref(child)),
                    None => payload.push(0x80),
                }
            }
            match value {
                Some(value) => append_rlp_string(&mut payload, value),
                None => payload.push(0x80),
            }
            wrap_rlp_list(payload)
        }
    }
}

/// A node's reference inside its parent: inline when shorter than 32
/// bytes, otherwise the keccak digest as an RLP string.
fn node_ref(node: &Node) -> Vec<u8> {
    let encoded = encode_node(node);
    if encoded.len() < 32 {
        encoded
    } else {
        let digest = keccak256(&encoded);
        let mut out = Vec::with_capacity(33);
        append_rlp_string(&mut out, digest.as_slice());
        out
    }
}

fn nibbles(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() * 2);
    for byte in key {
        out.push(byte >> 4);
        out.push(byte & 0x0f);
    }
    out
}

/// Root of the trie mapping `rlp(index) -> items[index]`.
pub fn ordered_trie_root(items: &[Vec<u8>]) -> [u8; 32] {
    let mut root = Node::Empty;
    for (index, item) in items.iter().enumerate() {
        let key = alloy_rlp::encode(index as u64);
        root = insert(root, &nibbles(&key), item.clone());
    }
    keccak256(&encode_node(&root)).0
}

#[cfg(test)]
mod tests {
    use super::*;

    /// keccak256(rlp(""))
    const EMPTY_ROOT: &str = "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421";

    #[test]
    fn empty_trie_matches_known_root() {
        assert_eq!(hex::encode(ordered_trie_root(&[])), EMPTY_ROOT);
    }

    #[test]
    fn single_item_trie_is_a_hashed_leaf() {
        let root = ordered_trie_root(&[vec![0xaa; 100]]);
        assert_ne!(hex::encode(root), EMPTY_ROOT);
    }

    #[test]
    fn root_depends_on_order_and_content() {
        let a = vec![vec![1u8; 40], vec![2u8; 40]];
        let b = vec![vec![2u8; 40], vec![1u8; 40]];
        assert_ne!(ordered_trie_root(&a), ordered_trie_root(&b));

        let mut c = a.clone();
        c[1][0] ^= 0xff;
        assert_ne!(ordered_trie_root(&a), ordered_trie_root(&c));
    }

    #[test]
    fn trie_handles_many_items() {
        // Enough items that keys span one and two byte rlp encodings and
        // force branch/extension splits.
        let items: Vec<Vec<u8>> = (0..300u32).map(|i| i.to_be_bytes().to_vec()).collect();
        let root = ordered_trie_root(&items);
        // Deterministic.
        assert_eq!(root, ordered_trie_root(&items));
    }
}
