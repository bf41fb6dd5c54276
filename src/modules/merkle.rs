use ethers::types::H256;
use ethers::utils::keccak256;

/// Keccak Merkle tree with sorted pair hashing.
///
/// Leaves are used as given (callers hash them first). An unpaired node is promoted to the
/// next layer unchanged, which is what the on-chain `MerkleProof.verify` expects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleTree {
    layers: Vec<Vec<H256>>,
}

impl MerkleTree {
    /// Returns `None` for an empty leaf set.
    pub fn new(leaves: Vec<H256>) -> Option<Self> {
        if leaves.is_empty() {
            return None;
        }

        let mut layers = vec![leaves];
        while layers.last().map_or(0, Vec::len) > 1 {
            let prev = layers.last().cloned().unwrap_or_default();
            let next = prev
                .chunks(2)
                .map(|pair| match pair {
                    [a, b] => hash_pair(*a, *b),
                    [a] => *a,
                    _ => H256::zero(),
                })
                .collect();
            layers.push(next);
        }
        Some(Self { layers })
    }

    pub fn root(&self) -> H256 {
        self.layers
            .last()
            .and_then(|l| l.first().copied())
            .unwrap_or_default()
    }

    pub fn leaves(&self) -> &[H256] {
        self.layers.first().map(Vec::as_slice).unwrap_or_default()
    }

    /// Sibling path from leaf `index` up to the root.
    pub fn proof(&self, index: usize) -> Option<Vec<H256>> {
        if index >= self.leaves().len() {
            return None;
        }

        let mut proof = Vec::new();
        let mut idx = index;
        for layer in &self.layers[..self.layers.len() - 1] {
            let sibling = idx ^ 1;
            if sibling < layer.len() {
                proof.push(layer[sibling]);
            }
            idx /= 2;
        }
        Some(proof)
    }

    pub fn verify(proof: &[H256], leaf: H256, root: H256) -> bool {
        proof.iter().fold(leaf, |acc, sibling| hash_pair(acc, *sibling)) == root
    }
}

fn hash_pair(a: H256, b: H256) -> H256 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(lo.as_bytes());
    buf[32..].copy_from_slice(hi.as_bytes());
    H256::from(keccak256(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(n: u8) -> H256 {
        H256::from(keccak256([n]))
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let tree = MerkleTree::new(vec![leaf(1)]).unwrap();
        assert_eq!(tree.root(), leaf(1));
        assert_eq!(tree.proof(0).unwrap(), Vec::<H256>::new());
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        for n in 1..=7u8 {
            let leaves: Vec<H256> = (0..n).map(leaf).collect();
            let tree = MerkleTree::new(leaves.clone()).unwrap();
            for (i, l) in leaves.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                assert!(MerkleTree::verify(&proof, *l, tree.root()), "n={n} i={i}");
            }
        }
    }

    #[test]
    fn pair_hashing_is_order_independent() {
        let a = MerkleTree::new(vec![leaf(1), leaf(2)]).unwrap();
        let b = MerkleTree::new(vec![leaf(2), leaf(1)]).unwrap();
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn foreign_leaf_does_not_verify() {
        let tree = MerkleTree::new(vec![leaf(1), leaf(2), leaf(3)]).unwrap();
        let proof = tree.proof(0).unwrap();
        assert!(!MerkleTree::verify(&proof, leaf(9), tree.root()));
    }

    #[test]
    fn empty_tree_is_rejected() {
        assert!(MerkleTree::new(vec![]).is_none());
    }
}
