//! Collapsing many alternative policy digests into one.
//!
//! TPM2_PolicyOR accepts at most eight digests. Longer lists are split into
//! consecutive groups of eight, each group is ORed, and the group results
//! become the next level, until a single digest is left. A group holding a
//! single digest is submitted as `[d, d]` since PolicyOR needs two entries.
//!
//! At execution time the branch that matched is followed upwards: at every
//! level the group containing the current digest is submitted, and the
//! position within the next level is the group number.

use crate::digest::{policy_or_digest, Digest, HashAlgorithm};

/// Maximum number of digests in one TPM2_PolicyOR call
pub const MAX_OR_DIGESTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrTree {
    /// `levels[0]` groups the leaves; the last level has exactly one group.
    levels: Vec<Vec<Vec<Digest>>>,
    leaves: usize,
    root: Digest,
}

impl OrTree {
    /// `None` when there are no digests to combine.
    pub fn build(alg: HashAlgorithm, digests: &[Digest]) -> Option<Self> {
        if digests.is_empty() {
            return None;
        }
        let mut levels = Vec::new();
        let mut current = digests.to_vec();
        loop {
            let groups: Vec<Vec<Digest>> = current
                .chunks(MAX_OR_DIGESTS)
                .map(|chunk| match chunk {
                    [single] => vec![single.clone(), single.clone()],
                    _ => chunk.to_vec(),
                })
                .collect();
            current = groups
                .iter()
                .map(|group| policy_or_digest(alg, group))
                .collect();
            levels.push(groups);
            if current.len() == 1 {
                break;
            }
        }
        let root = current.remove(0);
        Some(Self {
            levels,
            leaves: digests.len(),
            root,
        })
    }

    /// The session digest after every PolicyOR along any path.
    pub fn root(&self) -> &Digest {
        &self.root
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// The PolicyOR arguments, in submission order, that take a session
    /// whose digest is leaf `leaf` to the root.
    pub fn path(&self, leaf: usize) -> Option<Vec<&[Digest]>> {
        if leaf >= self.leaves {
            return None;
        }
        let mut position = leaf;
        let mut path = Vec::with_capacity(self.levels.len());
        for groups in &self.levels {
            let group = groups.get(position / MAX_OR_DIGESTS)?;
            path.push(group.as_slice());
            position /= MAX_OR_DIGESTS;
        }
        Some(path)
    }
}
