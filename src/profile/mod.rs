//! PCR profiles.
//!
//! A profile describes every acceptable sequence of PCR extends as a tree:
//! extends run in sequence, and a branch means any one of its children may
//! happen. Resolving the profile walks every path and yields the PCR values
//! each path ends with. All PCRs start from zero; a profile describes what
//! is measured, not the state at power on.
//!
//! The tree lives in an arena. Sub-profiles handed to
//! [`ProfileBuilder::add_branches`] are copied in, so resolved results
//! never alias another builder.

use std::collections::{BTreeMap, BTreeSet};

use log::trace;
use thiserror::Error;

use crate::digest::{Digest, HashAlgorithm};
use crate::tpm::types::{PcrValues, MAX_PCR_INDEX};

pub mod events;
pub mod snap_model;

pub use events::{BootEvent, EventDigest};
pub use snap_model::{add_snap_model_profile, SnapModel, SnapModelProfileParams};

#[derive(Error, Debug, PartialEq)]
pub enum ProfileError {
    #[error("{bank} digest must be {expected} bytes, got {actual}")]
    InvalidDigestLength {
        bank: HashAlgorithm,
        expected: usize,
        actual: usize,
    },
    #[error("at least one sub-profile is required")]
    EmptyBranchSet,
    #[error("invalid PCR index {0}")]
    InvalidPcrIndex(u32),
    #[error("cannot decode signing key ID `{0}`")]
    InvalidSignKeyId(String),
    #[error("event for PCR {pcr} has no {bank} digest")]
    MissingEventDigest { bank: HashAlgorithm, pcr: u32 },
}

pub type Result<T, E = ProfileError> = core::result::Result<T, E>;

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Extend {
        bank: HashAlgorithm,
        index: u32,
        value: Digest,
        next: NodeId,
    },
    Branch {
        children: Vec<NodeId>,
    },
    End,
}

/// Every distinct PCR state one bank can end up in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBranchSet {
    pub bank: HashAlgorithm,
    /// PCRs the profile extends in this bank, ascending
    pub indices: Vec<u32>,
    /// One entry per distinct state, in the order the first path reaching
    /// it was found. Each is sorted by PCR index.
    pub branches: Vec<Vec<(u32, Digest)>>,
}

impl ResolvedBranchSet {
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

type PathState = BTreeMap<(HashAlgorithm, u32), Digest>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileBuilder {
    nodes: Vec<Node>,
    root: NodeId,
    /// The `End` nodes every path currently finishes at
    leaves: Vec<NodeId>,
}

impl Default for ProfileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileBuilder {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::End],
            root: 0,
            leaves: vec![0],
        }
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Appends an extend of `value` into PCR `index` of `bank` to every path.
    pub fn extend_pcr(&mut self, bank: HashAlgorithm, index: u32, value: &[u8]) -> Result<&mut Self> {
        if index > MAX_PCR_INDEX {
            return Err(ProfileError::InvalidPcrIndex(index));
        }
        if value.len() != bank.size() {
            return Err(ProfileError::InvalidDigestLength {
                bank,
                expected: bank.size(),
                actual: value.len(),
            });
        }
        let end = self.push(Node::End);
        for leaf in std::mem::replace(&mut self.leaves, vec![end]) {
            self.nodes[leaf] = Node::Extend {
                bank,
                index,
                value: value.to_vec(),
                next: end,
            };
        }
        Ok(self)
    }

    /// Appends a choice between `profiles` to every path, in the order given.
    pub fn add_branches(&mut self, profiles: &[ProfileBuilder]) -> Result<&mut Self> {
        if profiles.is_empty() {
            return Err(ProfileError::EmptyBranchSet);
        }
        let mut roots = Vec::with_capacity(profiles.len());
        let mut leaves = Vec::new();
        for profile in profiles {
            let offset = self.nodes.len();
            self.nodes
                .extend(profile.nodes.iter().map(|node| relocate(node, offset)));
            roots.push(profile.root + offset);
            leaves.extend(profile.leaves.iter().map(|leaf| leaf + offset));
        }
        for leaf in std::mem::replace(&mut self.leaves, leaves) {
            self.nodes[leaf] = Node::Branch {
                children: roots.clone(),
            };
        }
        Ok(self)
    }

    /// Adds one branch per load sequence, each extending the events of
    /// that sequence into every bank in `banks`.
    pub fn add_load_sequences(
        &mut self,
        banks: &[HashAlgorithm],
        sequences: &[Vec<BootEvent>],
    ) -> Result<&mut Self> {
        let profiles = sequences
            .iter()
            .map(|sequence| -> Result<ProfileBuilder> {
                let mut profile = ProfileBuilder::new();
                for event in sequence {
                    for bank in banks {
                        profile.extend_pcr(*bank, event.pcr(), &event.digest(*bank)?)?;
                    }
                }
                Ok(profile)
            })
            .collect::<Result<Vec<_>>>()?;
        self.add_branches(&profiles)
    }

    /// Banks this profile extends
    pub fn banks(&self) -> BTreeSet<HashAlgorithm> {
        self.slots().into_iter().map(|(bank, _)| bank).collect()
    }

    fn slots(&self) -> BTreeSet<(HashAlgorithm, u32)> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                Node::Extend { bank, index, .. } => Some((*bank, *index)),
                _ => None,
            })
            .collect()
    }

    /// Calls `visit` with the PCR state at the end of every path, in order.
    ///
    /// This visits every path, so its cost is the number of paths: a profile
    /// with k independent two-way branches has 2^k of them. Keeping that
    /// bounded is up to whoever builds the profile.
    fn walk(&self, mut visit: impl FnMut(&PathState)) {
        let mut stack = vec![(self.root, PathState::new())];
        let mut paths = 0usize;
        while let Some((id, mut state)) = stack.pop() {
            match &self.nodes[id] {
                Node::Extend {
                    bank,
                    index,
                    value,
                    next,
                } => {
                    let current = state.entry((*bank, *index)).or_insert_with(|| bank.zero());
                    let extended = bank.extend(current.as_slice(), value);
                    *current = extended;
                    stack.push((*next, state));
                }
                Node::Branch { children } => {
                    // reversed so the first child is walked first
                    for child in children.iter().rev() {
                        stack.push((*child, state.clone()));
                    }
                }
                Node::End => {
                    paths += 1;
                    visit(&state);
                }
            }
        }
        trace!("walked {paths} profile paths");
    }

    /// Every distinct PCR state of `bank` the profile allows.
    ///
    /// Cost is proportional to the number of paths, see [`Self::walk`].
    pub fn resolve(&self, bank: HashAlgorithm) -> ResolvedBranchSet {
        let indices: Vec<u32> = self
            .slots()
            .into_iter()
            .filter(|(b, _)| *b == bank)
            .map(|(_, index)| index)
            .collect();
        let mut branches = Vec::new();
        if !indices.is_empty() {
            let mut seen = BTreeSet::new();
            self.walk(|state| {
                let branch: Vec<(u32, Digest)> = indices
                    .iter()
                    .map(|index| {
                        let value = state.get(&(bank, *index)).cloned();
                        (*index, value.unwrap_or_else(|| bank.zero()))
                    })
                    .collect();
                if seen.insert(branch.clone()) {
                    branches.push(branch);
                }
            });
        }
        ResolvedBranchSet {
            bank,
            indices,
            branches,
        }
    }

    /// Every distinct multi-bank PCR state the profile allows, in path order.
    pub fn compute_pcr_values(&self) -> Vec<PcrValues> {
        let slots = self.slots();
        let mut seen = BTreeSet::new();
        let mut values = Vec::new();
        if slots.is_empty() {
            return values;
        }
        self.walk(|state| {
            let mut world = PcrValues::new();
            for (bank, index) in &slots {
                let value = state.get(&(*bank, *index)).cloned();
                world
                    .entry(*bank)
                    .or_default()
                    .insert(*index, value.unwrap_or_else(|| bank.zero()));
            }
            if seen.insert(world.clone()) {
                values.push(world);
            }
        });
        values
    }
}

fn relocate(node: &Node, offset: usize) -> Node {
    match node {
        Node::Extend {
            bank,
            index,
            value,
            next,
        } => Node::Extend {
            bank: *bank,
            index: *index,
            value: value.clone(),
            next: next + offset,
        },
        Node::Branch { children } => Node::Branch {
            children: children.iter().map(|child| child + offset).collect(),
        },
        Node::End => Node::End,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    const SHA256: HashAlgorithm = HashAlgorithm::Sha256;

    fn d(data: &str) -> Digest {
        SHA256.hash(&[data.as_bytes()])
    }

    fn single(index: u32, data: &str) -> Result<ProfileBuilder> {
        let mut profile = ProfileBuilder::new();
        profile.extend_pcr(SHA256, index, &d(data))?;
        Ok(profile)
    }

    #[test]
    fn linear_profile_is_iterated_extend() -> Result<()> {
        let mut profile = ProfileBuilder::new();
        profile
            .extend_pcr(SHA256, 4, &d("a"))?
            .extend_pcr(SHA256, 4, &d("b"))?
            .extend_pcr(SHA256, 7, &d("c"))?;
        let resolved = profile.resolve(SHA256);
        let pcr4 = SHA256.extend(&SHA256.extend(&SHA256.zero(), &d("a")), &d("b"));
        let pcr7 = SHA256.extend(&SHA256.zero(), &d("c"));
        assert_eq!(resolved.indices, vec![4, 7]);
        assert_eq!(resolved.branches, vec![vec![(4, pcr4), (7, pcr7)]]);
        Ok(())
    }

    #[test]
    fn scenario_two_alternatives() -> Result<()> {
        let mut profile = ProfileBuilder::new();
        profile
            .extend_pcr(SHA256, 7, &d("A"))?
            .add_branches(&[single(8, "B1")?, single(8, "B2")?])?;
        let resolved = profile.resolve(SHA256);
        let pcr7 = SHA256.extend(&SHA256.zero(), &d("A"));
        assert_eq!(
            resolved.branches,
            vec![
                vec![(7, pcr7.clone()), (8, SHA256.extend(&SHA256.zero(), &d("B1")))],
                vec![(7, pcr7), (8, SHA256.extend(&SHA256.zero(), &d("B2")))],
            ]
        );
        Ok(())
    }

    #[test]
    fn union_without_duplicates() -> Result<()> {
        let mut a = ProfileBuilder::new();
        a.add_branches(&[single(8, "x")?, single(8, "y")?])?;
        let mut b = ProfileBuilder::new();
        b.add_branches(&[single(8, "y")?, single(8, "z")?])?;

        let mut ab = ProfileBuilder::new();
        ab.add_branches(&[a.clone(), b.clone()])?;
        let mut ba = ProfileBuilder::new();
        ba.add_branches(&[b, a])?;

        let ab = ab.resolve(SHA256).branches;
        let ba = ba.resolve(SHA256).branches;
        assert_eq!(ab.len(), 3);
        let as_set = |v: &Vec<Vec<(u32, Digest)>>| v.iter().cloned().collect::<BTreeSet<_>>();
        assert_eq!(as_set(&ab), as_set(&ba));
        assert_ne!(ab, ba);
        Ok(())
    }

    #[test]
    fn independent_branches_multiply() -> Result<()> {
        let mut profile = ProfileBuilder::new();
        for k in 0..5u32 {
            profile.add_branches(&[single(k, "left")?, single(k, "right")?])?;
        }
        assert_eq!(profile.resolve(SHA256).len(), 32);
        Ok(())
    }

    #[test]
    fn untouched_pcrs_read_zero_on_a_path() -> Result<()> {
        let mut profile = ProfileBuilder::new();
        profile.add_branches(&[single(4, "a")?, single(5, "b")?])?;
        let resolved = profile.resolve(SHA256);
        assert_eq!(resolved.indices, vec![4, 5]);
        assert_eq!(resolved.branches[0][1], (5, SHA256.zero()));
        assert_eq!(resolved.branches[1][0], (4, SHA256.zero()));
        Ok(())
    }

    #[test]
    fn extends_after_branches_apply_to_every_path() -> Result<()> {
        let mut profile = ProfileBuilder::new();
        profile
            .add_branches(&[single(4, "a")?, single(4, "b")?])?
            .extend_pcr(SHA256, 4, &d("c"))?;
        let resolved = profile.resolve(SHA256);
        let expected: Vec<_> = ["a", "b"]
            .iter()
            .map(|x| {
                let pcr = SHA256.extend(&SHA256.zero(), &d(x));
                vec![(4, SHA256.extend(&pcr, &d("c")))]
            })
            .collect();
        assert_eq!(resolved.branches, expected);
        Ok(())
    }

    #[test]
    fn banks_resolve_independently() -> Result<()> {
        let sha1 = HashAlgorithm::Sha1;
        let mut profile = ProfileBuilder::new();
        profile
            .extend_pcr(sha1, 7, &sha1.hash(&[b"A"]))?
            .extend_pcr(SHA256, 7, &d("A"))?;
        assert_eq!(
            profile.banks(),
            [sha1, SHA256].into_iter().collect::<BTreeSet<_>>()
        );
        assert_eq!(profile.resolve(sha1).branches[0][0].1.len(), 20);
        assert!(profile.resolve(HashAlgorithm::Sha384).is_empty());

        let values = profile.compute_pcr_values();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].len(), 2);
        Ok(())
    }

    #[test]
    fn rejects_bad_input() {
        let mut profile = ProfileBuilder::new();
        assert_eq!(
            profile.extend_pcr(SHA256, 7, &[0; 20]).err(),
            Some(ProfileError::InvalidDigestLength {
                bank: SHA256,
                expected: 32,
                actual: 20
            })
        );
        assert_eq!(
            profile.extend_pcr(SHA256, 32, &d("x")).err(),
            Some(ProfileError::InvalidPcrIndex(32))
        );
        assert_eq!(
            profile.add_branches(&[]).err(),
            Some(ProfileError::EmptyBranchSet)
        );
    }

    #[test]
    fn load_sequences_become_branches() -> Result<()> {
        let sequences = vec![
            vec![BootEvent::EfiAction {
                pcr: 4,
                action: "Calling EFI Application from Boot Option".to_string(),
            }],
            vec![BootEvent::Separator { pcr: 4 }],
        ];
        let mut profile = ProfileBuilder::new();
        profile.add_load_sequences(&[SHA256], &sequences)?;
        assert_eq!(profile.resolve(SHA256).len(), 2);
        Ok(())
    }
}
