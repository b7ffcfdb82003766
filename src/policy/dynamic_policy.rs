//! The boot state dependent half of the policy, approved by signature.
//!
//! Each acceptable PCR state yields one PolicyPCR digest. The digests are
//! ORed together (see [`OrTree`]), the revocation counter is required not
//! to exceed the epoch, and the result is signed with the authorization
//! key so the static policy's PolicyAuthorize accepts it.

use log::{debug, info};
use rayon::prelude::*;

use super::auth_key::{AuthKey, AuthKeyPublic};
use super::data::DynamicPolicyData;
use super::{approved_policy_signing_digest, OrTree, PolicyComputer};
use crate::digest::{pcr_composite_digest, Digest, HashAlgorithm};
use crate::error::{Error, Result};
use crate::tpm::types::{Name, NvOperation, PcrSelectionList, PcrValues};

pub struct DynamicPolicyParams<'a> {
    pub auth_key: &'a AuthKey,
    /// Every acceptable PCR state, in profile order
    pub pcr_values: Vec<PcrValues>,
    pub counter_index: u32,
    pub counter_name: Name,
    pub epoch: u64,
}

/// PolicyPCR digest, from an empty session, for one complete PCR state.
pub fn pcr_branch_digest(
    alg: HashAlgorithm,
    selection: &PcrSelectionList,
    values: &PcrValues,
) -> Result<Digest> {
    let ordered = selection.ordered_values(values).ok_or_else(|| {
        Error::InvalidPcrValues("a selected PCR has no value".to_string())
    })?;
    let mut trial = PolicyComputer::new(alg);
    trial.policy_pcr(&pcr_composite_digest(alg, ordered), selection);
    Ok(trial.into_digest())
}

/// The policy a signature approves, given the branches, counter and epoch.
pub fn authorized_policy_digest(
    alg: HashAlgorithm,
    branch_digests: &[Digest],
    counter_name: &[u8],
    epoch: u64,
) -> Result<Digest> {
    let tree = OrTree::build(alg, branch_digests).ok_or(Error::EmptyResolvedSet)?;
    let mut trial = PolicyComputer::new(alg);
    trial.reset_to(tree.root().clone());
    trial.policy_nv(
        counter_name,
        &epoch.to_be_bytes(),
        0,
        NvOperation::UnsignedLe,
    );
    Ok(trial.into_digest())
}

pub fn compute_dynamic_policy(
    alg: HashAlgorithm,
    params: &DynamicPolicyParams<'_>,
) -> Result<DynamicPolicyData> {
    let first = params.pcr_values.first().ok_or(Error::EmptyResolvedSet)?;
    let selection = PcrSelectionList::from_values(first);
    if selection.is_empty() {
        return Err(Error::InvalidPcrValues(
            "branches select no PCRs".to_string(),
        ));
    }
    if params
        .pcr_values
        .iter()
        .any(|values| PcrSelectionList::from_values(values) != selection)
    {
        return Err(Error::InvalidPcrValues(
            "branches select different PCRs".to_string(),
        ));
    }

    let branch_digests = params
        .pcr_values
        .par_iter()
        .map(|values| pcr_branch_digest(alg, &selection, values))
        .collect::<Result<Vec<_>>>()?;

    let authorized_policy =
        authorized_policy_digest(alg, &branch_digests, &params.counter_name, params.epoch)?;
    let signing_digest = approved_policy_signing_digest(
        params.auth_key.public().name_alg(),
        &authorized_policy,
        &[],
    );
    let signature = params
        .auth_key
        .sign(&signing_digest)
        .map_err(Error::SigningFailure)?;

    info!(
        "authorized {} PCR branches for epoch {}",
        branch_digests.len(),
        params.epoch
    );
    debug!("authorized policy {}", hex::encode(&authorized_policy));

    Ok(DynamicPolicyData {
        alg,
        pcr_selection: selection,
        branch_digests,
        counter_index: params.counter_index,
        counter_name: params.counter_name.clone(),
        epoch: params.epoch,
        authorized_policy,
        signature,
    })
}

impl DynamicPolicyData {
    /// The digest passed to TPM2_VerifySignature. PolicyAuthorize computes
    /// it with the name algorithm of `key`.
    pub fn signing_digest(&self, key: &AuthKeyPublic) -> Digest {
        approved_policy_signing_digest(key.name_alg(), &self.authorized_policy, &[])
    }

    /// Recomputes the authorized policy from the stored branches and epoch
    /// and checks the signature over it.
    pub fn verify(&self, key: &AuthKeyPublic) -> bool {
        match authorized_policy_digest(self.alg, &self.branch_digests, &self.counter_name, self.epoch)
        {
            Ok(digest) if digest == self.authorized_policy => {
                key.verify(&self.signing_digest(key), &self.signature)
            }
            _ => false,
        }
    }
}
