//! Software policy sessions.
//!
//! [`PolicyComputer`] applies the same digest update rules a TPM applies to
//! a policy session, without talking to one. It is used to compute the
//! digests a sealed object and the NV indices are created with, and by the
//! in-memory TPM to keep its own sessions.

use crate::digest::{policy_or_digest, policy_update, Digest, HashAlgorithm};
use crate::marshal::{put_u16, Marshal};
use crate::tpm::types::{CommandCode, NvOperation, PcrSelectionList};

pub mod auth_key;
pub mod data;
pub mod dynamic_policy;
pub mod or_tree;
pub mod static_policy;

pub use data::{DynamicPolicyData, StaticPolicyData};
pub use dynamic_policy::{compute_dynamic_policy, DynamicPolicyParams};
pub use or_tree::OrTree;
pub use static_policy::{compute_static_policy, StaticPolicyParams};

/// A trial policy session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyComputer {
    alg: HashAlgorithm,
    digest: Digest,
}

impl PolicyComputer {
    pub fn new(alg: HashAlgorithm) -> Self {
        Self {
            alg,
            digest: alg.zero(),
        }
    }

    pub fn alg(&self) -> HashAlgorithm {
        self.alg
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn into_digest(self) -> Digest {
        self.digest
    }

    /// Replaces the running digest, as PolicyOR and PolicyAuthorize do.
    pub(crate) fn reset_to(&mut self, digest: Digest) {
        self.digest = digest;
    }

    /// TPM2_PolicyPCR: `H(d || CC || pcrs || pcrDigest)`.
    pub fn policy_pcr(&mut self, pcr_digest: &[u8], selection: &PcrSelectionList) -> &mut Self {
        self.digest = self.alg.hash(&[
            &self.digest,
            &CommandCode::PolicyPCR.to_be_bytes(),
            &selection.to_marshalled(),
            pcr_digest,
        ]);
        self
    }

    /// TPM2_PolicyOR. A real TPM also requires the running digest to be one
    /// of `digests`; a trial session does not.
    pub fn policy_or(&mut self, digests: &[Digest]) -> &mut Self {
        self.digest = policy_or_digest(self.alg, digests);
        self
    }

    /// TPM2_PolicyNV: `H(d || CC || H(operandB || offset || operation) || nvName)`.
    pub fn policy_nv(
        &mut self,
        nv_name: &[u8],
        operand_b: &[u8],
        offset: u16,
        operation: NvOperation,
    ) -> &mut Self {
        let mut args = operand_b.to_vec();
        put_u16(&mut args, offset);
        put_u16(&mut args, operation.value());
        let args = self.alg.hash(&[&args]);
        self.digest = self.alg.hash(&[
            &self.digest,
            &CommandCode::PolicyNV.to_be_bytes(),
            &args,
            nv_name,
        ]);
        self
    }

    pub fn policy_secret(&mut self, auth_name: &[u8], policy_ref: &[u8]) -> &mut Self {
        self.digest = policy_update(
            self.alg,
            &self.digest,
            CommandCode::PolicySecret,
            auth_name,
            policy_ref,
        );
        self
    }

    /// TPM2_PolicyAuthorize. The running digest is first reset to zero, so
    /// anything asserted earlier only matters through the signed approval.
    pub fn policy_authorize(&mut self, key_name: &[u8], policy_ref: &[u8]) -> &mut Self {
        self.digest = policy_update(
            self.alg,
            &self.alg.zero(),
            CommandCode::PolicyAuthorize,
            key_name,
            policy_ref,
        );
        self
    }

    pub fn policy_auth_value(&mut self) -> &mut Self {
        self.digest = self.alg.hash(&[
            &self.digest,
            &CommandCode::PolicyAuthValue.to_be_bytes(),
        ]);
        self
    }

    pub fn policy_command_code(&mut self, code: CommandCode) -> &mut Self {
        self.digest = self.alg.hash(&[
            &self.digest,
            &CommandCode::PolicyCommandCode.to_be_bytes(),
            &code.to_be_bytes(),
        ]);
        self
    }
}

/// The digest a signer approves: `H_sign(approvedPolicy || policyRef)`.
pub fn approved_policy_signing_digest(
    signing_alg: HashAlgorithm,
    approved_policy: &[u8],
    policy_ref: &[u8],
) -> Digest {
    signing_alg.hash(&[approved_policy, policy_ref])
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn command_code_known_answer() -> Result<()> {
        // tpm2_policycommandcode TPM2_CC_Unseal
        let mut trial = PolicyComputer::new(HashAlgorithm::Sha256);
        trial.policy_command_code(CommandCode::Unseal);
        assert_eq!(
            trial.digest(),
            &hex::decode("e613137076524bde487533865884e9732ebee3aacb095d94a6de492ec06c46fa")?
        );
        Ok(())
    }

    #[test]
    fn authorize_discards_earlier_assertions() {
        let alg = HashAlgorithm::Sha256;
        let mut a = PolicyComputer::new(alg);
        a.policy_auth_value().policy_authorize(b"key", &[]);
        let mut b = PolicyComputer::new(alg);
        b.policy_authorize(b"key", &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn nv_assertion_depends_on_operand_and_name() {
        let alg = HashAlgorithm::Sha256;
        let digest = |name: &[u8], operand: &[u8]| {
            PolicyComputer::new(alg)
                .policy_nv(name, operand, 0, NvOperation::Eq)
                .digest()
                .clone()
        };
        assert_ne!(digest(b"a", &[0]), digest(b"b", &[0]));
        assert_ne!(digest(b"a", &[0]), digest(b"a", &[1]));
    }
}
