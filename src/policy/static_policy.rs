//! The boot state independent half of a sealed object's policy.

use log::debug;

use super::auth_key::AuthKeyPublic;
use super::data::StaticPolicyData;
use super::PolicyComputer;
use crate::digest::{policy_or_digest, Digest, HashAlgorithm};
use crate::error::{Error, Result};
use crate::tpm::types::{Name, NvAttributes, NvOperation, NvPublic, NvType};

/// Attributes a PIN index must carry, ignoring TPMA_NV_WRITTEN
pub const PIN_INDEX_ATTRIBUTES: u32 =
    NvAttributes::POLICYWRITE | NvAttributes::AUTHREAD | NvAttributes::POLICYREAD;

pub const PIN_INDEX_SIZE: u16 = 8;

/// Value the lock index holds while secrets may be released
pub const LOCK_OPEN: [u8; 1] = [0x00];

#[derive(Debug, Clone)]
pub struct StaticPolicyParams {
    pub auth_key: Option<AuthKeyPublic>,
    pub pin_index: NvPublic,
    pub pin_index_auth_policies: Vec<Digest>,
    pub lock_index: u32,
    pub lock_index_name: Name,
}

/// Checks that `public` describes a PIN index created by
/// [`crate::pin::create_pin_index`] with `auth_policies`.
pub fn validate_pin_index_public(public: &NvPublic, auth_policies: &[Digest]) -> Result<()> {
    let invalid = |what: &str| {
        Err(Error::InvalidIndexPublic(format!(
            "PIN index {:#010x}: {what}",
            public.index
        )))
    };
    if public.attributes.nv_type() != Some(NvType::Counter) {
        return invalid("not a counter index");
    }
    let expected = NvAttributes::new(NvType::Counter, PIN_INDEX_ATTRIBUTES);
    if public.attributes.without(NvAttributes::WRITTEN) != expected {
        return invalid("unexpected attributes");
    }
    if !public.attributes.contains(NvAttributes::WRITTEN) {
        return invalid("not initialized");
    }
    if public.data_size != PIN_INDEX_SIZE {
        return invalid("unexpected size");
    }
    if auth_policies.len() < 2 {
        return invalid("too few authorization policies");
    }
    if public.auth_policy != policy_or_digest(public.name_alg, auth_policies) {
        return invalid("authorization policy does not match its branches");
    }
    Ok(())
}

/// Computes the static policy.
///
/// The session is asserted in this order:
/// 1. PolicyAuthorize with the authorization key, which accepts any
///    dynamic policy that key has signed.
/// 2. PolicySecret with the PIN index, so its name, and through it its
///    authorization policies, are bound.
/// 3. PolicyNV on the lock index, requiring it to still read open.
///
/// PolicyAuthorize resets the session digest, so it has to come first.
pub fn compute_static_policy(
    alg: HashAlgorithm,
    params: &StaticPolicyParams,
) -> Result<(StaticPolicyData, Digest)> {
    let auth_key = params.auth_key.clone().ok_or(Error::MissingAuthKey)?;
    validate_pin_index_public(&params.pin_index, &params.pin_index_auth_policies)?;

    let data = StaticPolicyData {
        auth_public: auth_key,
        pin_index: params.pin_index.clone(),
        pin_index_auth_policies: params.pin_index_auth_policies.clone(),
        lock_index: params.lock_index,
        lock_index_name: params.lock_index_name.clone(),
    };
    let digest = data.policy_digest(alg);
    debug!("static policy digest {}", hex::encode(&digest));
    Ok((data, digest))
}

impl StaticPolicyData {
    /// The digest a fully satisfied session ends with.
    pub fn policy_digest(&self, alg: HashAlgorithm) -> Digest {
        let mut trial = PolicyComputer::new(alg);
        trial
            .policy_authorize(&self.auth_public.name(), &[])
            .policy_secret(&self.pin_index.name(), &[])
            .policy_nv(&self.lock_index_name, &LOCK_OPEN, 0, NvOperation::Eq);
        trial.into_digest()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pin::pin_index_auth_policies;
    use crate::policy::auth_key::tests::test_key;
    use eyre::Result;

    pub(crate) fn pin_index_public(policies: &[Digest]) -> NvPublic {
        NvPublic {
            index: 0x0188_0000,
            name_alg: HashAlgorithm::Sha256,
            attributes: NvAttributes::new(NvType::Counter, PIN_INDEX_ATTRIBUTES)
                .with(NvAttributes::WRITTEN),
            auth_policy: policy_or_digest(HashAlgorithm::Sha256, policies),
            data_size: PIN_INDEX_SIZE,
        }
    }

    fn params() -> StaticPolicyParams {
        let policies = pin_index_auth_policies(HashAlgorithm::Sha256);
        StaticPolicyParams {
            auth_key: Some(test_key().public()),
            pin_index: pin_index_public(&policies),
            pin_index_auth_policies: policies,
            lock_index: 0x0180_1100,
            lock_index_name: vec![0x00, 0x0b, 1, 2, 3],
        }
    }

    #[test]
    fn requires_auth_key() {
        let params = StaticPolicyParams {
            auth_key: None,
            ..params()
        };
        assert!(matches!(
            compute_static_policy(HashAlgorithm::Sha256, &params),
            Err(Error::MissingAuthKey)
        ));
    }

    #[test]
    fn rejects_pin_index_with_foreign_policy() {
        let mut params = params();
        params.pin_index.auth_policy = HashAlgorithm::Sha256.zero();
        assert!(matches!(
            compute_static_policy(HashAlgorithm::Sha256, &params),
            Err(Error::InvalidIndexPublic(_))
        ));
    }

    #[test]
    fn rejects_uninitialized_pin_index() {
        let mut params = params();
        params.pin_index.attributes = params.pin_index.attributes.without(NvAttributes::WRITTEN);
        assert!(matches!(
            compute_static_policy(HashAlgorithm::Sha256, &params),
            Err(Error::InvalidIndexPublic(_))
        ));
    }

    #[test]
    fn digest_binds_lock_index_name() -> Result<()> {
        let params = params();
        let (data, digest) = compute_static_policy(HashAlgorithm::Sha256, &params)?;
        assert_eq!(data.policy_digest(HashAlgorithm::Sha256), digest);

        let recreated = StaticPolicyParams {
            lock_index_name: vec![0x00, 0x0b, 9, 9, 9],
            ..params
        };
        let (_, other) = compute_static_policy(HashAlgorithm::Sha256, &recreated)?;
        assert_ne!(digest, other);
        Ok(())
    }
}
