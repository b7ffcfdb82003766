//! Sealing secrets to a boot state and releasing them again.
//!
//! A platform is [`provision`]ed once: that creates the lock index, the
//! revocation counter and the PIN index. Secrets are then sealed under the
//! static policy digest from [`seal_policy`]. The dynamic half can be
//! recomputed and re-signed at any time without touching the sealed object;
//! incrementing the counter before doing so revokes the old one.

use log::{info, warn};
use tracing::info_span;

use crate::digest::{Digest, HashAlgorithm};
use crate::error::{Error, Result};
use crate::pin::{create_pin_index, PIN_INDEX_HANDLE};
use crate::policy::auth_key::{AuthKey, AuthKeyPublic};
use crate::policy::static_policy::validate_pin_index_public;
use crate::policy::{
    compute_dynamic_policy, compute_static_policy, DynamicPolicyData, DynamicPolicyParams,
    StaticPolicyData, StaticPolicyParams,
};
use crate::revocation::{
    check_lock, create_counter_index, ensure_lock_index, increment_counter,
    read_and_validate_counter_index_public, read_and_validate_lock_index_public, read_counter,
    validate_counter_index_public, COUNTER_INDEX_HANDLE, LOCK_INDEX_HANDLE,
};
use crate::session::{AuthorizedSession, PolicySession};
use crate::tpm::types::{NvPublic, PcrValues};
use crate::tpm::{NvStorage, SealedObject, Tpm, TpmError, TpmObjects};

/// Where the NV indices live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IndexHandles {
    pub lock: u32,
    pub counter: u32,
    pub pin: u32,
}

impl Default for IndexHandles {
    fn default() -> Self {
        Self {
            lock: LOCK_INDEX_HANDLE,
            counter: COUNTER_INDEX_HANDLE,
            pin: PIN_INDEX_HANDLE,
        }
    }
}

/// The NV state sealing depends on, as left by [`provision`].
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub lock_index: NvPublic,
    pub counter_index: NvPublic,
    /// Revocation counter value after provisioning
    pub epoch: u64,
    pub pin_index: NvPublic,
    pub pin_index_auth_policies: Vec<Digest>,
}

impl Provisioned {
    pub fn static_params(&self, auth_key: AuthKeyPublic) -> StaticPolicyParams {
        StaticPolicyParams {
            auth_key: Some(auth_key),
            pin_index: self.pin_index.clone(),
            pin_index_auth_policies: self.pin_index_auth_policies.clone(),
            lock_index: self.lock_index.index,
            lock_index_name: self.lock_index.name(),
        }
    }

    pub fn dynamic_params<'a>(
        &self,
        auth_key: &'a AuthKey,
        pcr_values: Vec<PcrValues>,
    ) -> DynamicPolicyParams<'a> {
        DynamicPolicyParams {
            auth_key,
            pcr_values,
            counter_index: self.counter_index.index,
            counter_name: self.counter_index.name(),
            epoch: self.epoch,
        }
    }
}

/// Prepares the NV indices.
///
/// Running this again advances the revocation counter, so every dynamic
/// policy signed before is revoked, and recreates the PIN index with
/// `pin`. The lock index is kept unless it is not one of ours; a locked one
/// fails with [`Error::LockoutEngaged`].
pub fn provision<T: Tpm + ?Sized>(
    tpm: &mut T,
    handles: &IndexHandles,
    pin: &[u8],
) -> Result<Provisioned> {
    let span = info_span!("provision", lock = handles.lock, counter = handles.counter);
    let _enter = span.enter();

    let lock_index = ensure_lock_index(tpm, handles.lock)?;

    let counter_index = match tpm.nv_read_public(handles.counter) {
        Ok(public) if validate_counter_index_public(&public).is_ok() => {
            increment_counter(tpm, handles.counter)?;
            public
        }
        Ok(public) => {
            warn!(
                "replacing NV index {:#010x}, it is not a revocation counter",
                public.index
            );
            tpm.nv_undefine_space(handles.counter)?;
            create_counter_index(tpm, handles.counter)?
        }
        Err(TpmError::NvIndexNotFound(_)) => create_counter_index(tpm, handles.counter)?,
        Err(e) => return Err(e.into()),
    };
    let epoch = read_counter(tpm, handles.counter)?;

    match tpm.nv_undefine_space(handles.pin) {
        Ok(()) | Err(TpmError::NvIndexNotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    let (pin_index, pin_index_auth_policies) = create_pin_index(tpm, handles.pin, pin)?;

    info!("provisioned TPM, revocation epoch {epoch}");
    Ok(Provisioned {
        lock_index,
        counter_index,
        epoch,
        pin_index,
        pin_index_auth_policies,
    })
}

/// Computes both halves of a policy. The returned digest is the one to
/// create the sealed object with.
pub fn seal_policy(
    alg: HashAlgorithm,
    static_params: &StaticPolicyParams,
    dynamic_params: &DynamicPolicyParams<'_>,
) -> Result<(Digest, StaticPolicyData, DynamicPolicyData)> {
    let span = info_span!("seal_policy", %alg, epoch = dynamic_params.epoch);
    let _enter = span.enter();

    let (static_data, digest) = compute_static_policy(alg, static_params)?;
    let dynamic = compute_dynamic_policy(alg, dynamic_params)?;
    // signed by a different key than the static policy names
    if !dynamic.verify(&static_data.auth_public) {
        return Err(Error::InvalidSignature);
    }
    info!("computed policy {}", hex::encode(&digest));
    Ok((digest, static_data, dynamic))
}

/// Re-signs the dynamic policy for a new set of PCR states, leaving the
/// sealed object and static policy as they are.
pub fn update_dynamic_policy(
    alg: HashAlgorithm,
    static_data: &StaticPolicyData,
    params: &DynamicPolicyParams<'_>,
) -> Result<DynamicPolicyData> {
    let dynamic = compute_dynamic_policy(alg, params)?;
    if !dynamic.verify(&static_data.auth_public) {
        return Err(Error::InvalidSignature);
    }
    Ok(dynamic)
}

pub fn seal_secret<T: TpmObjects + ?Sized>(
    tpm: &mut T,
    policy_digest: &[u8],
    secret: &[u8],
) -> Result<SealedObject> {
    let object = tpm.create_sealed(policy_digest, secret)?;
    info!("sealed {} bytes", secret.len());
    Ok(object)
}

/// Checks the NV indices are the ones the policies were computed against.
fn check_indices<T: NvStorage + ?Sized>(
    tpm: &mut T,
    static_data: &StaticPolicyData,
    dynamic: &DynamicPolicyData,
) -> Result<()> {
    let lock = read_and_validate_lock_index_public(tpm, static_data.lock_index)?;
    if lock.name() != static_data.lock_index_name {
        return Err(Error::InvalidIndexPublic(format!(
            "lock index {:#010x} was recreated",
            static_data.lock_index
        )));
    }

    let counter = read_and_validate_counter_index_public(tpm, dynamic.counter_index)?;
    if counter.name() != dynamic.counter_name {
        return Err(Error::InvalidIndexPublic(format!(
            "revocation counter {:#010x} was recreated",
            dynamic.counter_index
        )));
    }

    let pin_handle = static_data.pin_index.index;
    let pin = tpm.nv_read_public(pin_handle).map_err(|e| match e {
        TpmError::NvIndexNotFound(_) => {
            Error::InvalidIndexPublic(format!("PIN index {pin_handle:#010x} is not defined"))
        }
        e => e.into(),
    })?;
    validate_pin_index_public(&pin, &static_data.pin_index_auth_policies)?;
    if pin.name() != static_data.pin_index.name() {
        return Err(Error::InvalidIndexPublic(format!(
            "PIN index {pin_handle:#010x} was recreated"
        )));
    }
    Ok(())
}

/// Satisfies the policy of a sealed object in a fresh session.
///
/// Nothing is asked of the TPM session until the lock, the NV indices and
/// the signature have been checked, so a refused unseal leaves no trace
/// beyond reads.
pub fn unseal<'a, T: Tpm + ?Sized>(
    tpm: &'a mut T,
    static_data: &StaticPolicyData,
    dynamic: &DynamicPolicyData,
    pin: &[u8],
) -> Result<AuthorizedSession<'a, T>> {
    let span = info_span!("unseal", epoch = dynamic.epoch);
    let _enter = span.enter();

    if check_lock(tpm, static_data.lock_index)? {
        warn!("refusing to unseal, lockout engaged");
        return Err(Error::LockoutEngaged);
    }
    check_indices(tpm, static_data, dynamic)?;
    if !dynamic.verify(&static_data.auth_public) {
        return Err(Error::InvalidSignature);
    }

    let session = PolicySession::start(tpm, dynamic.alg)?
        .assert_pcrs(dynamic)?
        .resolve_or(dynamic)?
        .assert_counter(dynamic)?
        .authorize(static_data, dynamic)?
        .complete(static_data, pin)?;
    info!("policy satisfied");
    Ok(session)
}
