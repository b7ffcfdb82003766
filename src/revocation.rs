//! Revocation counter and lock index.
//!
//! Both live in TPM NV memory and are shared by every sealed object on the
//! platform. Nothing here serializes access; callers must not run two
//! mutations concurrently.
//!
//! The counter only ever moves forward. Dynamic policies assert that it has
//! not passed the epoch they were signed for, so incrementing it revokes
//! every policy signed before.
//!
//! The lock index reads `0` while secrets may be released. Locking writes a
//! non-zero value and sets a write lock that lasts until the index is
//! deleted, which in practice means a TPM clear.

use log::{info, warn};

use crate::digest::{policy_update, HashAlgorithm};
use crate::error::{Error, Result};
use crate::policy::static_policy::LOCK_OPEN;
use crate::tpm::types::{
    permanent_handle_name, CommandCode, NvAttributes, NvPublic, NvType, TPM_RH_OWNER,
};
use crate::tpm::{NvAuth, NvStorage, TpmError, TpmObjects};

pub const LOCK_INDEX_HANDLE: u32 = 0x0180_1100;
pub const COUNTER_INDEX_HANDLE: u32 = 0x0180_1101;

/// Name algorithm of every NV index this crate creates
pub const NV_INDEX_NAME_ALG: HashAlgorithm = HashAlgorithm::Sha256;

pub const LOCK_INDEX_ATTRIBUTES: u32 = NvAttributes::OWNERWRITE
    | NvAttributes::WRITEDEFINE
    | NvAttributes::AUTHREAD
    | NvAttributes::NO_DA;
pub const COUNTER_INDEX_ATTRIBUTES: u32 =
    NvAttributes::OWNERWRITE | NvAttributes::AUTHREAD | NvAttributes::NO_DA;

const LOCK_ENGAGED: [u8; 1] = [0x01];
const COUNTER_SIZE: u16 = 8;
const LOCK_NONCE_SIZE: usize = 32;

fn read_public<T: NvStorage + ?Sized>(tpm: &mut T, handle: u32) -> Result<NvPublic> {
    tpm.nv_read_public(handle).map_err(|e| match e {
        TpmError::NvIndexNotFound(handle) => {
            Error::InvalidIndexPublic(format!("index {handle:#010x} is not defined"))
        }
        e => e.into(),
    })
}

fn invalid(public: &NvPublic, what: &str) -> Error {
    Error::InvalidIndexPublic(format!("index {:#010x}: {what}", public.index))
}

pub fn validate_counter_index_public(public: &NvPublic) -> Result<()> {
    let expected = NvAttributes::new(NvType::Counter, COUNTER_INDEX_ATTRIBUTES);
    if public.attributes.without(NvAttributes::WRITTEN) != expected {
        return Err(invalid(public, "unexpected counter attributes"));
    }
    if !public.attributes.contains(NvAttributes::WRITTEN) {
        return Err(invalid(public, "counter was never incremented"));
    }
    if public.data_size != COUNTER_SIZE || !public.auth_policy.is_empty() {
        return Err(invalid(public, "unexpected counter size or policy"));
    }
    Ok(())
}

/// A locked lock index is still valid; this only checks it is one of ours.
pub fn validate_lock_index_public(public: &NvPublic) -> Result<()> {
    let expected = NvAttributes::new(NvType::Ordinary, LOCK_INDEX_ATTRIBUTES);
    let attributes = public
        .attributes
        .without(NvAttributes::WRITTEN | NvAttributes::WRITELOCKED);
    if attributes != expected {
        return Err(invalid(public, "unexpected lock index attributes"));
    }
    if !public.attributes.contains(NvAttributes::WRITTEN) {
        return Err(invalid(public, "lock index was never initialized"));
    }
    if public.data_size != 1 || public.auth_policy.len() != public.name_alg.size() {
        return Err(invalid(public, "unexpected lock index size or policy"));
    }
    Ok(())
}

pub fn read_and_validate_counter_index_public<T: NvStorage + ?Sized>(
    tpm: &mut T,
    handle: u32,
) -> Result<NvPublic> {
    let public = read_public(tpm, handle)?;
    validate_counter_index_public(&public)?;
    Ok(public)
}

pub fn read_and_validate_lock_index_public<T: NvStorage + ?Sized>(
    tpm: &mut T,
    handle: u32,
) -> Result<NvPublic> {
    let public = read_public(tpm, handle)?;
    validate_lock_index_public(&public)?;
    Ok(public)
}

/// Defines the revocation counter and moves it off its undefined state.
/// Returns the public area, whose name dynamic policies bind to.
pub fn create_counter_index<T: NvStorage + ?Sized>(tpm: &mut T, handle: u32) -> Result<NvPublic> {
    let public = NvPublic {
        index: handle,
        name_alg: NV_INDEX_NAME_ALG,
        attributes: NvAttributes::new(NvType::Counter, COUNTER_INDEX_ATTRIBUTES),
        auth_policy: vec![],
        data_size: COUNTER_SIZE,
    };
    tpm.nv_define_space(&public, &[])?;
    tpm.nv_increment(handle, &NvAuth::Owner)?;
    let public = read_and_validate_counter_index_public(tpm, handle)?;
    info!("created revocation counter {handle:#010x}");
    Ok(public)
}

pub fn read_counter<T: NvStorage + ?Sized>(tpm: &mut T, handle: u32) -> Result<u64> {
    let data = tpm.nv_read(handle, &NvAuth::Index(vec![]), COUNTER_SIZE, 0)?;
    let bytes: [u8; 8] = data
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidIndexPublic(format!("counter {handle:#010x} is not 8 bytes")))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Advances the counter, revoking every policy signed for an earlier
/// epoch. Returns the new value.
pub fn increment_counter<T: NvStorage + ?Sized>(tpm: &mut T, handle: u32) -> Result<u64> {
    tpm.nv_increment(handle, &NvAuth::Owner)?;
    let epoch = read_counter(tpm, handle)?;
    info!("revocation counter {handle:#010x} advanced to {epoch}");
    Ok(epoch)
}

/// Defines the lock index in its open state.
///
/// The auth policy includes a fresh nonce, so every incarnation of the
/// index has a different name and static policies only match the one they
/// were created against.
pub fn create_lock_index<T: NvStorage + TpmObjects + ?Sized>(
    tpm: &mut T,
    handle: u32,
) -> Result<NvPublic> {
    let nonce = tpm.get_random(LOCK_NONCE_SIZE)?;
    let alg = NV_INDEX_NAME_ALG;
    let public = NvPublic {
        index: handle,
        name_alg: alg,
        attributes: NvAttributes::new(NvType::Ordinary, LOCK_INDEX_ATTRIBUTES),
        auth_policy: policy_update(
            alg,
            &alg.zero(),
            CommandCode::PolicySecret,
            &permanent_handle_name(TPM_RH_OWNER),
            &nonce,
        ),
        data_size: 1,
    };
    tpm.nv_define_space(&public, &[])?;
    tpm.nv_write(handle, &NvAuth::Owner, &LOCK_OPEN, 0)?;
    let public = read_and_validate_lock_index_public(tpm, handle)?;
    info!("created lock index {handle:#010x}");
    Ok(public)
}

/// `true` once [`set_lock`] has run against this index.
pub fn check_lock<T: NvStorage + ?Sized>(tpm: &mut T, handle: u32) -> Result<bool> {
    let public = read_public(tpm, handle)?;
    if public.attributes.contains(NvAttributes::WRITELOCKED) {
        return Ok(true);
    }
    let data = tpm.nv_read(handle, &NvAuth::Index(vec![]), 1, 0)?;
    Ok(data != LOCK_OPEN)
}

/// Engages the lockout. Irreversible without deleting the index.
pub fn set_lock<T: NvStorage + ?Sized>(tpm: &mut T, handle: u32) -> Result<()> {
    match tpm.nv_write(handle, &NvAuth::Owner, &LOCK_ENGAGED, 0) {
        Ok(()) | Err(TpmError::NvLocked(_)) => {}
        Err(e) => return Err(e.into()),
    }
    match tpm.nv_write_lock(handle, &NvAuth::Owner) {
        Ok(()) | Err(TpmError::NvLocked(_)) => {}
        Err(e) => return Err(e.into()),
    }
    warn!("lock index {handle:#010x} engaged, sealed secrets are unavailable until TPM clear");
    Ok(())
}

/// Returns a valid, open lock index at `handle`, creating it if needed.
///
/// An existing index that is not one of ours is replaced. A locked one is
/// never replaced: that is [`Error::LockoutEngaged`].
pub fn ensure_lock_index<T: NvStorage + TpmObjects + ?Sized>(
    tpm: &mut T,
    handle: u32,
) -> Result<NvPublic> {
    match tpm.nv_read_public(handle) {
        Ok(public) => match validate_lock_index_public(&public) {
            Ok(()) => {
                if check_lock(tpm, handle)? {
                    return Err(Error::LockoutEngaged);
                }
                return Ok(public);
            }
            Err(e) => {
                warn!("replacing lock index {handle:#010x}: {e}");
                tpm.nv_undefine_space(handle)?;
            }
        },
        Err(TpmError::NvIndexNotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    create_lock_index(tpm, handle)
}
