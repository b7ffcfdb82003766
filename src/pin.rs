//! The PIN index.
//!
//! Unsealing runs PolicySecret against this index, so its auth value is
//! the PIN. The index is a counter nobody needs the value of; what matters
//! is its name, which the static policy binds, and its auth policy, which
//! only permits the commands below. Changing the PIN does not change the
//! name, so sealed objects stay valid.

use log::info;

use crate::digest::{policy_or_digest, Digest, HashAlgorithm};
use crate::error::{Error, Result};
use crate::policy::static_policy::{
    validate_pin_index_public, PIN_INDEX_ATTRIBUTES, PIN_INDEX_SIZE,
};
use crate::policy::PolicyComputer;
use crate::revocation::NV_INDEX_NAME_ALG;
use crate::session::SessionGuard;
use crate::tpm::types::{CommandCode, NvAttributes, NvPublic, NvType};
use crate::tpm::{NvAuth, NvStorage, PolicySessions, TpmError};

pub const PIN_INDEX_HANDLE: u32 = 0x0188_0000;

/// Branches of the PIN index auth policy, in PolicyOR order:
/// change the auth value (knowing the current one), increment, read.
pub fn pin_index_auth_policies(alg: HashAlgorithm) -> Vec<Digest> {
    let mut change_auth = PolicyComputer::new(alg);
    change_auth
        .policy_command_code(CommandCode::NvChangeAuth)
        .policy_auth_value();
    let mut increment = PolicyComputer::new(alg);
    increment.policy_command_code(CommandCode::NvIncrement);
    let mut read = PolicyComputer::new(alg);
    read.policy_command_code(CommandCode::NvRead);
    vec![
        change_auth.into_digest(),
        increment.into_digest(),
        read.into_digest(),
    ]
}

/// Defines the PIN index with `pin` as its auth value and initializes it.
pub fn create_pin_index<T: NvStorage + PolicySessions + ?Sized>(
    tpm: &mut T,
    handle: u32,
    pin: &[u8],
) -> Result<(NvPublic, Vec<Digest>)> {
    let alg = NV_INDEX_NAME_ALG;
    let policies = pin_index_auth_policies(alg);
    let public = NvPublic {
        index: handle,
        name_alg: alg,
        attributes: NvAttributes::new(NvType::Counter, PIN_INDEX_ATTRIBUTES),
        auth_policy: policy_or_digest(alg, &policies),
        data_size: PIN_INDEX_SIZE,
    };
    tpm.nv_define_space(&public, pin)?;

    // The first increment sets TPMA_NV_WRITTEN, which is part of the name
    {
        let mut session = SessionGuard::start(&mut *tpm, alg)?;
        let session_handle = session.handle();
        session.policy_command_code(session_handle, CommandCode::NvIncrement)?;
        session.policy_or(session_handle, &policies)?;
        session.nv_increment(handle, &NvAuth::Policy(session_handle))?;
    }

    let public = tpm.nv_read_public(handle)?;
    validate_pin_index_public(&public, &policies)?;
    info!("created PIN index {handle:#010x}");
    Ok((public, policies))
}

/// Replaces the PIN. Fails with [`Error::InvalidPin`] if `old_pin` is wrong.
pub fn change_pin<T: NvStorage + PolicySessions + ?Sized>(
    tpm: &mut T,
    public: &NvPublic,
    auth_policies: &[Digest],
    old_pin: &[u8],
    new_pin: &[u8],
) -> Result<()> {
    validate_pin_index_public(public, auth_policies)?;
    let mut session = SessionGuard::start(tpm, public.name_alg)?;
    let session_handle = session.handle();
    session.policy_command_code(session_handle, CommandCode::NvChangeAuth)?;
    session.policy_auth_value(session_handle)?;
    session.policy_or(session_handle, auth_policies)?;
    match session.nv_change_auth(public.index, session_handle, old_pin, new_pin) {
        Ok(()) => {
            info!("changed PIN of index {:#010x}", public.index);
            Ok(())
        }
        Err(TpmError::AuthFail(_)) => Err(Error::InvalidPin),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::soft::SoftTpm;
    use eyre::Result;

    #[test]
    fn pin_index_round_trip() -> Result<()> {
        let mut tpm = SoftTpm::with_seed(7);
        let (public, policies) = create_pin_index(&mut tpm, PIN_INDEX_HANDLE, b"1234")?;
        assert!(public.attributes.contains(NvAttributes::WRITTEN));

        change_pin(&mut tpm, &public, &policies, b"1234", b"5678")?;
        assert!(matches!(
            change_pin(&mut tpm, &public, &policies, b"1234", b"0000"),
            Err(Error::InvalidPin)
        ));
        assert_eq!(tpm.nv_read_public(PIN_INDEX_HANDLE)?.name(), public.name());
        Ok(())
    }

    #[test]
    fn sessions_are_flushed() -> Result<()> {
        let mut tpm = SoftTpm::with_seed(8);
        let (public, policies) = create_pin_index(&mut tpm, PIN_INDEX_HANDLE, b"")?;
        let _ = change_pin(&mut tpm, &public, &policies, b"wrong", b"x");
        assert_eq!(tpm.active_sessions(), 0);
        Ok(())
    }
}
