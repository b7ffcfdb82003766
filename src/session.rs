//! Replaying a sealed object's policy against a live TPM.
//!
//! A [`PolicySession`] moves through its states by consuming itself; each
//! transition either returns the session in its next state or an
//! [`Error`], in which case the session is dropped. Dropping a session in
//! any state flushes it from the TPM. A failed session cannot be resumed,
//! start a new one.
//!
//! The assertions are issued in the order the policy digests were computed
//! in:
//!
//! ```text
//! Started -> PcrAsserted -> OrResolved -> CounterAsserted
//!         -> SignatureVerified -> Satisfied
//! ```
//!
//! PolicyOR only accepts a session whose digest is one of its inputs, so the
//! OR resolution has to follow the PCR assertion directly.

use std::fmt;
use std::ops::{Deref, DerefMut};

use log::{debug, warn};

use crate::digest::{Digest, HashAlgorithm};
use crate::error::{Error, Result};
use crate::policy::dynamic_policy::pcr_branch_digest;
use crate::policy::static_policy::LOCK_OPEN;
use crate::policy::{DynamicPolicyData, OrTree, StaticPolicyData};
use crate::revocation::read_counter;
use crate::tpm::types::NvOperation;
use crate::tpm::{NvAuth, PolicySessions, SealedObject, SessionHandle, Tpm, TpmError};

/// A policy session that is flushed when dropped.
pub struct SessionGuard<'a, T: PolicySessions + ?Sized> {
    tpm: &'a mut T,
    handle: SessionHandle,
}

impl<'a, T: PolicySessions + ?Sized> SessionGuard<'a, T> {
    pub fn start(tpm: &'a mut T, alg: HashAlgorithm) -> Result<Self, TpmError> {
        let handle = tpm.start_policy_session(alg)?;
        debug!("started policy session {handle:#010x}");
        Ok(Self { tpm, handle })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }
}

impl<T: PolicySessions + ?Sized> Deref for SessionGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.tpm
    }
}

impl<T: PolicySessions + ?Sized> DerefMut for SessionGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.tpm
    }
}

impl<T: PolicySessions + ?Sized> Drop for SessionGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.tpm.flush_session(self.handle) {
            debug!("failed to flush policy session {:#010x}: {e}", self.handle);
        }
    }
}

/// Where a session is, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Started,
    PcrAsserted,
    OrResolved,
    CounterAsserted,
    SignatureVerified,
    Satisfied,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub trait SessionState {
    const STAGE: Stage;
}

pub struct Started;
pub struct PcrAsserted {
    branch_digest: Digest,
}
pub struct OrResolved;
pub struct CounterAsserted;
pub struct SignatureVerified;
pub struct Satisfied;

impl SessionState for Started {
    const STAGE: Stage = Stage::Started;
}
impl SessionState for PcrAsserted {
    const STAGE: Stage = Stage::PcrAsserted;
}
impl SessionState for OrResolved {
    const STAGE: Stage = Stage::OrResolved;
}
impl SessionState for CounterAsserted {
    const STAGE: Stage = Stage::CounterAsserted;
}
impl SessionState for SignatureVerified {
    const STAGE: Stage = Stage::SignatureVerified;
}
impl SessionState for Satisfied {
    const STAGE: Stage = Stage::Satisfied;
}

pub struct PolicySession<'a, T: Tpm + ?Sized, S: SessionState> {
    guard: SessionGuard<'a, T>,
    alg: HashAlgorithm,
    state: S,
}

/// A session that satisfies a sealed object's policy.
pub type AuthorizedSession<'a, T> = PolicySession<'a, T, Satisfied>;

impl<'a, T: Tpm + ?Sized, S: SessionState> PolicySession<'a, T, S> {
    pub fn stage(&self) -> Stage {
        S::STAGE
    }

    pub fn handle(&self) -> SessionHandle {
        self.guard.handle()
    }

    fn advance<N: SessionState>(self, state: N) -> PolicySession<'a, T, N> {
        debug!(
            "policy session {:#010x}: {} -> {}",
            self.guard.handle(),
            S::STAGE,
            N::STAGE
        );
        PolicySession {
            guard: self.guard,
            alg: self.alg,
            state,
        }
    }

    fn fail(&self, e: Error) -> Error {
        warn!(
            "policy session {:#010x} {} after {}: {e}",
            self.guard.handle(),
            Stage::Failed,
            S::STAGE
        );
        e
    }
}

impl<'a, T: Tpm + ?Sized> PolicySession<'a, T, Started> {
    pub fn start(tpm: &'a mut T, alg: HashAlgorithm) -> Result<Self> {
        Ok(Self {
            guard: SessionGuard::start(tpm, alg)?,
            alg,
            state: Started,
        })
    }

    /// Reads the selected PCRs and asserts their current values.
    pub fn assert_pcrs(
        mut self,
        dynamic: &DynamicPolicyData,
    ) -> Result<PolicySession<'a, T, PcrAsserted>> {
        let selection = &dynamic.pcr_selection;
        // any failure to read is a hardware failure, transport included
        let values = match self.guard.pcr_read(selection) {
            Ok(values) => values,
            Err(e) => return Err(self.fail(Error::Hardware(e))),
        };
        let Some(ordered) = selection.ordered_values(&values) else {
            return Err(self.fail(Error::InvalidPcrValues(
                "TPM did not return every selected PCR".to_string(),
            )));
        };
        let composite = crate::digest::pcr_composite_digest(self.alg, ordered);
        let handle = self.handle();
        if let Err(e) = self.guard.policy_pcr(handle, &composite, selection) {
            return Err(self.fail(e.into()));
        }
        let branch_digest = match pcr_branch_digest(self.alg, selection, &values) {
            Ok(digest) => digest,
            Err(e) => return Err(self.fail(e)),
        };
        Ok(self.advance(PcrAsserted { branch_digest }))
    }
}

impl<'a, T: Tpm + ?Sized> PolicySession<'a, T, PcrAsserted> {
    /// Finds the authorized branch matching the asserted PCRs and walks the
    /// OR tree from it.
    pub fn resolve_or(
        mut self,
        dynamic: &DynamicPolicyData,
    ) -> Result<PolicySession<'a, T, OrResolved>> {
        let Some(position) = dynamic
            .branch_digests
            .iter()
            .position(|digest| *digest == self.state.branch_digest)
        else {
            return Err(self.fail(Error::NoMatchingBranch));
        };
        let Some(tree) = OrTree::build(self.alg, &dynamic.branch_digests) else {
            return Err(self.fail(Error::EmptyResolvedSet));
        };
        let handle = self.handle();
        for group in tree.path(position).unwrap_or_default() {
            if let Err(e) = self.guard.policy_or(handle, group) {
                return Err(self.fail(e.into()));
            }
        }
        debug!("matched authorized branch {position}");
        Ok(self.advance(OrResolved))
    }
}

impl<'a, T: Tpm + ?Sized> PolicySession<'a, T, OrResolved> {
    /// Requires the revocation counter not to have passed the policy's epoch.
    pub fn assert_counter(
        mut self,
        dynamic: &DynamicPolicyData,
    ) -> Result<PolicySession<'a, T, CounterAsserted>> {
        let handle = self.handle();
        let result = self.guard.policy_nv(
            handle,
            dynamic.counter_index,
            &NvAuth::Index(vec![]),
            &dynamic.epoch.to_be_bytes(),
            0,
            NvOperation::UnsignedLe,
        );
        match result {
            Ok(()) => Ok(self.advance(CounterAsserted)),
            Err(TpmError::PolicyCheck(_)) => {
                let e = match read_counter(&mut *self.guard, dynamic.counter_index) {
                    Ok(current) => Error::RevokedPolicy {
                        policy_epoch: dynamic.epoch,
                        current,
                    },
                    Err(e) => e,
                };
                Err(self.fail(e))
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }
}

impl<'a, T: Tpm + ?Sized> PolicySession<'a, T, CounterAsserted> {
    /// Has the TPM verify the signature over the dynamic policy and swaps
    /// the session digest for the authorization key's PolicyAuthorize.
    pub fn authorize(
        mut self,
        static_data: &StaticPolicyData,
        dynamic: &DynamicPolicyData,
    ) -> Result<PolicySession<'a, T, SignatureVerified>> {
        let key = &static_data.auth_public;
        let ticket =
            match self
                .guard
                .verify_signature(key, &dynamic.signing_digest(key), &dynamic.signature)
            {
                Ok(ticket) => ticket,
                Err(TpmError::SignatureCheck) => return Err(self.fail(Error::InvalidSignature)),
                Err(e) => return Err(self.fail(e.into())),
            };
        let handle = self.handle();
        match self.guard.policy_authorize(
            handle,
            &dynamic.authorized_policy,
            &[],
            &key.name(),
            &ticket,
        ) {
            Ok(()) => Ok(self.advance(SignatureVerified)),
            Err(TpmError::PolicyCheck(_)) | Err(TpmError::InvalidTicket) => {
                Err(self.fail(Error::PolicyDigestMismatch))
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }
}

impl<'a, T: Tpm + ?Sized> PolicySession<'a, T, SignatureVerified> {
    /// Completes the static part of the policy: the PIN, then the lock.
    pub fn complete(
        mut self,
        static_data: &StaticPolicyData,
        pin: &[u8],
    ) -> Result<AuthorizedSession<'a, T>> {
        let handle = self.handle();
        match self
            .guard
            .policy_secret(handle, static_data.pin_index.index, pin, &[])
        {
            Ok(()) => {}
            Err(TpmError::AuthFail(_)) => return Err(self.fail(Error::InvalidPin)),
            Err(e) => return Err(self.fail(e.into())),
        }
        match self.guard.policy_nv(
            handle,
            static_data.lock_index,
            &NvAuth::Index(vec![]),
            &LOCK_OPEN,
            0,
            NvOperation::Eq,
        ) {
            Ok(()) => {}
            Err(TpmError::PolicyCheck(_)) => return Err(self.fail(Error::LockoutEngaged)),
            Err(e) => return Err(self.fail(e.into())),
        }
        let digest = match self.guard.policy_get_digest(handle) {
            Ok(digest) => digest,
            Err(e) => return Err(self.fail(e.into())),
        };
        if digest != static_data.policy_digest(self.alg) {
            return Err(self.fail(Error::PolicyDigestMismatch));
        }
        Ok(self.advance(Satisfied))
    }
}

impl<'a, T: Tpm + ?Sized> AuthorizedSession<'a, T> {
    /// Releases the secret in `object`. The session stays usable until
    /// dropped.
    pub fn unseal(&mut self, object: &SealedObject) -> Result<Vec<u8>> {
        let handle = self.handle();
        Ok(self.guard.unseal(object, handle)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seal::tests::sealed_fixture;
    use crate::tpm::faults::FailingPcrReads;
    use eyre::Result;

    #[test]
    fn pcr_read_failure_is_hardware_error() -> Result<()> {
        let (tpm, fixture) = sealed_fixture()?;
        let mut tpm = FailingPcrReads { inner: tpm };
        let result = PolicySession::start(&mut tpm, HashAlgorithm::Sha256)?
            .assert_pcrs(&fixture.dynamic);
        assert!(matches!(result, Err(Error::Hardware(TpmError::Transport(_)))));
        drop(result);
        assert_eq!(tpm.inner.active_sessions(), 0);
        Ok(())
    }

    #[test]
    fn abandoning_a_session_flushes_it() -> Result<()> {
        let (mut tpm, fixture) = sealed_fixture()?;
        {
            let session = PolicySession::start(&mut tpm, HashAlgorithm::Sha256)?
                .assert_pcrs(&fixture.dynamic)?;
            assert_eq!(session.stage(), Stage::PcrAsserted);
        }
        assert_eq!(tpm.active_sessions(), 0);
        Ok(())
    }

    #[test]
    fn stages_advance_in_order() -> Result<()> {
        let (mut tpm, fixture) = sealed_fixture()?;
        let session = PolicySession::start(&mut tpm, HashAlgorithm::Sha256)?;
        assert_eq!(session.stage(), Stage::Started);
        let session = session.assert_pcrs(&fixture.dynamic)?;
        let session = session.resolve_or(&fixture.dynamic)?;
        assert_eq!(session.stage(), Stage::OrResolved);
        let session = session.assert_counter(&fixture.dynamic)?;
        let session = session.authorize(&fixture.static_data, &fixture.dynamic)?;
        let mut session = session.complete(&fixture.static_data, fixture.pin)?;
        assert_eq!(session.stage(), Stage::Satisfied);
        assert_eq!(session.unseal(&fixture.object)?, fixture.secret);
        Ok(())
    }

    #[test]
    fn wrong_pin_is_rejected() -> Result<()> {
        let (mut tpm, fixture) = sealed_fixture()?;
        let result = PolicySession::start(&mut tpm, HashAlgorithm::Sha256)?
            .assert_pcrs(&fixture.dynamic)?
            .resolve_or(&fixture.dynamic)?
            .assert_counter(&fixture.dynamic)?
            .authorize(&fixture.static_data, &fixture.dynamic)?
            .complete(&fixture.static_data, b"not the pin");
        assert!(matches!(result, Err(Error::InvalidPin)));
        Ok(())
    }
}
