use thiserror::Error;

use crate::marshal::MarshalError;
use crate::profile::ProfileError;
use crate::tpm::TpmError;

/// How a caller should react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A caller mistake; retrying with the same inputs fails the same way.
    Configuration,
    /// Access denied by the policy. Expected after a boot state change or a
    /// revocation; retrying against the same state cannot succeed.
    PolicyMismatch,
    /// The device or its transport failed; a fresh session may succeed.
    Hardware,
    /// Lockout. Only a TPM clear recovers from this.
    Fatal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error("no authorization key supplied")]
    MissingAuthKey,
    #[error("invalid NV index public area: {0}")]
    InvalidIndexPublic(String),
    #[error("PCR profile resolved to no branches")]
    EmptyResolvedSet,
    #[error("invalid PCR values: {0}")]
    InvalidPcrValues(String),
    #[error("failed to sign the authorized policy: {0}")]
    SigningFailure(#[source] rsa::Error),
    #[error("current PCR values match none of the authorized branches")]
    NoMatchingBranch,
    #[error("policy was authorized for epoch {policy_epoch} but the revocation counter is at {current}")]
    RevokedPolicy { policy_epoch: u64, current: u64 },
    #[error("authorization signature is invalid")]
    InvalidSignature,
    #[error("incorrect PIN")]
    InvalidPin,
    #[error("session digest does not match the sealed object's policy")]
    PolicyDigestMismatch,
    #[error("TPM error: {0}")]
    Hardware(#[source] TpmError),
    #[error("TPM transport error: {0}")]
    Transport(String),
    #[error("lockout engaged, the TPM must be cleared before secrets can be released")]
    LockoutEngaged,
    #[error("invalid policy record: {0}")]
    InvalidRecord(#[from] MarshalError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Profile(_)
            | Error::MissingAuthKey
            | Error::InvalidIndexPublic(_)
            | Error::EmptyResolvedSet
            | Error::InvalidPcrValues(_)
            | Error::SigningFailure(_)
            | Error::InvalidRecord(_) => ErrorKind::Configuration,
            Error::NoMatchingBranch
            | Error::RevokedPolicy { .. }
            | Error::InvalidSignature
            | Error::InvalidPin
            | Error::PolicyDigestMismatch => ErrorKind::PolicyMismatch,
            Error::Hardware(_) | Error::Transport(_) => ErrorKind::Hardware,
            Error::LockoutEngaged => ErrorKind::Fatal,
        }
    }
}

impl From<TpmError> for Error {
    fn from(e: TpmError) -> Self {
        match e {
            TpmError::Transport(msg) => Error::Transport(msg),
            e => Error::Hardware(e),
        }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockout_is_reported_apart_from_mismatches() {
        assert_eq!(Error::LockoutEngaged.kind(), ErrorKind::Fatal);
        assert_eq!(Error::NoMatchingBranch.kind(), ErrorKind::PolicyMismatch);
        assert_eq!(
            Error::from(TpmError::Transport("eof".into())).kind(),
            ErrorKind::Hardware
        );
        assert!(matches!(
            Error::from(TpmError::NvIndexNotFound(1)),
            Error::Hardware(TpmError::NvIndexNotFound(1))
        ));
    }
}
