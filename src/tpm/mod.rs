//! The hardware seam.
//!
//! Everything the policy engine needs from a TPM is expressed by four
//! traits, grouped the way the commands are grouped in the TPM library
//! specification. [`soft::SoftTpm`] implements them in memory. The `tss`
//! feature adds `tss-esapi` backed [`PcrBanks`] for reading a live system.
//!
//! All calls block until the device answers. Implementations own the
//! transport and its timeouts; nothing here retries.

use ambassador::delegatable_trait;
use thiserror::Error;

use crate::digest::{Digest, HashAlgorithm};
use crate::marshal::MarshalError;
use crate::policy::auth_key::{AuthKeyPublic, Signature};
use types::{CommandCode, NvOperation, NvPublic, PcrSelectionList, PcrValues};

pub mod pcr;
pub mod soft;
#[cfg(feature = "tss")]
pub mod tss;
pub mod types;

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("failed to create auth session")]
    AuthSessionCreate,
    #[error("no policy session with handle {0:#010x}")]
    SessionNotFound(u32),
    #[error("{0:?} assertion failed")]
    PolicyCheck(CommandCode),
    #[error("authorization failed for handle {0:#010x}")]
    AuthFail(u32),
    #[error("NV index {0:#010x} is not defined")]
    NvIndexNotFound(u32),
    #[error("NV index {0:#010x} is already defined")]
    NvIndexExists(u32),
    #[error("NV index {0:#010x} is locked")]
    NvLocked(u32),
    #[error("NV index {0:#010x} has not been written")]
    NvUninitialized(u32),
    #[error("NV access outside the data area of index {0:#010x}")]
    NvRange(u32),
    #[error("operation not permitted by the attributes of NV index {0:#010x}")]
    NvAttributes(u32),
    #[error("signature does not verify")]
    SignatureCheck,
    #[error("ticket does not match the authorization")]
    InvalidTicket,
    #[error("empty PCR selection list, expected at least one selection")]
    EmptyPcrSelectionList,
    #[error("PCR {0} does not exist")]
    InvalidPcr(u32),
    #[error("sealed object failed its integrity check")]
    ObjectIntegrity,
    #[error("{0} is not supported by this TPM backend")]
    Unsupported(&'static str),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    #[cfg(feature = "tss")]
    #[error(transparent)]
    TssEsapi(#[from] tss_esapi::Error),
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

pub type SessionHandle = u32;

/// How an NV command is authorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NvAuth {
    /// Owner hierarchy authorization (empty owner password)
    Owner,
    /// The index's own auth value
    Index(Vec<u8>),
    /// A policy session satisfying the index's auth policy
    Policy(SessionHandle),
}

/// TPMT_TK_VERIFIED, opaque to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedTicket {
    pub digest: Digest,
}

/// A sealed data object as returned by TPM2_Create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedObject {
    pub public: Vec<u8>,
    pub private: Vec<u8>,
}

#[delegatable_trait]
pub trait PcrBanks {
    fn pcr_read(&mut self, selection: &PcrSelectionList) -> Result<PcrValues>;
    fn pcr_extend(&mut self, alg: HashAlgorithm, index: u32, digest: &[u8]) -> Result<()>;
}

#[delegatable_trait]
pub trait NvStorage {
    fn nv_define_space(&mut self, public: &NvPublic, auth_value: &[u8]) -> Result<()>;
    fn nv_undefine_space(&mut self, index: u32) -> Result<()>;
    fn nv_read_public(&mut self, index: u32) -> Result<NvPublic>;
    fn nv_read(&mut self, index: u32, auth: &NvAuth, size: u16, offset: u16) -> Result<Vec<u8>>;
    fn nv_write(&mut self, index: u32, auth: &NvAuth, data: &[u8], offset: u16) -> Result<()>;
    fn nv_increment(&mut self, index: u32, auth: &NvAuth) -> Result<()>;
    fn nv_write_lock(&mut self, index: u32, auth: &NvAuth) -> Result<()>;
    /// TPM2_NV_ChangeAuth. Needs a policy session in the ADMIN role.
    fn nv_change_auth(
        &mut self,
        index: u32,
        session: SessionHandle,
        old_auth: &[u8],
        new_auth: &[u8],
    ) -> Result<()>;
}

#[delegatable_trait]
pub trait PolicySessions {
    fn start_policy_session(&mut self, alg: HashAlgorithm) -> Result<SessionHandle>;
    fn policy_pcr(
        &mut self,
        session: SessionHandle,
        pcr_digest: &[u8],
        selection: &PcrSelectionList,
    ) -> Result<()>;
    fn policy_or(&mut self, session: SessionHandle, digests: &[Digest]) -> Result<()>;
    fn policy_nv(
        &mut self,
        session: SessionHandle,
        index: u32,
        auth: &NvAuth,
        operand_b: &[u8],
        offset: u16,
        operation: NvOperation,
    ) -> Result<()>;
    fn policy_secret(
        &mut self,
        session: SessionHandle,
        auth_handle: u32,
        auth_value: &[u8],
        policy_ref: &[u8],
    ) -> Result<()>;
    fn policy_auth_value(&mut self, session: SessionHandle) -> Result<()>;
    fn policy_command_code(&mut self, session: SessionHandle, code: CommandCode) -> Result<()>;
    fn verify_signature(
        &mut self,
        key: &AuthKeyPublic,
        digest: &[u8],
        signature: &Signature,
    ) -> Result<VerifiedTicket>;
    fn policy_authorize(
        &mut self,
        session: SessionHandle,
        approved_policy: &[u8],
        policy_ref: &[u8],
        key_name: &[u8],
        ticket: &VerifiedTicket,
    ) -> Result<()>;
    fn policy_get_digest(&mut self, session: SessionHandle) -> Result<Digest>;
    fn flush_session(&mut self, session: SessionHandle) -> Result<()>;
}

#[delegatable_trait]
pub trait TpmObjects {
    fn get_random(&mut self, num_bytes: usize) -> Result<Vec<u8>>;
    /// Creates a sealed data object whose auth policy is `auth_policy` (SHA-256 name algorithm).
    fn create_sealed(&mut self, auth_policy: &[u8], data: &[u8]) -> Result<SealedObject>;
    /// TPM2_Unseal authorized by a satisfied policy session.
    fn unseal(&mut self, object: &SealedObject, session: SessionHandle) -> Result<Vec<u8>>;
}

/// A complete TPM as far as this crate is concerned.
pub trait Tpm: PcrBanks + NvStorage + PolicySessions + TpmObjects {}

impl<T: PcrBanks + NvStorage + PolicySessions + TpmObjects + ?Sized> Tpm for T {}

#[cfg(test)]
pub(crate) mod faults {
    use super::*;
    use ambassador::Delegate;

    /// Wraps a TPM whose PCR reads fail as if the device disappeared.
    #[derive(Delegate)]
    #[delegate(NvStorage, target = "inner", where = "T: NvStorage")]
    #[delegate(PolicySessions, target = "inner", where = "T: PolicySessions")]
    #[delegate(TpmObjects, target = "inner", where = "T: TpmObjects")]
    pub struct FailingPcrReads<T> {
        pub inner: T,
    }

    impl<T: PcrBanks> PcrBanks for FailingPcrReads<T> {
        fn pcr_read(&mut self, _selection: &PcrSelectionList) -> Result<PcrValues> {
            Err(TpmError::Transport("device went away".to_string()))
        }

        fn pcr_extend(&mut self, alg: HashAlgorithm, index: u32, digest: &[u8]) -> Result<()> {
            self.inner.pcr_extend(alg, index, digest)
        }
    }
}
