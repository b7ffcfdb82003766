//! An in-memory TPM.
//!
//! Policy sessions run through [`PolicyComputer`], so they follow the same
//! digest rules as the trial computations, and additionally enforce the
//! checks a device makes before updating a session: PolicyOR only accepts
//! a digest it was given, PolicyNV compares the index contents, and so on.
//!
//! Not modelled: dictionary attack protection, parameter encryption,
//! hierarchies other than owner (whose auth value is always empty), and
//! any confidentiality of sealed objects.

use std::collections::BTreeMap;

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use super::types::{
    is_nv_index, permanent_handle_name, CommandCode, NvAttributes, NvOperation, NvPublic, NvType,
    PcrSelectionList, PcrValues, MAX_PCR_INDEX, TPM_RH_OWNER,
};
use super::{
    NvAuth, NvStorage, PcrBanks, PolicySessions, Result, SealedObject, SessionHandle, TpmError,
    TpmObjects, VerifiedTicket,
};
use crate::digest::{pcr_composite_digest, Digest, HashAlgorithm};
use crate::marshal::{put_tpm2b, put_u16, MarshalError, Reader};
use crate::policy::auth_key::{AuthKeyPublic, Signature};
use crate::policy::{approved_policy_signing_digest, PolicyComputer};

/// Loaded session slots, as on a typical discrete TPM
pub const MAX_SESSIONS: usize = 3;

const SESSION_HANDLE_BASE: u32 = 0x0300_0000;
const PROOF_SIZE: usize = 32;
const MAX_SEALED_DATA: usize = 128;
const COUNTER_SIZE: u16 = 8;

#[derive(Debug)]
struct Session {
    trial: PolicyComputer,
    command_code: Option<CommandCode>,
    auth_value: bool,
}

#[derive(Debug)]
struct NvIndex {
    public: NvPublic,
    auth_value: Vec<u8>,
    data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
}

#[derive(Debug)]
pub struct SoftTpm {
    rng: StdRng,
    /// Stands in for the storage hierarchy seed; replaced by a clear
    proof: Vec<u8>,
    pcrs: PcrValues,
    nv: BTreeMap<u32, NvIndex>,
    sessions: BTreeMap<SessionHandle, Session>,
    next_session: u32,
    /// Highest value any counter has held, which new counters start from
    counter_floor: u64,
}

impl Default for SoftTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftTpm {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// A TPM whose random numbers, and so lock index names, are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(mut rng: StdRng) -> Self {
        let mut proof = vec![0; PROOF_SIZE];
        rng.fill_bytes(&mut proof);
        Self {
            rng,
            proof,
            pcrs: PcrValues::new(),
            nv: BTreeMap::new(),
            sessions: BTreeMap::new(),
            next_session: 0,
            counter_floor: 0,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// A platform reset: PCRs return to zero and sessions are lost. NV
    /// contents, write locks included, survive.
    pub fn reset(&mut self) {
        debug!("soft TPM reset");
        self.pcrs.clear();
        self.sessions.clear();
    }

    /// TPM2_Clear: every NV index goes and objects sealed before no longer
    /// load. Counters still never go backwards.
    pub fn clear(&mut self) {
        debug!("soft TPM clear");
        self.nv.clear();
        self.sessions.clear();
        self.rng.fill_bytes(&mut self.proof);
    }

    fn session(&self, handle: SessionHandle) -> Result<&Session> {
        self.sessions
            .get(&handle)
            .ok_or(TpmError::SessionNotFound(handle))
    }

    fn session_mut(&mut self, handle: SessionHandle) -> Result<&mut Session> {
        self.sessions
            .get_mut(&handle)
            .ok_or(TpmError::SessionNotFound(handle))
    }

    fn index(&self, index: u32) -> Result<&NvIndex> {
        self.nv.get(&index).ok_or(TpmError::NvIndexNotFound(index))
    }

    fn index_mut(&mut self, index: u32) -> Result<&mut NvIndex> {
        self.nv.get_mut(&index).ok_or(TpmError::NvIndexNotFound(index))
    }

    /// A policy session authorizes `code` for an entity with `auth_policy`.
    fn check_policy(
        &self,
        handle: SessionHandle,
        auth_policy: &[u8],
        code: CommandCode,
    ) -> Result<()> {
        let session = self.session(handle)?;
        let wrong_code = matches!(session.command_code, Some(bound) if bound != code);
        if session.trial.digest().as_slice() != auth_policy || wrong_code {
            return Err(TpmError::PolicyCheck(code));
        }
        Ok(())
    }

    fn authorize(&self, index: u32, auth: &NvAuth, access: Access, code: CommandCode) -> Result<()> {
        let entry = self.index(index)?;
        let attributes = entry.public.attributes;
        let (owner, by_auth, by_policy) = match access {
            Access::Read => (
                NvAttributes::OWNERREAD,
                NvAttributes::AUTHREAD,
                NvAttributes::POLICYREAD,
            ),
            Access::Write => (
                NvAttributes::OWNERWRITE,
                NvAttributes::AUTHWRITE,
                NvAttributes::POLICYWRITE,
            ),
        };
        match auth {
            NvAuth::Owner if attributes.contains(owner) => Ok(()),
            NvAuth::Index(value) if attributes.contains(by_auth) => {
                if *value == entry.auth_value {
                    Ok(())
                } else {
                    Err(TpmError::AuthFail(index))
                }
            }
            NvAuth::Policy(session) if attributes.contains(by_policy) => {
                self.check_policy(*session, &entry.public.auth_policy, code)
            }
            _ => Err(TpmError::NvAttributes(index)),
        }
    }

    fn read_pcrs(&self, selection: &PcrSelectionList) -> Result<PcrValues> {
        if selection.is_empty() {
            return Err(TpmError::EmptyPcrSelectionList);
        }
        let mut values = PcrValues::new();
        for (alg, index) in selection.slots() {
            if index > MAX_PCR_INDEX {
                return Err(TpmError::InvalidPcr(index));
            }
            let value = self
                .pcrs
                .get(&alg)
                .and_then(|bank| bank.get(&index))
                .cloned()
                .unwrap_or_else(|| alg.zero());
            values.entry(alg).or_default().insert(index, value);
        }
        Ok(values)
    }

    fn ticket(&self, digest: &[u8], key_name: &[u8]) -> Digest {
        HashAlgorithm::Sha256.hash(&[&self.proof, b"VERIFIED", digest, key_name])
    }

    fn object_tag(&self, public: &[u8], data: &[u8]) -> Digest {
        HashAlgorithm::Sha256.hash(&[&self.proof, b"SEALED", public, data])
    }
}

fn counter_value(data: &[u8]) -> u64 {
    data.iter().fold(0, |acc, b| (acc << 8) | u64::from(*b))
}

fn key_name_alg(key_name: &[u8]) -> Result<HashAlgorithm> {
    let id = key_name
        .get(..2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| MarshalError::InvalidValue("key name too short".to_string()))?;
    HashAlgorithm::from_id(id).map_err(|e| MarshalError::InvalidValue(e.to_string()).into())
}

impl PcrBanks for SoftTpm {
    fn pcr_read(&mut self, selection: &PcrSelectionList) -> Result<PcrValues> {
        self.read_pcrs(selection)
    }

    /// Extends a single bank. A real extend covers every active bank with
    /// one digest each.
    fn pcr_extend(&mut self, alg: HashAlgorithm, index: u32, digest: &[u8]) -> Result<()> {
        if index > MAX_PCR_INDEX {
            return Err(TpmError::InvalidPcr(index));
        }
        if digest.len() != alg.size() {
            return Err(MarshalError::InvalidValue(format!(
                "{alg} extend needs a {} byte digest",
                alg.size()
            ))
            .into());
        }
        let value = self
            .pcrs
            .entry(alg)
            .or_default()
            .entry(index)
            .or_insert_with(|| alg.zero());
        let extended = alg.extend(value.as_slice(), digest);
        *value = extended;
        trace!("extended {alg} PCR {index}");
        Ok(())
    }
}

impl NvStorage for SoftTpm {
    fn nv_define_space(&mut self, public: &NvPublic, auth_value: &[u8]) -> Result<()> {
        let index = public.index;
        if !is_nv_index(index)
            || public.attributes.nv_type().is_none()
            || public.attributes.0 & (NvAttributes::WRITTEN | NvAttributes::WRITELOCKED) != 0
        {
            return Err(TpmError::NvAttributes(index));
        }
        if public.attributes.nv_type() == Some(NvType::Counter) && public.data_size != COUNTER_SIZE
        {
            return Err(TpmError::NvAttributes(index));
        }
        if self.nv.contains_key(&index) {
            return Err(TpmError::NvIndexExists(index));
        }
        self.nv.insert(
            index,
            NvIndex {
                public: public.clone(),
                auth_value: auth_value.to_vec(),
                data: None,
            },
        );
        debug!("defined NV index {index:#010x}");
        Ok(())
    }

    fn nv_undefine_space(&mut self, index: u32) -> Result<()> {
        self.nv
            .remove(&index)
            .map(|_| debug!("undefined NV index {index:#010x}"))
            .ok_or(TpmError::NvIndexNotFound(index))
    }

    fn nv_read_public(&mut self, index: u32) -> Result<NvPublic> {
        Ok(self.index(index)?.public.clone())
    }

    fn nv_read(&mut self, index: u32, auth: &NvAuth, size: u16, offset: u16) -> Result<Vec<u8>> {
        self.authorize(index, auth, Access::Read, CommandCode::NvRead)?;
        let data = self
            .index(index)?
            .data
            .as_ref()
            .ok_or(TpmError::NvUninitialized(index))?;
        let start = offset as usize;
        data.get(start..start + size as usize)
            .map(<[u8]>::to_vec)
            .ok_or(TpmError::NvRange(index))
    }

    fn nv_write(&mut self, index: u32, auth: &NvAuth, data: &[u8], offset: u16) -> Result<()> {
        let public = &self.index(index)?.public;
        if public.attributes.nv_type() != Some(NvType::Ordinary) {
            return Err(TpmError::NvAttributes(index));
        }
        if public.attributes.contains(NvAttributes::WRITELOCKED) {
            return Err(TpmError::NvLocked(index));
        }
        let size = public.data_size as usize;
        self.authorize(index, auth, Access::Write, CommandCode::NvWrite)?;
        let start = offset as usize;
        let end = start + data.len();
        if end > size {
            return Err(TpmError::NvRange(index));
        }
        let entry = self.index_mut(index)?;
        entry.data.get_or_insert_with(|| vec![0; size])[start..end].copy_from_slice(data);
        entry.public.attributes = entry.public.attributes.with(NvAttributes::WRITTEN);
        Ok(())
    }

    fn nv_increment(&mut self, index: u32, auth: &NvAuth) -> Result<()> {
        let public = &self.index(index)?.public;
        if public.attributes.nv_type() != Some(NvType::Counter) {
            return Err(TpmError::NvAttributes(index));
        }
        if public.attributes.contains(NvAttributes::WRITELOCKED) {
            return Err(TpmError::NvLocked(index));
        }
        self.authorize(index, auth, Access::Write, CommandCode::NvIncrement)?;
        let floor = self.counter_floor;
        let entry = self.index_mut(index)?;
        let current = entry.data.as_deref().map_or(floor, counter_value);
        let value = current.checked_add(1).ok_or(TpmError::NvRange(index))?;
        entry.data = Some(value.to_be_bytes().to_vec());
        entry.public.attributes = entry.public.attributes.with(NvAttributes::WRITTEN);
        self.counter_floor = self.counter_floor.max(value);
        trace!("NV counter {index:#010x} at {value}");
        Ok(())
    }

    fn nv_write_lock(&mut self, index: u32, auth: &NvAuth) -> Result<()> {
        if !self
            .index(index)?
            .public
            .attributes
            .contains(NvAttributes::WRITEDEFINE)
        {
            return Err(TpmError::NvAttributes(index));
        }
        self.authorize(index, auth, Access::Write, CommandCode::NvWriteLock)?;
        let entry = self.index_mut(index)?;
        entry.public.attributes = entry.public.attributes.with(NvAttributes::WRITELOCKED);
        Ok(())
    }

    fn nv_change_auth(
        &mut self,
        index: u32,
        session: SessionHandle,
        old_auth: &[u8],
        new_auth: &[u8],
    ) -> Result<()> {
        let entry = self.index(index)?;
        self.check_policy(session, &entry.public.auth_policy, CommandCode::NvChangeAuth)?;
        if self.session(session)?.auth_value && old_auth != entry.auth_value.as_slice() {
            return Err(TpmError::AuthFail(index));
        }
        self.index_mut(index)?.auth_value = new_auth.to_vec();
        Ok(())
    }
}

impl PolicySessions for SoftTpm {
    fn start_policy_session(&mut self, alg: HashAlgorithm) -> Result<SessionHandle> {
        if self.sessions.len() >= MAX_SESSIONS {
            return Err(TpmError::AuthSessionCreate);
        }
        let handle = SESSION_HANDLE_BASE | (self.next_session & 0x00ff_ffff);
        self.next_session = self.next_session.wrapping_add(1);
        self.sessions.insert(
            handle,
            Session {
                trial: PolicyComputer::new(alg),
                command_code: None,
                auth_value: false,
            },
        );
        Ok(handle)
    }

    fn policy_pcr(
        &mut self,
        session: SessionHandle,
        pcr_digest: &[u8],
        selection: &PcrSelectionList,
    ) -> Result<()> {
        let alg = self.session(session)?.trial.alg();
        let values = self.read_pcrs(selection)?;
        let ordered = selection
            .ordered_values(&values)
            .ok_or(TpmError::PolicyCheck(CommandCode::PolicyPCR))?;
        let composite = pcr_composite_digest(alg, ordered);
        if !pcr_digest.is_empty() && pcr_digest != composite.as_slice() {
            return Err(TpmError::PolicyCheck(CommandCode::PolicyPCR));
        }
        self.session_mut(session)?
            .trial
            .policy_pcr(&composite, selection);
        Ok(())
    }

    fn policy_or(&mut self, session: SessionHandle, digests: &[Digest]) -> Result<()> {
        let session = self.session_mut(session)?;
        if !(2..=8).contains(&digests.len()) || !digests.contains(session.trial.digest()) {
            return Err(TpmError::PolicyCheck(CommandCode::PolicyOR));
        }
        session.trial.policy_or(digests);
        Ok(())
    }

    fn policy_nv(
        &mut self,
        session: SessionHandle,
        index: u32,
        auth: &NvAuth,
        operand_b: &[u8],
        offset: u16,
        operation: NvOperation,
    ) -> Result<()> {
        self.session(session)?;
        self.authorize(index, auth, Access::Read, CommandCode::PolicyNV)?;
        let entry = self.index(index)?;
        let data = entry
            .data
            .as_ref()
            .ok_or(TpmError::NvUninitialized(index))?;
        let start = offset as usize;
        let operand_a = data
            .get(start..start + operand_b.len())
            .ok_or(TpmError::NvRange(index))?;
        if !operation.compare(operand_a, operand_b) {
            return Err(TpmError::PolicyCheck(CommandCode::PolicyNV));
        }
        let name = entry.public.name();
        self.session_mut(session)?
            .trial
            .policy_nv(&name, operand_b, offset, operation);
        Ok(())
    }

    fn policy_secret(
        &mut self,
        session: SessionHandle,
        auth_handle: u32,
        auth_value: &[u8],
        policy_ref: &[u8],
    ) -> Result<()> {
        self.session(session)?;
        let name = if auth_handle == TPM_RH_OWNER {
            if !auth_value.is_empty() {
                return Err(TpmError::AuthFail(auth_handle));
            }
            permanent_handle_name(TPM_RH_OWNER)
        } else if is_nv_index(auth_handle) {
            let entry = self.index(auth_handle)?;
            if auth_value != entry.auth_value.as_slice() {
                return Err(TpmError::AuthFail(auth_handle));
            }
            entry.public.name()
        } else {
            return Err(TpmError::Unsupported("PolicySecret against this handle type"));
        };
        self.session_mut(session)?
            .trial
            .policy_secret(&name, policy_ref);
        Ok(())
    }

    fn policy_auth_value(&mut self, session: SessionHandle) -> Result<()> {
        let session = self.session_mut(session)?;
        session.auth_value = true;
        session.trial.policy_auth_value();
        Ok(())
    }

    fn policy_command_code(&mut self, session: SessionHandle, code: CommandCode) -> Result<()> {
        let session = self.session_mut(session)?;
        if matches!(session.command_code, Some(bound) if bound != code) {
            return Err(TpmError::PolicyCheck(CommandCode::PolicyCommandCode));
        }
        session.command_code = Some(code);
        session.trial.policy_command_code(code);
        Ok(())
    }

    fn verify_signature(
        &mut self,
        key: &AuthKeyPublic,
        digest: &[u8],
        signature: &Signature,
    ) -> Result<VerifiedTicket> {
        if !key.verify(digest, signature) {
            return Err(TpmError::SignatureCheck);
        }
        Ok(VerifiedTicket {
            digest: self.ticket(digest, &key.name()),
        })
    }

    fn policy_authorize(
        &mut self,
        session: SessionHandle,
        approved_policy: &[u8],
        policy_ref: &[u8],
        key_name: &[u8],
        ticket: &VerifiedTicket,
    ) -> Result<()> {
        let signed = approved_policy_signing_digest(key_name_alg(key_name)?, approved_policy, policy_ref);
        if ticket.digest != self.ticket(&signed, key_name) {
            return Err(TpmError::InvalidTicket);
        }
        let session = self.session_mut(session)?;
        if session.trial.digest().as_slice() != approved_policy {
            return Err(TpmError::PolicyCheck(CommandCode::PolicyAuthorize));
        }
        session.trial.policy_authorize(key_name, policy_ref);
        Ok(())
    }

    fn policy_get_digest(&mut self, session: SessionHandle) -> Result<Digest> {
        Ok(self.session(session)?.trial.digest().clone())
    }

    fn flush_session(&mut self, session: SessionHandle) -> Result<()> {
        self.sessions
            .remove(&session)
            .map(|_| ())
            .ok_or(TpmError::SessionNotFound(session))
    }
}

impl TpmObjects for SoftTpm {
    fn get_random(&mut self, num_bytes: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0; num_bytes];
        self.rng.fill_bytes(&mut bytes);
        Ok(bytes)
    }

    fn create_sealed(&mut self, auth_policy: &[u8], data: &[u8]) -> Result<SealedObject> {
        if data.len() > MAX_SEALED_DATA {
            return Err(TpmError::Unsupported("sealing more than 128 bytes"));
        }
        let mut public = Vec::new();
        put_u16(&mut public, HashAlgorithm::Sha256.id());
        put_tpm2b(&mut public, auth_policy);
        let mut private = Vec::new();
        put_tpm2b(&mut private, data);
        put_tpm2b(&mut private, &self.object_tag(&public, data));
        Ok(SealedObject { public, private })
    }

    fn unseal(&mut self, object: &SealedObject, session: SessionHandle) -> Result<Vec<u8>> {
        let mut reader = Reader::new(&object.public);
        if reader.u16()? != HashAlgorithm::Sha256.id() {
            return Err(MarshalError::InvalidValue("object name algorithm".to_string()).into());
        }
        let auth_policy = reader.tpm2b()?;
        reader.finish()?;

        let mut reader = Reader::new(&object.private);
        let data = reader.tpm2b()?;
        let tag = reader.tpm2b()?;
        reader.finish()?;
        if tag != self.object_tag(&object.public, &data) {
            return Err(TpmError::ObjectIntegrity);
        }
        self.check_policy(session, &auth_policy, CommandCode::Unseal)?;
        Ok(data)
    }
}
