//! Records stored next to a sealed object.
//!
//! Both records use TPM style big-endian fields behind a version byte.

use super::auth_key::{AuthKeyPublic, Signature};
use crate::digest::{Digest, HashAlgorithm};
use crate::marshal::{
    self, check_tpm2b, put_tpm2b, put_u16, put_u32, put_u64, put_u8, Marshal, MarshalError,
    Reader, Unmarshal,
};
use crate::tpm::types::{Name, NvPublic, PcrSelectionList};

const STATIC_POLICY_DATA_VERSION: u8 = 1;
const DYNAMIC_POLICY_DATA_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPolicyData {
    pub auth_public: AuthKeyPublic,
    pub pin_index: NvPublic,
    pub pin_index_auth_policies: Vec<Digest>,
    pub lock_index: u32,
    pub lock_index_name: Name,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicPolicyData {
    pub alg: HashAlgorithm,
    pub pcr_selection: PcrSelectionList,
    /// PolicyPCR digest of every authorized branch, in profile order
    pub branch_digests: Vec<Digest>,
    pub counter_index: u32,
    pub counter_name: Name,
    pub epoch: u64,
    pub authorized_policy: Digest,
    pub signature: Signature,
}

fn put_digest_list(buf: &mut Vec<u8>, digests: &[Digest]) {
    put_u32(buf, digests.len() as u32);
    for digest in digests {
        put_tpm2b(buf, digest);
    }
}

fn check_digest_list(digests: &[Digest]) -> marshal::Result<()> {
    if u32::try_from(digests.len()).is_err() {
        return Err(MarshalError::InvalidValue(format!(
            "{} digests in one list",
            digests.len()
        )));
    }
    digests.iter().try_for_each(|digest| check_tpm2b(digest))
}

fn read_digest_list(reader: &mut Reader<'_>) -> marshal::Result<Vec<Digest>> {
    let count = reader.u32()?;
    (0..count).map(|_| reader.tpm2b()).collect()
}

/// Reads a structure wrapped in a TPM2B, which must consume it exactly.
fn read_sized<T: Unmarshal>(reader: &mut Reader<'_>) -> marshal::Result<T> {
    let bytes = reader.tpm2b()?;
    let mut inner = Reader::new(&bytes);
    let value = inner.read()?;
    inner.finish()?;
    Ok(value)
}

fn check_version(reader: &mut Reader<'_>, expected: u8) -> marshal::Result<()> {
    match reader.u8()? {
        v if v == expected => Ok(()),
        v => Err(MarshalError::InvalidValue(format!(
            "unsupported record version {v}"
        ))),
    }
}

impl Marshal for StaticPolicyData {
    fn marshal(&self, buf: &mut Vec<u8>) {
        put_tpm2b(buf, &self.auth_public.to_marshalled());
        put_tpm2b(buf, &self.pin_index.to_marshalled());
        put_digest_list(buf, &self.pin_index_auth_policies);
        put_u32(buf, self.lock_index);
        put_tpm2b(buf, &self.lock_index_name);
    }
}

impl Unmarshal for StaticPolicyData {
    fn unmarshal(reader: &mut Reader<'_>) -> marshal::Result<Self> {
        Ok(Self {
            auth_public: read_sized(reader)?,
            pin_index: read_sized(reader)?,
            pin_index_auth_policies: read_digest_list(reader)?,
            lock_index: reader.u32()?,
            lock_index_name: reader.tpm2b()?,
        })
    }
}

impl StaticPolicyData {
    /// Fails with [`MarshalError::Oversized`] rather than writing a field
    /// whose length does not fit its TPM2B prefix.
    pub fn to_bytes(&self) -> marshal::Result<Vec<u8>> {
        check_tpm2b(&self.auth_public.to_marshalled())?;
        check_tpm2b(&self.pin_index.to_marshalled())?;
        check_digest_list(&self.pin_index_auth_policies)?;
        check_tpm2b(&self.lock_index_name)?;
        let mut buf = vec![STATIC_POLICY_DATA_VERSION];
        self.marshal(&mut buf);
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> marshal::Result<Self> {
        let mut reader = Reader::new(bytes);
        check_version(&mut reader, STATIC_POLICY_DATA_VERSION)?;
        let data = reader.read()?;
        reader.finish()?;
        Ok(data)
    }
}

impl Marshal for DynamicPolicyData {
    fn marshal(&self, buf: &mut Vec<u8>) {
        put_u16(buf, self.alg.id());
        self.pcr_selection.marshal(buf);
        put_digest_list(buf, &self.branch_digests);
        put_u32(buf, self.counter_index);
        put_tpm2b(buf, &self.counter_name);
        put_u64(buf, self.epoch);
        put_tpm2b(buf, &self.authorized_policy);
        self.signature.marshal(buf);
    }
}

impl Unmarshal for DynamicPolicyData {
    fn unmarshal(reader: &mut Reader<'_>) -> marshal::Result<Self> {
        let alg = HashAlgorithm::from_id(reader.u16()?)
            .map_err(|e| MarshalError::InvalidValue(e.to_string()))?;
        Ok(Self {
            alg,
            pcr_selection: reader.read()?,
            branch_digests: read_digest_list(reader)?,
            counter_index: reader.u32()?,
            counter_name: reader.tpm2b()?,
            epoch: reader.u64()?,
            authorized_policy: reader.tpm2b()?,
            signature: reader.read()?,
        })
    }
}

impl DynamicPolicyData {
    /// Same checks as [`StaticPolicyData::to_bytes`].
    pub fn to_bytes(&self) -> marshal::Result<Vec<u8>> {
        check_digest_list(&self.branch_digests)?;
        check_tpm2b(&self.counter_name)?;
        check_tpm2b(&self.authorized_policy)?;
        check_tpm2b(&self.signature.bytes)?;
        let mut buf = Vec::new();
        put_u8(&mut buf, DYNAMIC_POLICY_DATA_VERSION);
        self.marshal(&mut buf);
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> marshal::Result<Self> {
        let mut reader = Reader::new(bytes);
        check_version(&mut reader, DYNAMIC_POLICY_DATA_VERSION)?;
        let data = reader.read()?;
        reader.finish()?;
        Ok(data)
    }
}
