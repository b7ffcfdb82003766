//! The RSA key that authorizes dynamic policies.
//!
//! The TPM only ever sees the public half, as a TPMT_PUBLIC loaded for
//! TPM2_VerifySignature; its name is what PolicyAuthorize binds to.

use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};

use crate::digest::{Digest, HashAlgorithm};
use crate::marshal::{
    self, put_tpm2b, put_u16, put_u32, Marshal, MarshalError, Reader, Unmarshal,
};
use crate::tpm::types::Name;

const TPM_ALG_RSA: u16 = 0x0001;
const TPM_ALG_NULL: u16 = 0x0010;
const TPM_ALG_RSASSA: u16 = 0x0014;
const RSA_DEFAULT_EXPONENT: u32 = 65537;

/// sensitiveDataOrigin | userWithAuth | sign
const SIGNING_KEY_ATTRIBUTES: u32 = (1 << 5) | (1 << 6) | (1 << 18);

/// The public half of the authorization key as the TPM sees it.
///
/// Its name algorithm is the RSASSA scheme hash. TPM2_PolicyAuthorize hashes
/// the approved policy with the name algorithm of the key that signed it,
/// and an RSASSA signature only covers a digest of the scheme hash, so the
/// two have to agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthKeyPublic {
    key: RsaPublicKey,
    scheme_hash: HashAlgorithm,
    key_bits: u16,
    exponent: u32,
}

impl AuthKeyPublic {
    /// Fails for keys a TPMS_RSA_PARMS cannot describe: more than 65535
    /// modulus bits or an exponent wider than 32 bits.
    pub fn new(key: RsaPublicKey, scheme_hash: HashAlgorithm) -> marshal::Result<Self> {
        let key_bits = u16::try_from(key.n().bits()).map_err(|_| {
            MarshalError::InvalidValue(format!("{}-bit RSA modulus", key.n().bits()))
        })?;
        let exponent = rsa_exponent(key.e())?;
        Ok(Self {
            key,
            scheme_hash,
            key_bits,
            exponent,
        })
    }

    pub fn from_private(key: &RsaPrivateKey, scheme_hash: HashAlgorithm) -> marshal::Result<Self> {
        Self::new(key.to_public_key(), scheme_hash)
    }

    pub fn key(&self) -> &RsaPublicKey {
        &self.key
    }

    pub fn scheme_hash(&self) -> HashAlgorithm {
        self.scheme_hash
    }

    pub fn name_alg(&self) -> HashAlgorithm {
        self.scheme_hash
    }

    pub fn name(&self) -> Name {
        let name_alg = self.name_alg();
        let mut name = name_alg.id().to_be_bytes().to_vec();
        name.extend(name_alg.hash(&[&self.to_marshalled()]));
        name
    }

    /// Checks an RSASSA-PKCS1-v1_5 signature over an already computed digest.
    pub fn verify(&self, digest: &[u8], signature: &Signature) -> bool {
        signature.hash == self.scheme_hash
            && self
                .key
                .verify(pkcs1v15_scheme(signature.hash), digest, &signature.bytes)
                .is_ok()
    }
}

/// TPMS_RSA_PARMS.exponent, where 0 stands for 65537.
fn rsa_exponent(e: &BigUint) -> marshal::Result<u32> {
    if *e == BigUint::from(RSA_DEFAULT_EXPONENT) {
        return Ok(0);
    }
    let bytes = e.to_bytes_be();
    if bytes.len() > 4 {
        return Err(MarshalError::InvalidValue(format!(
            "RSA exponent {e} does not fit 32 bits"
        )));
    }
    Ok(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

impl Marshal for AuthKeyPublic {
    fn marshal(&self, buf: &mut Vec<u8>) {
        put_u16(buf, TPM_ALG_RSA);
        put_u16(buf, self.name_alg().id());
        put_u32(buf, SIGNING_KEY_ATTRIBUTES);
        put_tpm2b(buf, &[]);
        // TPMS_RSA_PARMS: no symmetric wrapping, RSASSA with the scheme hash
        put_u16(buf, TPM_ALG_NULL);
        put_u16(buf, TPM_ALG_RSASSA);
        put_u16(buf, self.scheme_hash.id());
        put_u16(buf, self.key_bits);
        put_u32(buf, self.exponent);
        put_tpm2b(buf, &self.key.n().to_bytes_be());
    }
}

impl Unmarshal for AuthKeyPublic {
    fn unmarshal(reader: &mut Reader<'_>) -> marshal::Result<Self> {
        let invalid = |what: &str| MarshalError::InvalidValue(what.to_string());
        if reader.u16()? != TPM_ALG_RSA {
            return Err(invalid("authorization key is not an RSA key"));
        }
        let name_alg = reader.u16()?;
        if reader.u32()? != SIGNING_KEY_ATTRIBUTES {
            return Err(invalid("unexpected authorization key attributes"));
        }
        if !reader.tpm2b()?.is_empty() {
            return Err(invalid("authorization key must not have an auth policy"));
        }
        if reader.u16()? != TPM_ALG_NULL {
            return Err(invalid("authorization key must not be a storage key"));
        }
        if reader.u16()? != TPM_ALG_RSASSA {
            return Err(invalid("authorization key scheme is not RSASSA"));
        }
        let scheme_hash =
            HashAlgorithm::from_id(reader.u16()?).map_err(|e| invalid(&e.to_string()))?;
        if name_alg != scheme_hash.id() {
            return Err(invalid(
                "authorization key name algorithm differs from its scheme hash",
            ));
        }
        let key_bits = reader.u16()?;
        let exponent = match reader.u32()? {
            0 => RSA_DEFAULT_EXPONENT,
            e => e,
        };
        let modulus = reader.tpm2b()?;
        let key = RsaPublicKey::new(
            BigUint::from_bytes_be(&modulus),
            BigUint::from(exponent),
        )
        .map_err(|e| invalid(&e.to_string()))?;
        let public = Self::new(key, scheme_hash)?;
        if public.key_bits != key_bits {
            return Err(invalid("keyBits does not match the modulus"));
        }
        Ok(public)
    }
}

/// TPMT_SIGNATURE with the RSASSA scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub hash: HashAlgorithm,
    pub bytes: Vec<u8>,
}

impl Marshal for Signature {
    fn marshal(&self, buf: &mut Vec<u8>) {
        put_u16(buf, TPM_ALG_RSASSA);
        put_u16(buf, self.hash.id());
        put_tpm2b(buf, &self.bytes);
    }
}

impl Unmarshal for Signature {
    fn unmarshal(reader: &mut Reader<'_>) -> marshal::Result<Self> {
        if reader.u16()? != TPM_ALG_RSASSA {
            return Err(MarshalError::InvalidValue(
                "signature scheme is not RSASSA".to_string(),
            ));
        }
        let hash = HashAlgorithm::from_id(reader.u16()?)
            .map_err(|e| MarshalError::InvalidValue(e.to_string()))?;
        Ok(Self {
            hash,
            bytes: reader.tpm2b()?,
        })
    }
}

fn pkcs1v15_scheme(hash: HashAlgorithm) -> Pkcs1v15Sign {
    match hash {
        HashAlgorithm::Sha1 => Pkcs1v15Sign::new::<sha1::Sha1>(),
        HashAlgorithm::Sha256 => Pkcs1v15Sign::new::<sha2::Sha256>(),
        HashAlgorithm::Sha384 => Pkcs1v15Sign::new::<sha2::Sha384>(),
        HashAlgorithm::Sha512 => Pkcs1v15Sign::new::<sha2::Sha512>(),
    }
}

/// The private half of the authorization key, with the RSASSA hash its
/// public area advertises.
pub struct AuthKey {
    key: RsaPrivateKey,
    public: AuthKeyPublic,
}

impl AuthKey {
    pub fn new(key: RsaPrivateKey, scheme_hash: HashAlgorithm) -> marshal::Result<Self> {
        let public = AuthKeyPublic::from_private(&key, scheme_hash)?;
        Ok(Self { key, public })
    }

    pub fn public(&self) -> AuthKeyPublic {
        self.public.clone()
    }

    pub fn scheme_hash(&self) -> HashAlgorithm {
        self.public.scheme_hash
    }

    /// Signs `digest`, which must already be a digest of the scheme hash.
    pub fn sign(&self, digest: &Digest) -> Result<Signature, rsa::Error> {
        let hash = self.scheme_hash();
        let bytes = self.key.sign(pkcs1v15_scheme(hash), digest)?;
        Ok(Signature { hash, bytes })
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthKey")
            .field("name", &hex::encode(self.public.name()))
            .finish_non_exhaustive()
    }
}
