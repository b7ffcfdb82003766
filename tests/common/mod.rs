#![allow(dead_code)]

use eyre::Result;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rsa::RsaPrivateKey;

use tpm_secboot::digest::HashAlgorithm;
use tpm_secboot::policy::auth_key::AuthKey;
use tpm_secboot::policy::{DynamicPolicyData, StaticPolicyData};
use tpm_secboot::profile::ProfileBuilder;
use tpm_secboot::seal::{provision, seal_policy, seal_secret, IndexHandles, Provisioned};
use tpm_secboot::tpm::{PcrBanks, SealedObject};
use tpm_secboot::SoftTpm;

pub const ALG: HashAlgorithm = HashAlgorithm::Sha256;
pub const PIN: &[u8] = b"2468";
pub const SECRET: &[u8] = b"disk unlock key";

static KEY: Lazy<RsaPrivateKey> = Lazy::new(|| {
    let mut rng = StdRng::seed_from_u64(0x7e57);
    RsaPrivateKey::new(&mut rng, 2048).expect("test key generation")
});

pub fn auth_key() -> AuthKey {
    signing_key(ALG)
}

/// The shared test key with an RSASSA scheme over `scheme_hash`.
pub fn signing_key(scheme_hash: HashAlgorithm) -> AuthKey {
    AuthKey::new(KEY.clone(), scheme_hash).expect("test key fits a TPMT_PUBLIC")
}

pub fn event(data: &str) -> Vec<u8> {
    ALG.hash(&[data.as_bytes()])
}

/// Power cycles the TPM and measures "A" into PCR 7 and `pcr8` into PCR 8.
pub fn boot(tpm: &mut SoftTpm, pcr8: &str) -> Result<()> {
    tpm.reset();
    tpm.pcr_extend(ALG, 7, &event("A"))?;
    tpm.pcr_extend(ALG, 8, &event(pcr8))?;
    Ok(())
}

/// PCR 7 "A", then one of `pcr8` into PCR 8.
pub fn profile(pcr8: &[&str]) -> Result<ProfileBuilder> {
    let branches = pcr8
        .iter()
        .map(|e| -> Result<ProfileBuilder> {
            let mut branch = ProfileBuilder::new();
            branch.extend_pcr(ALG, 8, &event(e))?;
            Ok(branch)
        })
        .collect::<Result<Vec<_>>>()?;
    let mut profile = ProfileBuilder::new();
    profile.extend_pcr(ALG, 7, &event("A"))?.add_branches(&branches)?;
    Ok(profile)
}

pub struct Sealed {
    pub provisioned: Provisioned,
    pub static_data: StaticPolicyData,
    pub dynamic: DynamicPolicyData,
    pub object: SealedObject,
}

pub fn seal(tpm: &mut SoftTpm, profile: &ProfileBuilder) -> Result<Sealed> {
    seal_with_key(tpm, profile, &auth_key())
}

pub fn seal_with_key(
    tpm: &mut SoftTpm,
    profile: &ProfileBuilder,
    key: &AuthKey,
) -> Result<Sealed> {
    let provisioned = provision(tpm, &IndexHandles::default(), PIN)?;
    let (digest, static_data, dynamic) = seal_policy(
        ALG,
        &provisioned.static_params(key.public()),
        &provisioned.dynamic_params(key, profile.compute_pcr_values()),
    )?;
    let object = seal_secret(tpm, &digest, SECRET)?;
    Ok(Sealed {
        provisioned,
        static_data,
        dynamic,
        object,
    })
}
