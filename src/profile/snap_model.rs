//! Binding a profile to a set of device models.
//!
//! The initramfs measures the model assertion it booted with into a PCR.
//! The measurement is three chained hashes, because brand, model and series
//! are variable length:
//!
//! ```text
//! d1 = H(sign-key-sha3-384 || brand-id)
//! d2 = H(d1 || model)
//! d3 = H(d2 || series)
//! ```
//!
//! and `d3` is what gets extended. The signing key id is hashed decoded.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::{ProfileBuilder, ProfileError, Result};
use crate::digest::{Digest, HashAlgorithm};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapModel {
    /// Unpadded base64url SHA3-384 of the signing key
    pub sign_key_id: String,
    pub brand_id: String,
    pub model: String,
    pub series: String,
}

#[derive(Debug, Clone)]
pub struct SnapModelProfileParams {
    pub bank: HashAlgorithm,
    pub pcr: u32,
    pub models: Vec<SnapModel>,
}

pub fn snap_model_digest(bank: HashAlgorithm, model: &SnapModel) -> Result<Digest> {
    let sign_key_id = URL_SAFE_NO_PAD
        .decode(&model.sign_key_id)
        .map_err(|_| ProfileError::InvalidSignKeyId(model.sign_key_id.clone()))?;
    let digest = bank.hash(&[&sign_key_id, model.brand_id.as_bytes()]);
    let digest = bank.hash(&[&digest, model.model.as_bytes()]);
    Ok(bank.hash(&[&digest, model.series.as_bytes()]))
}

/// Adds a choice of one branch per model, each extending that model's
/// measurement into `params.pcr`.
pub fn add_snap_model_profile(
    profile: &mut ProfileBuilder,
    params: &SnapModelProfileParams,
) -> Result<()> {
    if params.models.is_empty() {
        return Err(ProfileError::EmptyBranchSet);
    }
    let branches = params
        .models
        .iter()
        .map(|model| -> Result<ProfileBuilder> {
            let mut branch = ProfileBuilder::new();
            branch.extend_pcr(params.bank, params.pcr, &snap_model_digest(params.bank, model)?)?;
            Ok(branch)
        })
        .collect::<Result<Vec<_>>>()?;
    profile.add_branches(&branches)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    fn model(name: &str) -> SnapModel {
        SnapModel {
            sign_key_id: "Jv8_JiHiIzJVcO9M55pPdqSDWUvuhfDIBJUS-3VW7F_idjix7Ffn5qMxB21ZQuij"
                .to_string(),
            brand_id: "fake-brand".to_string(),
            model: name.to_string(),
            series: "16".to_string(),
        }
    }

    #[test]
    fn measurement_chains_fields() -> Result<()> {
        let bank = HashAlgorithm::Sha256;
        let m = model("fake-model");
        let key = URL_SAFE_NO_PAD.decode(&m.sign_key_id)?;
        assert_eq!(key.len(), 48);
        let d1 = bank.hash(&[&key, b"fake-brand"]);
        let d2 = bank.hash(&[&d1, b"fake-model"]);
        let d3 = bank.hash(&[&d2, b"16"]);
        assert_eq!(snap_model_digest(bank, &m)?, d3);
        Ok(())
    }

    #[test]
    fn one_branch_per_model() -> Result<()> {
        let mut profile = ProfileBuilder::new();
        add_snap_model_profile(
            &mut profile,
            &SnapModelProfileParams {
                bank: HashAlgorithm::Sha256,
                pcr: 12,
                models: vec![model("a"), model("b"), model("a")],
            },
        )?;
        let resolved = profile.resolve(HashAlgorithm::Sha256);
        assert_eq!(resolved.indices, vec![12]);
        assert_eq!(resolved.len(), 2);
        Ok(())
    }

    #[test]
    fn rejects_no_models_and_bad_key_ids() {
        let mut profile = ProfileBuilder::new();
        let mut params = SnapModelProfileParams {
            bank: HashAlgorithm::Sha256,
            pcr: 12,
            models: vec![],
        };
        assert_eq!(
            add_snap_model_profile(&mut profile, &params),
            Err(ProfileError::EmptyBranchSet)
        );
        let mut bad = model("a");
        bad.sign_key_id = "not base64!".to_string();
        params.models.push(bad);
        assert!(matches!(
            add_snap_model_profile(&mut profile, &params),
            Err(ProfileError::InvalidSignKeyId(_))
        ));
    }
}
