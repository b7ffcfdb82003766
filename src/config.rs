//! YAML configuration: the policy algorithm, where the NV indices live and
//! the boot profile to authorize.
//!
//! ```yaml
//! alg: sha256
//! profile:
//!   - step: extend
//!     bank: sha256
//!     pcr: 7
//!     digest: "3f5a..."
//!   - step: branches
//!     branches:
//!       - - step: extend
//!           bank: sha256
//!           pcr: 8
//!           digest: "..."
//!       - - step: snap_models
//!           bank: sha256
//!           pcr: 12
//!           models: [...]
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::{Digest, HashAlgorithm};
use crate::profile::{
    add_snap_model_profile, BootEvent, ProfileBuilder, ProfileError, SnapModel,
    SnapModelProfileParams,
};
use crate::seal::IndexHandles;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

fn default_alg() -> HashAlgorithm {
    HashAlgorithm::Sha256
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Policy session algorithm
    #[serde(default = "default_alg")]
    pub alg: HashAlgorithm,
    #[serde(default)]
    pub handles: IndexHandles,
    /// Overrides the TCTI given on the command line
    #[serde(default)]
    pub tcti: Option<String>,
    pub profile: Vec<ProfileStep>,
}

/// One step of a profile. Steps apply in order; `branches` nests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ProfileStep {
    Extend {
        bank: HashAlgorithm,
        pcr: u32,
        #[serde(with = "hex")]
        digest: Digest,
    },
    Branches {
        branches: Vec<Vec<ProfileStep>>,
    },
    SnapModels {
        bank: HashAlgorithm,
        pcr: u32,
        models: Vec<SnapModel>,
    },
    LoadSequences {
        banks: Vec<HashAlgorithm>,
        sequences: Vec<Vec<BootEvent>>,
    },
}

fn apply_steps(profile: &mut ProfileBuilder, steps: &[ProfileStep]) -> Result<(), ProfileError> {
    for step in steps {
        match step {
            ProfileStep::Extend { bank, pcr, digest } => {
                profile.extend_pcr(*bank, *pcr, digest)?;
            }
            ProfileStep::Branches { branches } => {
                let branches = branches
                    .iter()
                    .map(|steps| -> Result<ProfileBuilder, ProfileError> {
                        let mut branch = ProfileBuilder::new();
                        apply_steps(&mut branch, steps)?;
                        Ok(branch)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                profile.add_branches(&branches)?;
            }
            ProfileStep::SnapModels { bank, pcr, models } => {
                add_snap_model_profile(
                    profile,
                    &SnapModelProfileParams {
                        bank: *bank,
                        pcr: *pcr,
                        models: models.clone(),
                    },
                )?;
            }
            ProfileStep::LoadSequences { banks, sequences } => {
                profile.add_load_sequences(banks, sequences)?;
            }
        }
    }
    Ok(())
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn profile(&self) -> Result<ProfileBuilder> {
        let mut profile = ProfileBuilder::new();
        apply_steps(&mut profile, &self.profile)?;
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use std::io::Write;

    fn scenario_yaml() -> String {
        let alg = HashAlgorithm::Sha256;
        let digest = |data: &[u8]| hex::encode(alg.hash(&[data]));
        format!(
            r#"
profile:
  - step: extend
    bank: sha256
    pcr: 7
    digest: "{}"
  - step: branches
    branches:
      - - step: extend
          bank: sha256
          pcr: 8
          digest: "{}"
      - - step: extend
          bank: sha256
          pcr: 8
          digest: "{}"
"#,
            digest(b"A"),
            digest(b"B1"),
            digest(b"B2")
        )
    }

    #[test]
    fn defaults_and_nested_branches() -> Result<()> {
        let config = Config::from_yaml(&scenario_yaml())?;
        assert_eq!(config.alg, HashAlgorithm::Sha256);
        assert_eq!(config.handles, IndexHandles::default());
        assert_eq!(config.tcti, None);
        let resolved = config.profile()?.resolve(HashAlgorithm::Sha256);
        assert_eq!(resolved.indices, vec![7, 8]);
        assert_eq!(resolved.len(), 2);
        Ok(())
    }

    #[test]
    fn load_from_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "tcti: mssim:host=localhost\n{}", scenario_yaml())?;
        let config = Config::load(file.path())?;
        assert_eq!(config.tcti.as_deref(), Some("mssim:host=localhost"));
        assert!(matches!(
            Config::load(Path::new("/nonexistent/profile.yaml")),
            Err(ConfigError::Read { .. })
        ));
        Ok(())
    }

    #[test]
    fn bad_digest_length_is_a_profile_error() -> Result<()> {
        let config = Config::from_yaml(
            r#"
profile:
  - step: extend
    bank: sha1
    pcr: 7
    digest: "00"
"#,
        )?;
        assert!(matches!(
            config.profile(),
            Err(ConfigError::Profile(ProfileError::InvalidDigestLength { .. }))
        ));
        Ok(())
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            Config::from_yaml("profile: []\npcrs: sha1:0\n"),
            Err(ConfigError::Yaml(_))
        ));
    }
}
