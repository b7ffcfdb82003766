//! Measured boot events, as decoded by an event log reader.

use serde::{Deserialize, Serialize};

use super::{ProfileError, Result};
use crate::digest::{Digest, HashAlgorithm};

/// "Calling EFI Application from Boot Option", the action measured into
/// PCR 4 before the first boot application starts.
pub const EFI_CALLING_EFI_APPLICATION: &str = "Calling EFI Application from Boot Option";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDigest {
    pub bank: HashAlgorithm,
    #[serde(with = "hex")]
    pub digest: Digest,
}

/// The kinds of event a boot can measure. Only the separator and EFI
/// action digests can be derived here; anything else carries the digests
/// the event log recorded for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BootEvent {
    /// EV_SEPARATOR, measured as a zero u32
    Separator { pcr: u32 },
    /// EV_EFI_ACTION, measured as the action string without terminator
    EfiAction { pcr: u32, action: String },
    /// Image loads, variable reads and the like
    Measurement { pcr: u32, digests: Vec<EventDigest> },
}

impl BootEvent {
    pub fn pcr(&self) -> u32 {
        match self {
            BootEvent::Separator { pcr }
            | BootEvent::EfiAction { pcr, .. }
            | BootEvent::Measurement { pcr, .. } => *pcr,
        }
    }

    /// The digest this event extends into `bank`.
    pub fn digest(&self, bank: HashAlgorithm) -> Result<Digest> {
        match self {
            BootEvent::Separator { .. } => Ok(bank.hash(&[&0u32.to_le_bytes()])),
            BootEvent::EfiAction { action, .. } => Ok(bank.hash(&[action.as_bytes()])),
            BootEvent::Measurement { pcr, digests } => digests
                .iter()
                .find(|d| d.bank == bank)
                .map(|d| d.digest.clone())
                .ok_or(ProfileError::MissingEventDigest { bank, pcr: *pcr }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn separator_digest() -> Result<()> {
        // sha256 of four zero bytes, seen in every PC client event log
        assert_eq!(
            BootEvent::Separator { pcr: 7 }.digest(HashAlgorithm::Sha256)?,
            hex::decode("df3f619804a92fdb4057192dc43dd748ea778adc52bc498ce80524c014b81119")?
        );
        Ok(())
    }

    #[test]
    fn measurement_needs_digest_for_bank() {
        let event = BootEvent::Measurement {
            pcr: 4,
            digests: vec![EventDigest {
                bank: HashAlgorithm::Sha1,
                digest: vec![0; 20],
            }],
        };
        assert_eq!(
            event.digest(HashAlgorithm::Sha256),
            Err(ProfileError::MissingEventDigest {
                bank: HashAlgorithm::Sha256,
                pcr: 4
            })
        );
    }

    #[test]
    fn events_deserialize_from_tagged_yaml() -> Result<()> {
        let events: Vec<BootEvent> = serde_yaml::from_str(
            r#"
- kind: efi_action
  pcr: 4
  action: Calling EFI Application from Boot Option
- kind: measurement
  pcr: 4
  digests:
    - bank: sha1
      digest: "0000000000000000000000000000000000000000"
- kind: separator
  pcr: 4
"#,
        )?;
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            BootEvent::EfiAction {
                pcr: 4,
                action: EFI_CALLING_EFI_APPLICATION.to_string()
            }
        );
        Ok(())
    }
}
