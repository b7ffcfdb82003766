//! `tss-esapi` backed PCR access.
//!
//! tss-esapi 7 has no bindings for TPM2_PolicyNV, TPM2_NV_WriteLock or
//! TPM2_NV_ChangeAuth, all of which the policy needs, so the hardware side
//! only implements [`PcrBanks`]. It backs the `digest` command, which reads
//! the running system's PCRs to compare them against a profile.

use std::str::FromStr;

use log::debug;
use tss_esapi::handles::PcrHandle;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::structures::{Digest as TssDigest, DigestValues, PcrSelectionListBuilder, PcrSlot};
use tss_esapi::tcti_ldr::TctiNameConf;
use tss_esapi::Context;

use super::types::{PcrSelectionList, PcrValues};
use super::{PcrBanks, Result, TpmError};
use crate::digest::HashAlgorithm;

fn hashing_algorithm(alg: HashAlgorithm) -> HashingAlgorithm {
    match alg {
        HashAlgorithm::Sha1 => HashingAlgorithm::Sha1,
        HashAlgorithm::Sha256 => HashingAlgorithm::Sha256,
        HashAlgorithm::Sha384 => HashingAlgorithm::Sha384,
        HashAlgorithm::Sha512 => HashingAlgorithm::Sha512,
    }
}

fn pcr_slot(index: u32) -> Result<PcrSlot> {
    let bit = 1u32.checked_shl(index).ok_or(TpmError::InvalidPcr(index))?;
    PcrSlot::try_from(bit).map_err(|_| TpmError::InvalidPcr(index))
}

fn tss_selection(selection: &PcrSelectionList) -> Result<tss_esapi::structures::PcrSelectionList> {
    if selection.is_empty() {
        return Err(TpmError::EmptyPcrSelectionList);
    }
    let mut builder = PcrSelectionListBuilder::new();
    for s in selection.selections() {
        let slots = s
            .indices
            .iter()
            .map(|index| pcr_slot(*index))
            .collect::<Result<Vec<_>>>()?;
        builder = builder.with_selection(hashing_algorithm(s.alg), &slots);
    }
    Ok(builder.build()?)
}

pub struct TssPcrs {
    ctx: Context,
}

impl TssPcrs {
    /// Connects using a TCTI configuration string such as `device:/dev/tpmrm0`.
    pub fn new(tcti: &str) -> Result<Self> {
        let conf = TctiNameConf::from_str(tcti)
            .map_err(|e| TpmError::Transport(format!("invalid TCTI `{tcti}`: {e}")))?;
        debug!("connecting to {tcti}");
        Ok(Self {
            ctx: Context::new(conf)?,
        })
    }
}

impl PcrBanks for TssPcrs {
    fn pcr_read(&mut self, selection: &PcrSelectionList) -> Result<PcrValues> {
        let tss_selection = tss_selection(selection)?;
        let pcr_data = self.ctx.execute_without_session(|ctx| {
            tss_esapi::abstraction::pcr::read_all(ctx, tss_selection)
        })?;
        let mut values = PcrValues::new();
        for (alg, index) in selection.slots() {
            let digest = pcr_data
                .pcr_bank(hashing_algorithm(alg))
                .and_then(|bank| bank.get_digest(pcr_slot(index).ok()?))
                .ok_or(TpmError::InvalidPcr(index))?;
            values
                .entry(alg)
                .or_default()
                .insert(index, digest.value().to_vec());
        }
        Ok(values)
    }

    fn pcr_extend(&mut self, alg: HashAlgorithm, index: u32, digest: &[u8]) -> Result<()> {
        let handle = PcrHandle::try_from(index).map_err(|_| TpmError::InvalidPcr(index))?;
        let mut values = DigestValues::new();
        values.set(hashing_algorithm(alg), TssDigest::try_from(digest.to_vec())?);
        self.ctx
            .execute_with_nullauth_session(|ctx| ctx.pcr_extend(handle, values))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::pcr::parse_pcr_selection_list;

    #[test]
    fn empty_selection_is_rejected() {
        assert!(matches!(
            tss_selection(&PcrSelectionList::default()),
            Err(TpmError::EmptyPcrSelectionList)
        ));
    }

    #[test]
    fn slots_map_to_bits() -> eyre::Result<()> {
        assert_eq!(pcr_slot(7)?, PcrSlot::Slot7);
        assert!(matches!(pcr_slot(32), Err(TpmError::InvalidPcr(32))));
        tss_selection(&parse_pcr_selection_list("sha256:0,7+sha1:4")?)?;
        Ok(())
    }
}
