//! PCR selection strings, `bank:index,...` joined by `+` for more banks:
//! `sha256:0,7+sha1:4`.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use super::types::{PcrSelection, PcrSelectionList, MAX_PCR_INDEX};
use crate::digest::HashAlgorithm;

#[derive(Error, Debug, PartialEq)]
pub enum PcrError {
    #[error("empty PCR selection list, expected at least one selection")]
    EmptyPcrSelectionList,
    #[error("invalid PCR selection list specification `{0}`")]
    InvalidPcrSelectionString(String),
    #[error("invalid PCR bank `{0}`")]
    InvalidPcrBank(String),
    #[error("invalid PCR slot `{0}`")]
    InvalidPcrSlot(String),
    #[error("PCR bank `{0}` selected more than once")]
    DuplicatePcrBank(HashAlgorithm),
}

pub type Result<T, E = PcrError> = core::result::Result<T, E>;

fn parse_pcr_bank(bank: &str) -> Result<HashAlgorithm> {
    bank.parse()
        .map_err(|_| PcrError::InvalidPcrBank(bank.to_string()))
}

fn parse_slot(slot: &str) -> Result<u32> {
    slot.parse::<u32>()
        .ok()
        .filter(|index| *index <= MAX_PCR_INDEX)
        .ok_or_else(|| PcrError::InvalidPcrSlot(slot.to_string()))
}

fn parse_slots(slots: &str) -> Result<BTreeSet<u32>> {
    slots.split(',').map(parse_slot).collect()
}

fn parse_pcr_selection(expression: &str) -> Result<PcrSelection> {
    let (bank, slots) = expression
        .split_once(':')
        .ok_or_else(|| PcrError::InvalidPcrSelectionString(expression.to_owned()))?;
    Ok(PcrSelection {
        alg: parse_pcr_bank(bank)?,
        indices: parse_slots(slots)?,
    })
}

pub fn parse_pcr_selection_list(expression: &str) -> Result<PcrSelectionList> {
    if expression.is_empty() {
        return Err(PcrError::EmptyPcrSelectionList);
    }
    let mut banks = BTreeSet::new();
    let selections = expression
        .split('+')
        .map(|selection| {
            let selection = parse_pcr_selection(selection)?;
            if !banks.insert(selection.alg) {
                return Err(PcrError::DuplicatePcrBank(selection.alg));
            }
            Ok(selection)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(PcrSelectionList::new(selections))
}

impl fmt::Display for PcrSelectionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, selection) in self.selections().iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            let indices: Vec<String> = selection.indices.iter().map(u32::to_string).collect();
            write!(f, "{}:{}", selection.alg, indices.join(","))?;
        }
        Ok(())
    }
}
