mod common;

use common::*;
use eyre::Result;

use tpm_secboot::digest::HashAlgorithm;
use tpm_secboot::pin::change_pin;
use tpm_secboot::policy::{DynamicPolicyData, StaticPolicyData};
use tpm_secboot::revocation::{increment_counter, set_lock};
use tpm_secboot::seal::{unseal, update_dynamic_policy, IndexHandles};
use tpm_secboot::{Error, ErrorKind, SoftTpm};

fn unsealed(tpm: &mut SoftTpm, sealed: &Sealed, pin: &[u8]) -> tpm_secboot::Result<Vec<u8>> {
    let mut session = unseal(tpm, &sealed.static_data, &sealed.dynamic, pin)?;
    session.unseal(&sealed.object)
}

#[test]
fn releases_the_secret_on_an_authorized_boot() -> Result<()> {
    let mut tpm = SoftTpm::with_seed(1);
    boot(&mut tpm, "B1")?;
    let sealed = seal(&mut tpm, &profile(&["B1", "B2"])?)?;

    assert_eq!(unsealed(&mut tpm, &sealed, PIN)?, SECRET);
    boot(&mut tpm, "B2")?;
    assert_eq!(unsealed(&mut tpm, &sealed, PIN)?, SECRET);
    assert_eq!(tpm.active_sessions(), 0);
    Ok(())
}

#[test]
fn unknown_boot_path_matches_no_branch() -> Result<()> {
    let mut tpm = SoftTpm::with_seed(2);
    boot(&mut tpm, "B1")?;
    let sealed = seal(&mut tpm, &profile(&["B1", "B2"])?)?;

    boot(&mut tpm, "B3")?;
    let err = unsealed(&mut tpm, &sealed, PIN).unwrap_err();
    assert!(matches!(err, Error::NoMatchingBranch), "{err}");
    assert_eq!(err.kind(), ErrorKind::PolicyMismatch);
    assert_eq!(tpm.active_sessions(), 0);
    Ok(())
}

#[test]
fn records_survive_serialization() -> Result<()> {
    let mut tpm = SoftTpm::with_seed(3);
    boot(&mut tpm, "B2")?;
    let mut sealed = seal(&mut tpm, &profile(&["B1", "B2"])?)?;

    sealed.static_data = StaticPolicyData::from_bytes(&sealed.static_data.to_bytes()?)?;
    sealed.dynamic = DynamicPolicyData::from_bytes(&sealed.dynamic.to_bytes()?)?;
    assert_eq!(unsealed(&mut tpm, &sealed, PIN)?, SECRET);

    let mut truncated = sealed.dynamic.to_bytes()?;
    truncated.pop();
    assert!(DynamicPolicyData::from_bytes(&truncated).is_err());
    Ok(())
}

#[test]
fn revoked_policy_is_refused() -> Result<()> {
    let mut tpm = SoftTpm::with_seed(4);
    boot(&mut tpm, "B1")?;
    let sealed = seal(&mut tpm, &profile(&["B1"])?)?;

    let current = increment_counter(&mut tpm, sealed.dynamic.counter_index)?;
    match unsealed(&mut tpm, &sealed, PIN) {
        Err(Error::RevokedPolicy {
            policy_epoch,
            current: seen,
        }) => {
            assert_eq!(policy_epoch, sealed.dynamic.epoch);
            assert_eq!(seen, current);
        }
        other => panic!("expected a revoked policy, got {other:?}"),
    }
    Ok(())
}

#[test]
fn updated_policy_replaces_a_revoked_one() -> Result<()> {
    let mut tpm = SoftTpm::with_seed(5);
    boot(&mut tpm, "B1")?;
    let sealed = seal(&mut tpm, &profile(&["B1"])?)?;

    let epoch = increment_counter(&mut tpm, sealed.dynamic.counter_index)?;
    let key = auth_key();
    let mut params = sealed
        .provisioned
        .dynamic_params(&key, profile(&["B1", "B3"])?.compute_pcr_values());
    params.epoch = epoch;
    let dynamic = update_dynamic_policy(ALG, &sealed.static_data, &params)?;
    let updated = Sealed { dynamic, ..sealed };

    boot(&mut tpm, "B3")?;
    assert_eq!(unsealed(&mut tpm, &updated, PIN)?, SECRET);
    Ok(())
}

#[test]
fn tampered_dynamic_policy_is_refused() -> Result<()> {
    let mut tpm = SoftTpm::with_seed(6);
    boot(&mut tpm, "B1")?;
    let mut sealed = seal(&mut tpm, &profile(&["B1", "B2"])?)?;

    // an extra branch that was never signed
    sealed
        .dynamic
        .branch_digests
        .push(ALG.hash(&[b"not authorized"]));
    assert!(matches!(
        unsealed(&mut tpm, &sealed, PIN),
        Err(Error::InvalidSignature)
    ));

    sealed.dynamic.branch_digests.pop();
    sealed.dynamic.signature.bytes[0] ^= 0x80;
    assert!(matches!(
        unsealed(&mut tpm, &sealed, PIN),
        Err(Error::InvalidSignature)
    ));
    assert_eq!(tpm.active_sessions(), 0);
    Ok(())
}

#[test]
fn flipped_branch_byte_is_refused() -> Result<()> {
    let mut tpm = SoftTpm::with_seed(12);
    boot(&mut tpm, "B1")?;
    let mut sealed = seal(&mut tpm, &profile(&["B1", "B2"])?)?;

    // the live boot still matches branch 0, only branch 1 changed
    sealed.dynamic.branch_digests[1][0] ^= 1;
    let err = unsealed(&mut tpm, &sealed, PIN).unwrap_err();
    assert!(matches!(err, Error::InvalidSignature), "{err}");
    assert_eq!(tpm.active_sessions(), 0);

    sealed.dynamic.branch_digests[1][0] ^= 1;
    assert_eq!(unsealed(&mut tpm, &sealed, PIN)?, SECRET);
    Ok(())
}

#[test]
fn wrong_pin_is_refused() -> Result<()> {
    let mut tpm = SoftTpm::with_seed(7);
    boot(&mut tpm, "B1")?;
    let sealed = seal(&mut tpm, &profile(&["B1"])?)?;

    assert!(matches!(
        unsealed(&mut tpm, &sealed, b"1357"),
        Err(Error::InvalidPin)
    ));
    assert_eq!(unsealed(&mut tpm, &sealed, PIN)?, SECRET);
    Ok(())
}

#[test]
fn pin_change_keeps_the_policy_valid() -> Result<()> {
    let mut tpm = SoftTpm::with_seed(8);
    boot(&mut tpm, "B1")?;
    let sealed = seal(&mut tpm, &profile(&["B1"])?)?;

    change_pin(
        &mut tpm,
        &sealed.static_data.pin_index,
        &sealed.static_data.pin_index_auth_policies,
        PIN,
        b"8642",
    )?;
    assert_eq!(unsealed(&mut tpm, &sealed, b"8642")?, SECRET);
    assert!(matches!(
        unsealed(&mut tpm, &sealed, PIN),
        Err(Error::InvalidPin)
    ));
    Ok(())
}

#[test]
fn lockout_persists_across_resets() -> Result<()> {
    let mut tpm = SoftTpm::with_seed(9);
    boot(&mut tpm, "B1")?;
    let sealed = seal(&mut tpm, &profile(&["B1"])?)?;

    set_lock(&mut tpm, IndexHandles::default().lock)?;
    boot(&mut tpm, "B1")?;
    let err = unsealed(&mut tpm, &sealed, PIN).unwrap_err();
    assert!(matches!(err, Error::LockoutEngaged));
    assert_eq!(err.kind(), ErrorKind::Fatal);
    Ok(())
}

#[test]
fn many_branches_chain_or_assertions() -> Result<()> {
    let events: Vec<String> = (0..20).map(|i| format!("kernel-{i}")).collect();
    let names: Vec<&str> = events.iter().map(String::as_str).collect();

    let mut tpm = SoftTpm::with_seed(10);
    boot(&mut tpm, names[0])?;
    let sealed = seal(&mut tpm, &profile(&names)?)?;
    assert_eq!(sealed.dynamic.branch_digests.len(), 20);

    for name in [names[0], names[8], names[13], names[19]] {
        boot(&mut tpm, name)?;
        assert_eq!(unsealed(&mut tpm, &sealed, PIN)?, SECRET);
    }
    boot(&mut tpm, "kernel-20")?;
    assert!(matches!(
        unsealed(&mut tpm, &sealed, PIN),
        Err(Error::NoMatchingBranch)
    ));
    Ok(())
}

#[test]
fn cleared_tpm_cannot_unseal() -> Result<()> {
    let mut tpm = SoftTpm::with_seed(11);
    boot(&mut tpm, "B1")?;
    let sealed = seal(&mut tpm, &profile(&["B1"])?)?;

    tpm.clear();
    let err = unsealed(&mut tpm, &sealed, PIN).unwrap_err();
    assert!(matches!(err, Error::InvalidIndexPublic(_)), "{err}");
    assert_eq!(err.kind(), ErrorKind::Configuration);

    // the new lock index gets a new name
    tpm_secboot::provision(&mut tpm, &IndexHandles::default(), PIN)?;
    assert!(matches!(
        unsealed(&mut tpm, &sealed, PIN),
        Err(Error::InvalidIndexPublic(_))
    ));
    Ok(())
}

#[test]
fn sha384_signing_key_unseals() -> Result<()> {
    let mut tpm = SoftTpm::with_seed(13);
    boot(&mut tpm, "B1")?;
    let key = signing_key(HashAlgorithm::Sha384);
    let sealed = seal_with_key(&mut tpm, &profile(&["B1", "B2"])?, &key)?;
    assert_eq!(sealed.static_data.auth_public.name_alg(), HashAlgorithm::Sha384);

    assert_eq!(unsealed(&mut tpm, &sealed, PIN)?, SECRET);
    boot(&mut tpm, "B2")?;
    assert_eq!(unsealed(&mut tpm, &sealed, PIN)?, SECRET);
    assert_eq!(tpm.active_sessions(), 0);
    Ok(())
}
