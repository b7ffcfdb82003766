//! Binds secrets to the verified boot state of a machine through TPM 2.0
//! authorization policies.
//!
//! A sealed object's policy is split in two. The static part is fixed at
//! seal time and names an authorization key, a PIN index and a lockout
//! index. The dynamic part lists every PCR state the owner approves plus a
//! revocation epoch, and is signed with the authorization key, so it can be
//! replaced whenever the boot chain changes without resealing.
//!
//! # Get Started
//!
//! ```bash
//! cargo run -- --config demos/profile.yaml resolve
//! ```
//!
//! Reading the live PCRs (`digest`) needs the `tss` feature and the tpm2-tss
//! libraries. The policy engine runs against any [`tpm::Tpm`], such as
//! [`SoftTpm`].

pub mod cli;
pub mod config;
pub mod digest;
pub mod error;
pub mod marshal;
pub mod pin;
pub mod policy;
pub mod profile;
pub mod revocation;
pub mod seal;
pub mod session;
pub mod tpm;

pub use error::{Error, ErrorKind, Result};
pub use seal::{provision, seal_policy, seal_secret, unseal, update_dynamic_policy, IndexHandles};
pub use tpm::soft::SoftTpm;
