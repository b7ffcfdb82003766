use crate::config::Config;
use crate::policy::dynamic_policy::pcr_branch_digest;
use crate::policy::OrTree;
use crate::tpm::pcr::parse_pcr_selection_list;
use crate::tpm::types::PcrSelectionList;
use clap::{Parser, Subcommand};
use eyre::{eyre, Result};
use std::env;
use std::path::PathBuf;

const TPM_ENV_VAR: &str = "TCTI";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// PCRs to read for `digest`
    #[arg(short, long, value_name = "PCR List", default_value = "sha256:0,2,4,7", value_parser = parse_pcr_selection_list)]
    pcrs: PcrSelectionList,

    /// TPM device specified in TCTI format
    #[arg(short = 'T', long, default_value = "device:/dev/tpmrm0", env = TPM_ENV_VAR)]
    tcti: String,

    /// Profile configuration (YAML)
    #[arg(short, long, value_name = "FILE", env = "TPM_SECBOOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every PCR state the configured profile allows, per bank
    Resolve,
    /// Show the PolicyPCR digest of each allowed state and the PolicyOR tree over them
    Branches,
    /// Show PCR values and their composite digest for the running system
    Digest,
}

impl Cli {
    pub fn new() -> Self {
        let cli = Cli::parse();
        env::set_var(TPM_ENV_VAR, &cli.tcti);
        cli
    }

    pub fn run(&self) -> Result<&Self> {
        log::debug!("{self:?}");
        match &self.command {
            Commands::Resolve => self.show_resolved()?,
            Commands::Branches => self.show_branches()?,
            Commands::Digest => self.show_pcr_digest()?,
        };
        Ok(self)
    }

    fn config(&self) -> Result<Config> {
        let path = self
            .config
            .as_ref()
            .ok_or_else(|| eyre!("this command needs a profile, pass --config"))?;
        Ok(Config::load(path)?)
    }

    fn show_resolved(&self) -> Result<()> {
        let profile = self.config()?.profile()?;
        for bank in profile.banks() {
            let resolved = profile.resolve(bank);
            println!("{bank}: {} state(s) over PCRs {:?}", resolved.len(), resolved.indices);
            for (i, branch) in resolved.branches.iter().enumerate() {
                println!("  [{i}]");
                for (index, value) in branch {
                    println!("    {index:>2}: {}", hex::encode(value));
                }
            }
        }
        Ok(())
    }

    fn show_branches(&self) -> Result<()> {
        let config = self.config()?;
        let values = config.profile()?.compute_pcr_values();
        let selection = values
            .first()
            .map(PcrSelectionList::from_values)
            .ok_or_else(|| eyre!("profile extends no PCRs"))?;
        let digests = values
            .iter()
            .map(|v| pcr_branch_digest(config.alg, &selection, v))
            .collect::<Result<Vec<_>, _>>()?;
        println!("selection: {selection}");
        for (i, digest) in digests.iter().enumerate() {
            println!("  [{i}] {}", hex::encode(digest));
        }
        let tree = OrTree::build(config.alg, &digests).ok_or_else(|| eyre!("no branches"))?;
        println!("PolicyOR root ({} level(s)): {}", tree.depth(), hex::encode(tree.root()));
        Ok(())
    }

    #[cfg(feature = "tss")]
    fn show_pcr_digest(&self) -> Result<()> {
        use crate::digest::{pcr_composite_digest, HashAlgorithm};
        use crate::tpm::tss::TssPcrs;
        use crate::tpm::PcrBanks;

        let (tcti, alg) = match &self.config {
            Some(_) => {
                let config = self.config()?;
                (config.tcti.unwrap_or_else(|| self.tcti.clone()), config.alg)
            }
            None => (self.tcti.clone(), HashAlgorithm::Sha256),
        };
        let mut tpm = TssPcrs::new(&tcti)?;
        let values = tpm.pcr_read(&self.pcrs)?;
        for (bank, index) in self.pcrs.slots() {
            if let Some(value) = values.get(&bank).and_then(|b| b.get(&index)) {
                println!("{bank}:{index:>2} {}", hex::encode(value));
            }
        }
        let ordered = self
            .pcrs
            .ordered_values(&values)
            .ok_or_else(|| eyre!("TPM did not return every selected PCR"))?;
        println!("Current PCR Digest: {}", hex::encode(pcr_composite_digest(alg, ordered)));
        Ok(())
    }

    #[cfg(not(feature = "tss"))]
    fn show_pcr_digest(&self) -> Result<()> {
        Err(eyre!(
            "reading {} needs a TPM at {}, rebuild with `--features tss`",
            self.pcrs,
            self.tcti
        ))
    }
}
