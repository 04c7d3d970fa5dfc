use std::{
    borrow::Cow,
    fs::File,
    path::{Path, PathBuf},
};

use airsign_core::{
    address::SingleSigScriptType,
    anyhow::{self, Context},
    bitcoin::Network,
    config::{parse_network, EngineConfig},
    custom_logger, get_secp, log, rand,
};
use clap::{Args, Parser, Subcommand};
use path_absolutize::Absolutize;

mod commands;

#[derive(Parser)]
#[command(
    name = "airsign",
    about = "Offline signer for single-sig and multisig PSBTs",
    version
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct GlobalArgs {
    /// JSON file with network, gap_limit and log_filter
    #[arg(long, env = "AIRSIGN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// bitcoin, testnet, signet or regtest
    #[arg(long, env = "AIRSIGN_NETWORK", global = true, value_parser = parse_network)]
    network: Option<Network>,

    /// Addresses scanned per branch when an input has no derivation data
    #[arg(long, env = "AIRSIGN_GAP_LIMIT", global = true)]
    gap_limit: Option<u32>,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Show fingerprint, account xpub and first address of a seed
    Keys(KeysArgs),
    /// Derive addresses from an account xpub, or find where one belongs
    Address(AddressArgs),
    /// Print the receive/change descriptor of a seed
    Descriptor(SeedArgs),
    /// Parse a multisig descriptor or BSMS record
    ImportMultisig(ImportMultisigArgs),
    /// Summarize a PSBT before signing
    Inspect(InspectArgs),
    /// Sign a PSBT with a single-sig seed
    Sign(SignArgs),
    /// Sign a PSBT with every local cosigner of a multisig wallet
    SignMultisig(SignMultisigArgs),
    /// Finalize a fully signed PSBT into a raw transaction
    Finalize(FinalizeArgs),
}

#[derive(Args, Debug, Clone)]
pub(crate) struct SeedArgs {
    /// File with a mnemonic or a hex encoded seed
    #[arg(long)]
    pub(crate) seed_file: PathBuf,

    /// File with the BIP39 passphrase, ignored for hex seeds
    #[arg(long)]
    pub(crate) passphrase_file: Option<PathBuf>,

    #[arg(long, default_value_t = SingleSigScriptType::NativeSegwit)]
    pub(crate) script_type: SingleSigScriptType,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct KeysArgs {
    #[command(flatten)]
    pub(crate) seed: SeedArgs,

    /// Account path, defaults to the standard path of the script type
    #[arg(long)]
    pub(crate) path: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct AddressArgs {
    /// Account xpub, SLIP-132 prefixes are accepted
    #[arg(long)]
    pub(crate) xpub: String,

    #[arg(long, default_value_t = SingleSigScriptType::NativeSegwit)]
    pub(crate) script_type: SingleSigScriptType,

    #[arg(long, default_value_t = 0)]
    pub(crate) index: u32,

    #[arg(long, default_value_t = 1)]
    pub(crate) quantity: u32,

    #[arg(long)]
    pub(crate) change: bool,

    /// Look for this address within the gap limit instead of deriving
    #[arg(long)]
    pub(crate) find: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct ImportMultisigArgs {
    /// Descriptor or BSMS file
    #[arg(long)]
    pub(crate) descriptor_file: PathBuf,

    /// Seed files of the local cosigners
    #[arg(long = "seed-file", required = true)]
    pub(crate) seed_files: Vec<PathBuf>,

    #[arg(long, default_value_t = 3)]
    pub(crate) addresses: u32,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct InspectArgs {
    #[arg(long)]
    pub(crate) psbt_file: PathBuf,

    /// Seeds whose fingerprints mark outputs as change
    #[arg(long = "seed-file")]
    pub(crate) seed_files: Vec<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct SignArgs {
    #[arg(long)]
    pub(crate) psbt_file: PathBuf,

    #[command(flatten)]
    pub(crate) seed: SeedArgs,

    #[arg(long, default_value_t = 0)]
    pub(crate) account: u32,

    /// Defaults to the input name with a "_signed" suffix
    #[arg(long)]
    pub(crate) output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct SignMultisigArgs {
    #[arg(long)]
    pub(crate) psbt_file: PathBuf,

    #[arg(long)]
    pub(crate) descriptor_file: PathBuf,

    #[arg(long = "seed-file", required = true)]
    pub(crate) seed_files: Vec<PathBuf>,

    /// Defaults to the input name with a "_signed" suffix
    #[arg(long)]
    pub(crate) output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct FinalizeArgs {
    #[arg(long)]
    pub(crate) psbt_file: PathBuf,

    /// Write the transaction hex here instead of stdout
    #[arg(long)]
    pub(crate) output: Option<PathBuf>,
}

pub(crate) fn handle_input_path(p: &Path) -> anyhow::Result<Cow<Path>> {
    let p = p
        .absolutize()
        .with_context(|| format!("failure resolving {p:?}"))?;
    anyhow::ensure!(p.is_file(), "Input file {p:?} doesn't exist");
    Ok(p)
}

pub(crate) fn handle_output_path(p: &Path) -> anyhow::Result<Cow<Path>> {
    let p = p
        .absolutize()
        .with_context(|| format!("failure resolving {p:?}"))?;
    anyhow::ensure!(!p.exists(), "Output file {p:?} already exists, refusing to overwrite");
    Ok(p)
}

fn load_config(args: &GlobalArgs) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let path = handle_input_path(path)?;
            EngineConfig::from_reader(File::open(&path)?)
                .with_context(|| format!("failure reading config {path:?}"))?
        }
        None => EngineConfig::default(),
    };
    if let Some(network) = args.network {
        config.network = network;
    }
    if let Some(gap_limit) = args.gap_limit {
        config.gap_limit = gap_limit;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.global)?;
    custom_logger::try_init(&config.log_filter)?;
    log::debug!("Running with {config:?}");
    let secp = get_secp(&mut rand::thread_rng());
    let output = commands::run(&secp, &config, &cli.command)?;
    println!("{output}");
    Ok(())
}
