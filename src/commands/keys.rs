use airsign_core::{
    anyhow,
    bitcoin::secp256k1::{All, Secp256k1},
    config::EngineConfig,
    engine::{
        derive_wallet_keys, find_address_index, generate_address_from_xpub,
        unified_descriptor_for_seed,
    },
    secrecy::ExposeSecret,
};

use super::{read_seed_hex, to_json};
use crate::{AddressArgs, KeysArgs, SeedArgs};

pub(crate) fn keys(
    secp: &Secp256k1<All>,
    config: &EngineConfig,
    args: &KeysArgs,
) -> anyhow::Result<String> {
    let seed_hex = read_seed_hex(&args.seed.seed_file, args.seed.passphrase_file.as_deref())?;
    let keys = derive_wallet_keys(
        secp,
        seed_hex.expose_secret(),
        args.path.as_deref(),
        args.seed.script_type,
        config.network,
    )?;
    to_json(&keys)
}

pub(crate) fn descriptor(
    secp: &Secp256k1<All>,
    config: &EngineConfig,
    args: &SeedArgs,
) -> anyhow::Result<String> {
    let seed_hex = read_seed_hex(&args.seed_file, args.passphrase_file.as_deref())?;
    Ok(unified_descriptor_for_seed(
        secp,
        seed_hex.expose_secret(),
        args.script_type,
        config.network,
    )?)
}

pub(crate) fn address(
    secp: &Secp256k1<All>,
    config: &EngineConfig,
    args: &AddressArgs,
) -> anyhow::Result<String> {
    if let Some(address) = &args.find {
        return match find_address_index(secp, &args.xpub, address, args.script_type, config)? {
            Some((is_change, index)) => {
                let branch = if is_change { "change" } else { "receive" };
                Ok(format!("{branch}/{index}"))
            }
            None => anyhow::bail!(
                "Address {address} not found in the first {} receive and change addresses",
                config.gap_limit
            ),
        };
    }
    let end = args
        .index
        .checked_add(args.quantity)
        .ok_or_else(|| anyhow::anyhow!("Address range overflows"))?;
    let lines = (args.index..end)
        .map(|i| {
            generate_address_from_xpub(
                secp,
                &args.xpub,
                i,
                args.change,
                args.script_type,
                config.network,
            )
            .map(|a| format!("{i}: {a}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines.join("\n"))
}
