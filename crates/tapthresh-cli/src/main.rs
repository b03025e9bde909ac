//! tapthresh: derive a k-of-n Taproot policy address and size its spends.
//!
//! Fully offline. Keys come from the config file and/or the command line.
//!
//! # Usage
//!
//! ```bash
//! tapthresh --config tapthresh.toml
//! tapthresh --owner <HEX> --signer <HEX> --signer <HEX> --signer <HEX> -k 2 --leaves
//! tapthresh --config tapthresh.toml --validate
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use tapthresh::size::buffered;
use tapthresh::{MultiSigPolicy, Scheme, Settings, SizeEstimator};

const DEFAULT_CONFIG: &str = "tapthresh.toml";

fn main() -> Result<()> {
    // Parse CLI args
    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut owner: Option<String> = None;
    let mut signers: Vec<String> = Vec::new();
    let mut threshold: Option<usize> = None;
    let mut scheme: Option<Scheme> = None;
    let mut network: Option<String> = None;
    let mut show_leaves = false;
    let mut validate_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => config_path = Some(PathBuf::from(value_of(&args, &mut i)?)),
            "--owner" => owner = Some(value_of(&args, &mut i)?),
            "--signer" | "-s" => signers.push(value_of(&args, &mut i)?),
            "--threshold" | "-k" => {
                let v = value_of(&args, &mut i)?;
                threshold = Some(v.parse().with_context(|| format!("invalid threshold: {}", v))?);
            }
            "--scheme" => {
                let v = value_of(&args, &mut i)?;
                scheme = Some(v.parse().with_context(|| format!("invalid scheme: {}", v))?);
            }
            "--network" | "-n" => network = Some(value_of(&args, &mut i)?),
            "--leaves" => show_leaves = true,
            "--validate" => validate_only = true,
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("tapthresh {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other => anyhow::bail!("Unknown argument: {}", other),
        }
        i += 1;
    }

    // Load config: an explicit path must exist, the default one may not
    let mut settings = match config_path {
        Some(path) => Settings::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).exists() => {
            Settings::from_file(Path::new(DEFAULT_CONFIG))
                .with_context(|| format!("Failed to load config from {}", DEFAULT_CONFIG))?
        }
        None => Settings::default(),
    };

    settings.apply_env_overrides();

    if let Some(owner) = owner {
        settings.policy.owner = Some(owner);
    }
    if !signers.is_empty() {
        settings.policy.signers = signers;
    }
    if threshold.is_some() {
        settings.policy.threshold = threshold;
    }
    if let Some(scheme) = scheme {
        settings.policy.scheme = scheme;
    }
    if let Some(network) = network {
        settings.policy.network = network;
    }

    settings.validate().context("Configuration validation failed")?;

    // Init logger
    env_logger::Builder::new()
        .parse_filters(&settings.logging.level)
        .init();
    log::debug!("settings: {:?}", settings);

    if validate_only {
        println!("Configuration is valid.");
        println!("  Network:          {}", settings.policy.network);
        println!("  Scheme:           {}", settings.policy.scheme);
        println!("  Signers:          {}", settings.policy.signers.len());
        println!("  Max combinations: {}", settings.policy.max_combinations);
        println!("  Session timeout:  {} secs", settings.signing.session_timeout_secs);
        println!("  Fee rate:         {} sat/vB", settings.fees.fee_rate_sat_vb);
        println!("  Fee buffer:       {}%", settings.fees.buffer_percent);
        return Ok(());
    }

    let policy = settings.build_policy().context("Failed to build policy")?;
    report(&policy, &settings, show_leaves)
}

fn value_of(args: &[String], i: &mut usize) -> Result<String> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .cloned()
        .with_context(|| format!("{} requires a value", flag))
}

fn report(policy: &MultiSigPolicy, settings: &Settings, show_leaves: bool) -> Result<()> {
    let template = template_spend(policy);
    let estimate = SizeEstimator::new(policy)
        .estimate(&template, 0)
        .context("Failed to estimate spend sizes")?;
    let fee_rate = settings.fee_rate()?;
    let pct = settings.fees.buffer_percent;

    println!("Address:    {}", policy.address());
    println!(
        "Policy:     {}-of-{} {} ({} leaves)",
        policy.threshold(),
        policy.signer_count(),
        policy.scheme(),
        policy.leaves().len()
    );
    println!("Owner key:  {}", policy.internal_key());
    if let Some(root) = policy.merkle_root() {
        println!("Merkle root: {}", root);
    }

    println!();
    println!(
        "1-in/1-out spend sizes at {} sat/vB (buffer {}%):",
        settings.fees.fee_rate_sat_vb, pct
    );
    let key_vsize = estimate.key_path.vsize();
    println!(
        "  key path:  {:>5} vB  fee {:>8} / {:>8} sat",
        key_vsize,
        fee_for(fee_rate, key_vsize)?,
        fee_for(fee_rate, buffered(key_vsize, pct)?)?
    );

    let min = estimate.leaves.iter().map(|s| s.vsize()).min().unwrap_or(0);
    let max = estimate.leaves.iter().map(|s| s.vsize()).max().unwrap_or(0);
    println!("  leaves:    {:>5} to {} vB", min, max);

    if show_leaves {
        for (leaf, size) in policy.leaves().iter().zip(&estimate.leaves) {
            println!(
                "  leaf {:>4}: {:>5} vB  signers {:?}",
                leaf.index,
                size.vsize(),
                leaf.combination.indices()
            );
        }
    }
    Ok(())
}

fn fee_for(rate: bitcoin::FeeRate, vsize: u64) -> Result<u64> {
    rate.fee_vb(vsize)
        .map(Amount::to_sat)
        .context("fee overflow")
}

/// One policy coin paid back to the policy address.
fn template_spend(policy: &MultiSigPolicy) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::all_zeros(),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: policy.script_pubkey(),
        }],
    }
}

fn print_help() {
    println!(
        r#"tapthresh - k-of-n Taproot threshold policies

USAGE:
    tapthresh [OPTIONS]

OPTIONS:
    -c, --config <PATH>      Config file path (default: ./tapthresh.toml if present)
        --owner <HEX>        Owner public key (key-path spender)
    -s, --signer <HEX>       Signer public key (repeat for each signer)
    -k, --threshold <N>      Required signers (default: all)
        --scheme <NAME>      threshold | musig2 (default: musig2)
    -n, --network <NAME>     bitcoin | testnet | signet | regtest
        --leaves             Print every leaf with its spend size
        --validate           Validate configuration and exit
    -h, --help               Show this help message
    -V, --version            Show version

ENVIRONMENT VARIABLES (override config file):
    TAPTHRESH_MAX_COMBINATIONS      Ceiling on C(n, k)
    TAPTHRESH_NETWORK               Bitcoin network
    TAPTHRESH_SESSION_TIMEOUT_SECS  Signing session idle timeout
    TAPTHRESH_BUFFER_PERCENT        Buffered fee margin (0-100)
    TAPTHRESH_FEE_RATE              Fee rate in sat/vB
    TAPTHRESH_LOG                   Log level (error/warn/info/debug/trace)
"#
    );
}
