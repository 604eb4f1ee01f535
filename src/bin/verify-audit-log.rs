use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use std::path::Path;
use tracing::{error, info};

use audit_tree::audit::verify::{find_tampered_entries, ChainVerification};
use audit_tree::audit::{
    verify_chain, Check, HashChainEntry, IntegrityLevel, IntegrityReporter, JsonLogReader, LogSource,
    RootDigest, SourceError, VerificationResult,
};

fn main() -> Result<()> {
    let matches = Command::new("verify-audit-log")
        .version("0.1.0")
        .about("Verify the hash chain and root digest of a document audit log file")
        .arg(
            Arg::new("log-path")
                .short('l')
                .long("log-path")
                .value_name("PATH")
                .help("Path to audit log file")
                .required(true),
        )
        .arg(
            Arg::new("root-digest")
                .short('r')
                .long("root-digest")
                .value_name("HASH")
                .help("Expected root digest, overriding the one declared in the file"),
        )
        .arg(
            Arg::new("integrity-level")
                .short('i')
                .long("integrity-level")
                .value_name("LEVEL")
                .default_value("strict")
                .help("warn_only, hash_required or strict"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let log_path = matches
        .get_one::<String>("log-path")
        .ok_or_else(|| anyhow!("--log-path is required"))?;
    let expected_root = matches.get_one::<String>("root-digest").cloned();
    let level: IntegrityLevel = matches
        .get_one::<String>("integrity-level")
        .map(String::as_str)
        .unwrap_or("strict")
        .parse()?;
    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    let max_level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(max_level).init();

    match verify_audit_log_file(Path::new(log_path), expected_root, level, verbose) {
        Ok(result) if result.is_valid() => {
            if !quiet {
                println!("{}", result.summary());
            }
            Ok(())
        }
        Ok(result) => {
            error!("{}", result.summary());
            std::process::exit(1);
        }
        Err(e) => {
            error!("Audit log verification failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn verify_audit_log_file(
    log_path: &Path,
    expected_root: Option<String>,
    level: IntegrityLevel,
    verbose: bool,
) -> Result<VerificationResult> {
    info!("Verifying audit log: {}", log_path.display());

    if !log_path.exists() {
        return Err(anyhow!("Audit log file not found: {}", log_path.display()));
    }

    let mut reader = JsonLogReader::open(log_path)?;
    let mut reporter = IntegrityReporter::new(level);
    let mut digest = RootDigest::new();
    let mut entries: Vec<HashChainEntry> = Vec::new();
    let mut malformed = 0;

    while let Some(next) = reader.next_entry() {
        match next {
            Ok(entry) => {
                digest.update(&entry.entry_hash);
                entries.push(entry);
            }
            Err(SourceError::Malformed(reason)) => {
                malformed += 1;
                reporter.report(Check::MalformedEntry, reason)?;
            }
            Err(SourceError::Stream(e)) => return Err(e.into()),
        }
    }

    if verbose {
        println!("Loaded {} audit log entries ({} malformed)", entries.len(), malformed);
    }

    entries.reverse();
    let chain: ChainVerification = verify_chain(&mut entries, &mut reporter)?;

    if verbose {
        for index in find_tampered_entries(&entries) {
            println!("✗ Tampered entry: {}", entries[index].summary());
        }
        if let (Some(first), Some(last)) = (entries.first(), entries.last()) {
            println!("\nAudit Log Summary:");
            println!("  Total entries: {}", entries.len());
            println!("  First entry: {}", first.create_timestamp);
            println!("  Last entry: {}", last.create_timestamp);
            println!("  Head hash: {}", last.entry_hash);
            println!("  Root digest: {}", digest.clone().finalize());
        }
    }

    let declared = expected_root.or_else(|| reader.declared_root_digest().map(str::to_string));
    let result = VerificationResult::from_chain(&chain, digest.finalize(), declared);
    result.report_root_digest(&mut reporter)?;
    Ok(result)
}
