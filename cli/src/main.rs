use anyhow::{Context, Result};
use artisign::{
    DigestAlgorithm, EngineConfig, Envconfig, FlagValue, Registry, SignRequest, VerifyOptions,
};
use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode};

#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = "Sign and verify structured-storage containers such as Windows Installer packages. \
                  Defaults come from ARTISIGN_* environment variables."
)]
struct Arguments {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct SignArgs {
    #[arg(short, long)]
    file: PathBuf,

    /// Write the signed container here instead of replacing the input.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Format name or alias; detected from the file when omitted.
    #[arg(long)]
    format: Option<String>,

    #[arg(short, long)]
    digest: Option<DigestAlgorithm>,

    /// PKCS#8 PEM Ed25519 key (overrides ARTISIGN_KEY).
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Certificate chain, .p7b or DER (overrides ARTISIGN_CHAIN).
    #[arg(short, long)]
    chain: Option<PathBuf>,

    /// Format specific flag, NAME or NAME=VALUE. Repeatable.
    #[arg(long = "flag", value_name = "NAME[=VALUE]")]
    flags: Vec<String>,

    #[arg(long)]
    no_timestamp: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign a container in place or into a new file.
    Sign(SignArgs),
    /// Verify the signatures embedded in a container.
    Verify {
        #[arg(short, long)]
        file: PathBuf,

        /// Only check the signature structure and certificate.
        #[arg(long)]
        no_digests: bool,
    },
    /// List the registered formats and their flags.
    Formats,
}

fn parse_flag(raw: &str) -> (String, Option<String>) {
    match raw.split_once('=') {
        Some((name, value)) => (name.to_owned(), Some(value.to_owned())),
        None => (raw.to_owned(), None),
    }
}

async fn sign(registry: &Registry, mut config: EngineConfig, args: SignArgs) -> Result<()> {
    let SignArgs {
        file,
        output,
        format,
        digest,
        key,
        chain,
        flags,
        no_timestamp,
    } = args;
    if let Some(digest) = digest {
        config.digest = digest;
    }
    config.key = key.or(config.key);
    config.chain = chain.or(config.chain);
    if no_timestamp {
        config.timestamp = false;
    }

    let mut request = SignRequest::new(file, config.signer()?, config.timestamper());
    request.output = output;
    request.format = format;
    request.digest = config.digest;
    request.flags = flags.iter().map(|f| parse_flag(f)).collect();
    request.pipeline = config.pipeline()?;

    let outcome = artisign::sign_file(registry, &request)
        .await
        .with_context(|| format!("failed to sign {}", request.path.display()))?;
    println!(
        "Signed {} ({}, {})",
        outcome.destination.display(),
        outcome.format,
        outcome.digest_algorithm
    );
    Ok(())
}

fn verify(registry: &Registry, file: PathBuf, no_digests: bool) -> Result<()> {
    let result = artisign::verify_file(registry, &file, &VerifyOptions { no_digests })
        .with_context(|| format!("verification of {} failed", file.display()))?;
    for record in &result.signatures {
        let signed_at = record
            .signature
            .signing_time()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "no timestamp".to_owned());
        println!(
            "{}: {} signature by '{}' ({signed_at})",
            result.format,
            record.hash,
            record.signature.subject()
        );
    }
    if no_digests {
        println!("Digests not checked.");
    }
    Ok(())
}

fn formats(registry: &Registry) {
    for descriptor in registry.descriptors() {
        let aliases = if descriptor.aliases.is_empty() {
            String::new()
        } else {
            format!(" (aliases: {})", descriptor.aliases.join(", "))
        };
        println!("{}{aliases}", descriptor.name);
        for spec in descriptor.flags.specs() {
            let default = match &spec.default {
                FlagValue::Bool(b) => b.to_string(),
                FlagValue::String(s) => format!("\"{s}\""),
            };
            println!("  --flag {:<20} {} [default: {default}]", spec.name, spec.help);
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    env_logger::init();
    let args = Arguments::parse();
    let config = EngineConfig::init_from_env().context("invalid ARTISIGN_* environment")?;
    let registry = Registry::with_builtin()?;

    match args.command {
        Command::Sign(args) => sign(&registry, config, args).await?,
        Command::Verify { file, no_digests } => {
            if let Err(err) = verify(&registry, file, no_digests) {
                log::debug!("{err:?}");
                eprintln!("{err:#}");
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Formats => formats(&registry),
    }
    log::info!("Done.");
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("no-extended-sig"), ("no-extended-sig".to_owned(), None));
        assert_eq!(
            parse_flag("description=a=b"),
            ("description".to_owned(), Some("a=b".to_owned()))
        );
    }

    #[test]
    fn test_sign_arguments() {
        let args = Arguments::try_parse_from([
            "artisign", "sign", "-f", "setup.msi", "-d", "sha384", "--flag", "no-extended-sig",
        ])
        .unwrap();
        let Command::Sign(sign) = args.command else {
            panic!("expected sign");
        };
        assert_eq!(sign.digest, Some(DigestAlgorithm::Sha384));
        assert_eq!(sign.flags, ["no-extended-sig"]);
    }
}
