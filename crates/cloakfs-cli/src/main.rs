//! cloakfs: administer encrypted directories
//!
//! Commands:
//!   init    - initialize a new encrypted directory
//!   passwd  - change the password of an existing directory
//!   info    - show the public config fields of a directory
//!
//! Mounting is handled by the filesystem bridge; this tool only manages
//! the on-disk configuration.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};
use tracing_subscriber::EnvFilter;

use cloakfs_core::{CfsError, CONF_NAME};
use cloakfs_crypto::config;
use cloakfs_crypto::kdf::DEFAULT_LOG_N;
use cloakfs_fs::diriv;

/// Exit code when the password does not unlock the filesystem. Scripts
/// key off this, keep it stable.
const EXIT_PASSWORD: u8 = 12;

const CREATOR: &str = concat!("cloakfs ", env!("CARGO_PKG_VERSION"));

#[derive(Parser, Debug)]
#[command(name = "cloakfs", version, about = "Encrypted overlay filesystem")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize DIR as a new encrypted directory
    Init {
        /// The directory to initialize (must exist and be empty)
        dir: PathBuf,
        /// Do not encrypt file names
        #[arg(long)]
        plaintext_names: bool,
        /// scrypt cost exponent for the password hash
        #[arg(long, default_value_t = DEFAULT_LOG_N)]
        scrypt_logn: u8,
    },

    /// Change the password of an encrypted directory
    Passwd {
        dir: PathBuf,
        /// scrypt cost exponent for the new password hash
        #[arg(long, default_value_t = DEFAULT_LOG_N)]
        scrypt_logn: u8,
    },

    /// Show the public configuration of an encrypted directory
    Info { dir: PathBuf },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Init {
            dir,
            plaintext_names,
            scrypt_logn,
        } => cmd_init(&dir, plaintext_names, scrypt_logn),
        Commands::Passwd { dir, scrypt_logn } => cmd_passwd(&dir, scrypt_logn),
        Commands::Info { dir } => cmd_info(&dir),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("cloakfs: {err:#}");
            if err
                .downcast_ref::<CfsError>()
                .is_some_and(|e| matches!(e, CfsError::PasswordIncorrect))
            {
                ExitCode::from(EXIT_PASSWORD)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn cmd_init(dir: &PathBuf, plaintext_names: bool, scrypt_logn: u8) -> Result<()> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    if std::fs::read_dir(dir)?.next().is_some() {
        bail!("{} is not empty", dir.display());
    }

    let password = read_password_twice()?;
    config::create(
        &dir.join(CONF_NAME),
        &password,
        plaintext_names,
        scrypt_logn,
        CREATOR,
    )
    .context("creating config")?;

    if !plaintext_names {
        diriv::create_in(dir).context("creating root directory IV")?;
    }

    println!("Filesystem created in {}.", dir.display());
    Ok(())
}

fn cmd_passwd(dir: &PathBuf, scrypt_logn: u8) -> Result<()> {
    let conf = dir.join(CONF_NAME);
    let old = SecretString::from(rpassword::prompt_password("Current password: ")?);
    let new = {
        let p1 = SecretString::from(rpassword::prompt_password("New password: ")?);
        let p2 = SecretString::from(rpassword::prompt_password("Repeat: ")?);
        if p1.expose_secret() != p2.expose_secret() {
            bail!("passwords do not match");
        }
        p1
    };

    config::change_password(&conf, &old, &new, scrypt_logn)?;
    println!("Password changed.");
    Ok(())
}

fn cmd_info(dir: &PathBuf) -> Result<()> {
    let cf = config::load_public(&dir.join(CONF_NAME))?;
    println!("Creator:      {}", cf.creator);
    println!("Version:      {}", cf.version);
    println!("FeatureFlags: {}", cf.flag_names().join(", "));
    println!(
        "Scrypt:       N={} r={} p={}",
        cf.scrypt.n, cf.scrypt.r, cf.scrypt.p
    );
    Ok(())
}

/// Prompt twice and hand back the passphrase wrapped; it is only ever
/// exposed again at the scrypt call.
fn read_password_twice() -> Result<SecretString> {
    let p1 = SecretString::from(rpassword::prompt_password("Password: ")?);
    let p2 = SecretString::from(rpassword::prompt_password("Repeat: ")?);
    if p1.expose_secret() != p2.expose_secret() {
        bail!("passwords do not match");
    }
    if p1.expose_secret().is_empty() {
        bail!("password is empty");
    }
    Ok(p1)
}
