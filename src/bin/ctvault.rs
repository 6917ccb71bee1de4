//! Catalogue-plane command line client.
//!
//! Drives the remote catalogue operations: pushing and fetching ctfiles,
//! listing and deleting them, culling unreferenced chunks, and keeping
//! the crypto secrets file in sync. The data plane (chunking trees) is a
//! separate concern and not wired up here.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use clap::{Parser, Subcommand};
use log::LevelFilter;

use ctvault::config::Config;
use ctvault::ctfile::MatchMode;
use ctvault::engine::{Engine, SecretsCrypto};
use ctvault::tools;

#[derive(Parser)]
#[command(name = "ctvault", version, about = "Content-addressed backup client")]
struct Cli {
    /// Configuration file
    #[arg(short = 'F', long)]
    config: Option<PathBuf>,

    /// Increase verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload an existing catalogue file under a tag
    Push { ctfile: PathBuf, tag: String },
    /// Download a backup's catalogue chain into the cache
    Fetch { tag: String },
    /// List remote catalogue files
    List {
        /// Patterns to match (all files when omitted)
        patterns: Vec<String>,
        /// Treat patterns as regular expressions instead of globs
        #[arg(short, long)]
        regex: bool,
        /// Machine readable output
        #[arg(long)]
        json: bool,
    },
    /// Delete a remote catalogue file by its full dated name
    Delete { name: String },
    /// Reclaim unreferenced chunks on the server
    Cull,
    /// Synchronize the crypto secrets file with the server
    SyncSecrets,
}

/// Passphrase-protected keyfile, AES-256-GCM over a PBKDF2-derived key.
struct KeyfileCrypto;

const KEYFILE_MAGIC: &[u8; 8] = b"ctvsecr1";
const KDF_ROUNDS: usize = 100_000;

impl KeyfileCrypto {
    fn derive(passphrase: &str, salt: &[u8]) -> Result<[u8; 32], Error> {
        let mut key = [0u8; 32];
        openssl::pkcs5::pbkdf2_hmac(
            passphrase.as_bytes(),
            salt,
            KDF_ROUNDS,
            openssl::hash::MessageDigest::sha256(),
            &mut key,
        )
        .map_err(|err| format_err!("key derivation failed - {}", err))?;
        Ok(key)
    }
}

impl SecretsCrypto for KeyfileCrypto {
    fn unlock(&mut self, path: &Path, passphrase: &str) -> Result<(), Error> {
        let raw = std::fs::read(path)
            .map_err(|err| format_err!("unable to read {:?} - {}", path, err))?;
        if raw.len() < 8 + 16 + 12 + 16 || &raw[..8] != KEYFILE_MAGIC {
            bail!("{:?} is not a secrets file", path);
        }
        let salt = &raw[8..24];
        let iv = &raw[24..36];
        let tag = &raw[36..52];
        let ciphertext = &raw[52..];

        let key = Self::derive(passphrase, salt)?;
        openssl::symm::decrypt_aead(
            openssl::symm::Cipher::aes_256_gcm(),
            &key,
            Some(iv),
            &[],
            ciphertext,
            tag,
        )
        .map_err(|_| format_err!("wrong passphrase for {:?}", path))?;
        Ok(())
    }

    fn create(&mut self, path: &Path, passphrase: &str) -> Result<(), Error> {
        let mut salt = [0u8; 16];
        let mut iv = [0u8; 12];
        let mut keys = [0u8; 64];
        openssl::rand::rand_bytes(&mut salt)?;
        openssl::rand::rand_bytes(&mut iv)?;
        openssl::rand::rand_bytes(&mut keys)?;

        let key = Self::derive(passphrase, &salt)?;
        let mut tag = [0u8; 16];
        let ciphertext = openssl::symm::encrypt_aead(
            openssl::symm::Cipher::aes_256_gcm(),
            &key,
            Some(&iv),
            &[],
            &keys,
            &mut tag,
        )
        .map_err(|err| format_err!("unable to seal secrets file - {}", err))?;

        let mut raw = Vec::with_capacity(52 + ciphertext.len());
        raw.extend_from_slice(KEYFILE_MAGIC);
        raw.extend_from_slice(&salt);
        raw.extend_from_slice(&iv);
        raw.extend_from_slice(&tag);
        raw.extend_from_slice(&ciphertext);

        let mode = nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR;
        tools::replace_file(path, &raw, Some(mode))
    }
}

async fn connect(config: &Config) -> Result<tokio::net::TcpStream, Error> {
    let host = config
        .host
        .as_deref()
        .ok_or_else(|| format_err!("no host configured"))?;
    let port = config.hostport.as_deref().unwrap_or("4433");
    let stream = tokio::net::TcpStream::connect((host, port.parse::<u16>()?))
        .await
        .map_err(|err| format_err!("unable to connect to {}:{} - {}", host, port, err))?;
    Ok(stream)
}

async fn run(cli: Cli) -> Result<(), Error> {
    let (config, path) = Config::load(cli.config.as_deref())?;
    log::debug!("using configuration {:?}", path);

    let transport = connect(&config).await?;
    let mut engine =
        Engine::new(transport, config)?.with_secrets(Box::new(KeyfileCrypto));

    let mut print_list = false;
    let mut print_json = false;

    match cli.command {
        Command::Push { ctfile, tag } => engine.queue_ctfile_push(ctfile, &tag)?,
        Command::Fetch { tag } => engine.queue_fetch(&tag)?,
        Command::List {
            patterns,
            regex,
            json,
        } => {
            let mode = if regex {
                MatchMode::Regex
            } else {
                MatchMode::Glob
            };
            print_list = true;
            print_json = json;
            engine.queue_ctfile_list(patterns, mode)?;
        }
        Command::Delete { name } => engine.queue_ctfile_delete(&name)?,
        Command::Cull => engine.queue_cull()?,
        Command::SyncSecrets => engine.queue_secrets_sync()?,
    }

    engine.run().await?;

    if print_list {
        let results = engine.take_list_results();
        if print_json {
            println!("{}", serde_json::to_string_pretty(&results)?);
        } else {
            for entry in results {
                println!("{:>12}  {}", entry.size, entry.name);
            }
        }
    }
    if let Some(path) = engine.fetched() {
        println!("{}", path.display());
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let level = match cli.debug {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    if let Err(err) = run(cli).await {
        eprintln!("ctvault: {}", err);
        std::process::exit(1);
    }
}
