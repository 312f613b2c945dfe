//! `diskctl`: package signed images, format encrypted volumes, and activate
//! either through device-mapper.

use anyhow::{bail, Context, Result};
use basalt_core::{keyfile, logging, BasaltConfig, DiskImageService, UnlockMethod};
use basalt_dm::SystemMapper;
use clap::{Parser, Subcommand};
use log::info;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "diskctl",
    version,
    about = "Create, inspect and activate basalt signed images and encrypted volumes."
)]
struct Cli {
    /// Path to the basalt configuration file (default: $BASALT_CONFIG or /etc/basalt.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Package a data file as a signed, integrity-protected image.
    Sign {
        /// Image label recorded in the header.
        name: String,
        /// Data type tag recorded in the header (e.g. `squashfs`).
        data_type: String,
        /// File holding the payload.
        data_file: PathBuf,
        /// Image file to create.
        image_file: PathBuf,
    },

    /// Format a volume as an encrypted volume and print its recovery key.
    Encrypt {
        name: String,
        data_type: String,
        /// Block device or file to format. Existing content is discarded.
        volume: PathBuf,

        /// Write the recovery key to this file (mode 0400) instead of stdout.
        #[arg(long)]
        recovery_key_out: Option<PathBuf>,
    },

    /// Activate a signed image or encrypted volume as a device-mapper device.
    Setup {
        image: PathBuf,

        /// Unlock an encrypted volume with the recovery key stored in this file.
        #[arg(long, conflicts_with = "password")]
        recovery_key_file: Option<PathBuf>,

        /// Prompt for a password instead of using the clear slot.
        #[arg(long)]
        password: bool,
    },

    /// Print the header of an image or volume.
    Info {
        image: PathBuf,

        /// Emit JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },

    /// Add a password slot to an encrypted volume.
    AddPassword {
        volume: PathBuf,

        /// Authorise with the recovery key in this file (default: the clear slot).
        #[arg(long)]
        recovery_key_file: Option<PathBuf>,
    },

    /// Validate the configuration file or print its JSON schema.
    Config {
        #[arg(long, conflicts_with = "init")]
        schema: bool,

        /// Write a configuration file with the built-in defaults.
        #[arg(long)]
        init: bool,
    },
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(BasaltConfig::resolve_path);

    let service = || -> Result<DiskImageService<SystemMapper>> {
        let config = BasaltConfig::load_or_default(&config_path).with_context(|| {
            format!("failed to load configuration from {}", config_path.display())
        })?;
        let mapper = SystemMapper::from_config(&config)?;
        Ok(DiskImageService::new(Arc::new(config), mapper))
    };

    match cli.command {
        Commands::Sign {
            name,
            data_type,
            data_file,
            image_file,
        } => {
            let service = service()?;
            service
                .format_signed(&data_file, &image_file, &name, &data_type)
                .with_context(|| format!("failed to sign {}", data_file.display()))?;
            println!("{}", service.info(&image_file)?);
        }
        Commands::Encrypt {
            name,
            data_type,
            volume,
            recovery_key_out,
        } => {
            let recovery_key = service()?
                .format_encrypted(&volume, &name, &data_type)
                .with_context(|| format!("failed to format {}", volume.display()))?;
            match recovery_key_out {
                Some(path) => {
                    let mut contents = Zeroizing::new(recovery_key.as_bytes().to_vec());
                    contents.push(b'\n');
                    keyfile::write_key_file(&path, &contents)?;
                    println!(
                        "Formatted {}; recovery key written to {}.",
                        volume.display(),
                        path.display()
                    );
                }
                None => {
                    println!("Formatted {}.", volume.display());
                    println!("Recovery key (store it offline): {}", recovery_key.as_str());
                }
            }
        }
        Commands::Setup {
            image,
            recovery_key_file,
            password,
        } => {
            let method = if password {
                UnlockMethod::Password(Zeroizing::new(prompt_password(format!(
                    "Password for {}: ",
                    image.display()
                ))?))
            } else {
                unlock_method(recovery_key_file.as_deref())?
            };
            let mapping = service()?
                .setup_with(&image, &method)
                .with_context(|| format!("failed to set up {}", image.display()))?;
            info!("{} active as {}", image.display(), mapping.name);
            println!("{}", mapping.device.display());
        }
        Commands::Info { image, json } => {
            let info = service()?.info(&image)?;
            if json {
                println!("{}", to_string_pretty(&info)?);
            } else {
                println!("{info}");
            }
        }
        Commands::AddPassword {
            volume,
            recovery_key_file,
        } => {
            let method = unlock_method(recovery_key_file.as_deref())?;
            let password = read_new_password()?;
            let index = service()?.add_password_slot(&volume, &method, password.as_bytes())?;
            println!("Added password slot {index} to {}.", volume.display());
        }
        Commands::Config { schema, init } => config_command(&config_path, schema, init)?,
    }

    Ok(())
}

fn config_command(path: &Path, schema: bool, init: bool) -> Result<()> {
    if schema {
        let schema = schema_for!(BasaltConfig);
        println!("{}", to_string_pretty(&schema)?);
        return Ok(());
    }

    if init {
        if path.exists() {
            bail!("{} already exists; refusing to overwrite", path.display());
        }
        let config = BasaltConfig::load_or_default(path)?;
        config
            .save()
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Default configuration written to {}.", path.display());
        return Ok(());
    }

    // `load` rejects invalid settings, listing every issue in the error.
    let config = BasaltConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    println!(
        "Configuration valid ({} key slots, {} hash tree, {}-byte data blocks).",
        config.image.key_slots, config.image.hash_algorithm, config.image.data_block_size
    );
    Ok(())
}

/// Recovery key from `file` when given, otherwise the clear slot.
fn unlock_method(file: Option<&Path>) -> Result<UnlockMethod> {
    match file {
        Some(path) => {
            let key = keyfile::read_key_file(path)
                .with_context(|| format!("failed to read recovery key {}", path.display()))?;
            Ok(UnlockMethod::RecoveryKey(key))
        }
        None => Ok(UnlockMethod::Clear),
    }
}

fn read_new_password() -> Result<Zeroizing<String>> {
    let first = Zeroizing::new(prompt_password("New password: ")?);
    if first.is_empty() {
        bail!("password must not be empty");
    }
    let second = Zeroizing::new(prompt_password("Repeat password: ")?);
    if *first != *second {
        bail!("passwords do not match");
    }
    Ok(first)
}
