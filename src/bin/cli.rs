//! Parley CLI tool
//!
//! A command-line front end for the engine: manage identities and contacts,
//! send messages through a relay and poll for incoming ones.
//!
//! State lives under `~/.parley` by default: `storage.key` holds the key
//! that seals everything else, `data/` holds the sealed records.

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use parley::{
    CancelToken, DeviceId, DirStorage, Engine, EngineConfig, IdentityId, LocalIdentity,
    PublicIdentity, StorageKey, TrustLevel, WebSocketRelay,
};
use tracing_subscriber::EnvFilter;

type CliResult<T = ()> = Result<T, Box<dyn Error>>;

/// Parley: end-to-end encrypted messaging over an untrusted relay
#[derive(Parser)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Data directory (default: ~/.parley)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Relay URL
    #[arg(short, long, default_value = "ws://127.0.0.1:8765")]
    relay: String,

    /// Engine configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local identity to act as (default: the only one)
    #[arg(long = "as")]
    identity: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and a first identity
    Init,

    /// Create an additional identity
    NewIdentity,

    /// Show local identities and their shareable public keys
    Identity,

    /// Add a contact from its shareable public key
    AddContact {
        /// `<signing hex>:<agreement hex>`
        public: String,

        /// Contact device ids (hex)
        #[arg(short, long = "device")]
        devices: Vec<String>,

        /// Trust level
        #[arg(short, long, value_enum, default_value = "unverified")]
        trust: Trust,
    },

    /// List contacts
    Contacts,

    /// Change a contact's trust level
    Trust {
        /// Contact identity id (hex)
        contact: String,

        /// New trust level
        #[arg(value_enum)]
        trust: Trust,
    },

    /// Send a message, establishing the channel if needed
    Send {
        /// Contact identity id (hex)
        contact: String,

        /// Contact device id (hex)
        device: String,

        /// Message text
        message: String,
    },

    /// Fetch and print incoming messages
    Poll {
        /// Keep polling until Ctrl-C
        #[arg(short, long)]
        watch: bool,
    },

    /// Revoke the session with one contact device
    Revoke {
        /// Contact identity id (hex)
        contact: String,

        /// Contact device id (hex)
        device: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Trust {
    Unverified,
    Trusted,
    Revoked,
}

impl From<Trust> for TrustLevel {
    fn from(trust: Trust) -> Self {
        match trust {
            Trust::Unverified => TrustLevel::Unverified,
            Trust::Trusted => TrustLevel::Trusted,
            Trust::Revoked => TrustLevel::Revoked,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> CliResult {
    let data_dir = match cli.data_dir.clone() {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    if let Commands::Init = cli.command {
        return cmd_init(&cli, &data_dir);
    }

    let engine = open_engine(&cli, &data_dir, false)?;
    match &cli.command {
        Commands::Init => Ok(()),
        Commands::NewIdentity => {
            let identity = engine.create_identity()?;
            print_identity(&identity);
            Ok(())
        }
        Commands::Identity => {
            let identities = engine.local_identities();
            if identities.is_empty() {
                println!("No identities. Run 'parley init' first.");
            }
            for identity in &identities {
                print_identity(identity);
                println!();
            }
            Ok(())
        }
        Commands::AddContact {
            public,
            devices,
            trust,
        } => {
            let me = pick_identity(&engine, cli.identity.as_deref())?;
            let public = PublicIdentity::from_shareable(public)?;
            let contact = engine.add_contact(&me.id(), public, (*trust).into())?;
            for device in devices {
                engine.add_contact_device(&me.id(), &contact.id(), DeviceId::from_hex(device)?)?;
            }
            println!("Contact added: {}", contact.id());
            Ok(())
        }
        Commands::Contacts => {
            let me = pick_identity(&engine, cli.identity.as_deref())?;
            let contacts = engine.contacts(&me.id());
            if contacts.is_empty() {
                println!("No contacts.");
            }
            for contact in contacts {
                println!("{}  [{:?}]", contact.id(), contact.trust);
                for device in &contact.devices {
                    let state = engine.channel_state(&me.id(), &contact.id(), device);
                    println!("    device {}  ({})", device.to_hex(), state);
                }
            }
            Ok(())
        }
        Commands::Trust { contact, trust } => {
            let me = pick_identity(&engine, cli.identity.as_deref())?;
            engine.set_trust(&me.id(), &IdentityId::from_hex(contact)?, (*trust).into())?;
            println!("Trust updated.");
            Ok(())
        }
        Commands::Send {
            contact,
            device,
            message,
        } => {
            let me = pick_identity(&engine, cli.identity.as_deref())?;
            let remote = IdentityId::from_hex(contact)?;
            let device = DeviceId::from_hex(device)?;
            cmd_send(&engine, &me, &remote, &device, message).await
        }
        Commands::Poll { watch } => {
            let me = pick_identity(&engine, cli.identity.as_deref())?;
            cmd_poll(&engine, &me, *watch).await
        }
        Commands::Revoke { contact, device } => {
            let me = pick_identity(&engine, cli.identity.as_deref())?;
            engine.revoke_session(
                &me.id(),
                &IdentityId::from_hex(contact)?,
                &DeviceId::from_hex(device)?,
            )?;
            println!("Session revoked.");
            Ok(())
        }
    }
}

fn default_data_dir() -> CliResult<PathBuf> {
    Ok(dirs::home_dir()
        .ok_or("could not find home directory")?
        .join(".parley"))
}

fn load_config(path: Option<&Path>) -> CliResult<EngineConfig> {
    Ok(match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    })
}

fn open_engine(cli: &Cli, data_dir: &Path, create: bool) -> CliResult<Engine> {
    let key_path = data_dir.join("storage.key");
    let storage_key = if create {
        fs::create_dir_all(data_dir)?;
        let key = StorageKey::generate()?;
        write_private(&key_path, key.to_hex().as_bytes())?;
        key
    } else {
        let hex = fs::read_to_string(&key_path).map_err(|_| {
            format!(
                "no storage key at {:?}; run 'parley init' to create one",
                key_path
            )
        })?;
        StorageKey::from_hex(&hex)?
    };

    let storage = Arc::new(DirStorage::open(data_dir.join("data"))?);
    let relay = Arc::new(WebSocketRelay::lazy(cli.relay.clone()));
    let config = load_config(cli.config.as_deref())?;
    Ok(Engine::open(config, relay, storage, storage_key)?)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> CliResult {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> CliResult {
    fs::write(path, contents)?;
    Ok(())
}

fn pick_identity(engine: &Engine, requested: Option<&str>) -> CliResult<LocalIdentity> {
    if let Some(hex) = requested {
        return Ok(engine.local_identity(&IdentityId::from_hex(hex)?)?);
    }
    let mut identities = engine.local_identities();
    match identities.len() {
        0 => Err("no identities; run 'parley init' first".into()),
        1 => Ok(identities.remove(0)),
        _ => Err("several identities exist; choose one with --as <id>".into()),
    }
}

fn print_identity(identity: &LocalIdentity) {
    println!("Identity: {}", identity.id());
    println!("Device:   {}", identity.device.to_hex());
    println!("Public key (share this with contacts):");
    println!("{}", identity.public.to_shareable());
}

fn cmd_init(cli: &Cli, data_dir: &Path) -> CliResult {
    if data_dir.join("storage.key").exists() {
        return Err(format!("already initialized at {:?}", data_dir).into());
    }

    let engine = open_engine(cli, data_dir, true)?;
    let identity = engine.create_identity()?;

    println!("Identity created successfully!");
    println!();
    print_identity(&identity);
    println!();
    println!("Data saved to: {:?}", data_dir);
    println!();
    println!("IMPORTANT: Back up {:?} securely!", data_dir.join("storage.key"));
    Ok(())
}

async fn cmd_send(
    engine: &Engine,
    me: &LocalIdentity,
    remote: &IdentityId,
    device: &DeviceId,
    message: &str,
) -> CliResult {
    // The handshake reply arrives in our own mailbox, so poll while sending
    let local = me.id();
    let (stop, token) = CancelToken::new();
    let inbound = engine.run_inbound(&local, &token);
    let send = async {
        let sent = engine
            .send_message(&local, remote, device, message.as_bytes(), &token)
            .await;
        stop.cancel();
        sent
    };

    let (inbound, sent) = tokio::join!(inbound, send);
    let message_id = sent?;
    inbound?;
    println!("Sent ({})", message_id);
    Ok(())
}

async fn cmd_poll(engine: &Engine, me: &LocalIdentity, watch: bool) -> CliResult {
    engine.on_message_received(|message| {
        println!(
            "[{} #{}] {}",
            message.sender.short(),
            message.sequence,
            String::from_utf8_lossy(&message.plaintext)
        );
    });
    engine.on_diagnostic(|event| {
        if let parley::Diagnostic::ChannelEstablished { key } = event {
            println!("Channel established with {}", key.remote.short());
        }
    });

    if !watch {
        let delivered = engine.poll_once(&me.id(), &CancelToken::never()).await?;
        println!("{} message(s).", delivered);
        return Ok(());
    }

    let (stop, token) = CancelToken::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });
    println!("Polling; press Ctrl-C to stop.");
    engine.run_inbound(&me.id(), &token).await?;
    Ok(())
}
