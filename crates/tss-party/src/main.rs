//! TSS Party CLI
//!
//! Command-line interface for one wallet party:
//! - party key setup
//! - threshold key generation (create, join, inspect invitations)
//! - threshold signing
//! - resuming an interrupted session

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use k256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey};
use tracing::{debug, info, warn, Level};
use tss_core::{
    ClientConfig, JoinCodeEncoding, JoinCodeOptions, KeyGenContext, PartyKey,
    RoundEvent, SignContext, SignRequest, SimulatedEngine, SubscribeOptions, Subscription,
    Transport, TssKey, TssKeyGen, TssSign,
};
use tss_http::HttpTransport;

const SEED_FILE: &str = "seed.hex";
const KEY_FILE: &str = "key.json";

/// TSS Party - threshold wallet party node
#[derive(Parser)]
#[command(name = "tss-party")]
#[command(about = "Threshold ECDSA wallet party")]
#[command(version)]
struct Cli {
    /// Coordinator base URL
    #[arg(short, long, env = "TSS_COORDINATOR_URL", default_value = "http://127.0.0.1:3232/bws/api")]
    coordinator: String,

    /// Data directory for the party seed, key and session exports
    #[arg(short, long, env = "TSS_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Chain the key is generated for
    #[arg(long, env = "TSS_CHAIN", default_value = "btc")]
    chain: String,

    /// Network the key is generated for
    #[arg(long, env = "TSS_NETWORK", default_value = "livenet")]
    network: String,

    /// Polling interval in milliseconds
    #[arg(long, env = "TSS_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_ms: u64,

    /// Join codes are base64 instead of hex
    #[arg(long)]
    base64: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the party seed
    Init {
        /// Replace an existing seed
        #[arg(long)]
        force: bool,
    },

    /// Print the auth public key invitations are sealed to
    AuthKey,

    /// Threshold key generation
    Keygen {
        #[command(subcommand)]
        command: KeygenCommands,
    },

    /// Sign a message hash with the stored key
    Sign {
        /// Hash to sign, hex encoded (32 bytes)
        #[arg(long, conflicts_with = "message", required_unless_present = "message")]
        hash: Option<String>,

        /// Message to hash with SHA-256 and sign
        #[arg(long)]
        message: Option<String>,

        /// BIP32 path below the common key chain
        #[arg(long, default_value = tss_core::sign::DEFAULT_DERIVATION_PATH)]
        path: String,

        /// Session id shared by the signers (defaults to one derived from the hash)
        #[arg(long)]
        id: Option<String>,
    },

    /// Show the stored key
    Info,

    /// Continue a session from its export file
    Resume {
        #[arg(value_enum)]
        role: ResumeRole,
    },
}

#[derive(Subcommand)]
enum KeygenCommands {
    /// Create an m-of-n session as party 0 and print invitations
    New {
        #[arg(short)]
        m: usize,

        #[arg(short)]
        n: usize,

        /// Password invitees must present
        #[arg(long)]
        password: Option<String>,

        /// Invitee as PARTY_ID:AUTH_PUBLIC_KEY_HEX
        #[arg(long = "invite")]
        invites: Vec<String>,
    },

    /// Join a session with an invitation
    Join {
        #[arg(long)]
        code: String,

        #[arg(long)]
        password: Option<String>,
    },

    /// Decode an invitation without joining
    Inspect {
        #[arg(long)]
        code: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ResumeRole {
    Keygen,
    Sign,
}

impl Cli {
    fn config(&self) -> Result<ClientConfig> {
        let config = ClientConfig {
            base_url: self.coordinator.clone(),
            poll_interval_ms: self.poll_ms,
            chain: self.chain.parse()?,
            network: self.network.parse()?,
            ..ClientConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn join_options(&self) -> JoinCodeOptions {
        JoinCodeOptions {
            encoding: if self.base64 {
                JoinCodeEncoding::Base64
            } else {
                JoinCodeEncoding::Hex
            },
        }
    }

    fn session_file(&self, role: ResumeRole) -> PathBuf {
        let name = match role {
            ResumeRole::Keygen => "session.keygen.txt",
            ResumeRole::Sign => "session.sign.txt",
        };
        self.data_dir.join(name)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.data_dir)?;

    match &cli.command {
        Commands::Init { force } => init(&cli, *force),
        Commands::AuthKey => {
            let party = load_party(&cli)?;
            println!("{}", encode_public_key(&party.auth_public_key()));
            Ok(())
        }
        Commands::Keygen { command } => match command {
            KeygenCommands::New {
                m,
                n,
                password,
                invites,
            } => keygen_new(&cli, *m, *n, password.as_deref(), invites).await,
            KeygenCommands::Join { code, password } => {
                keygen_join(&cli, code, password.as_deref()).await
            }
            KeygenCommands::Inspect { code } => keygen_inspect(&cli, code),
        },
        Commands::Sign {
            hash,
            message,
            path,
            id,
        } => {
            let request = match (hash, message) {
                (Some(hash), _) => {
                    let bytes: [u8; 32] = hex::decode(hash)?
                        .try_into()
                        .map_err(|_| anyhow!("hash must be 32 bytes"))?;
                    SignRequest::new(bytes)
                }
                (None, Some(message)) => SignRequest::from_message(message.as_bytes()),
                (None, None) => bail!("either --hash or --message is required"),
            };
            let mut request = request.with_derivation_path(path.clone());
            if let Some(id) = id {
                request = request.with_id(id.clone());
            }
            sign(&cli, request).await
        }
        Commands::Info => show_info(&cli),
        Commands::Resume { role } => resume(&cli, *role).await,
    }
}

fn init(cli: &Cli, force: bool) -> Result<()> {
    let path = cli.data_dir.join(SEED_FILE);
    if path.exists() && !force {
        bail!("{} already exists; pass --force to replace it", path.display());
    }
    let seed = PartyKey::random_seed();
    std::fs::write(&path, hex::encode(&seed[..]))?;
    let party = PartyKey::from_seed(&seed[..])?;

    info!(path = ?path, "party seed created");
    println!("Auth Key: {}", encode_public_key(&party.auth_public_key()));
    Ok(())
}

async fn keygen_new(
    cli: &Cli,
    m: usize,
    n: usize,
    password: Option<&str>,
    invites: &[String],
) -> Result<()> {
    let invites = invites
        .iter()
        .map(|invite| parse_invite(invite))
        .collect::<Result<Vec<_>>>()?;

    let mut keygen = TssKeyGen::new(keygen_context(cli)?);
    keygen.new_key(m, n, password).await?;
    let id = keygen.id().ok_or_else(|| anyhow!("session id missing"))?;
    info!(id = %id, m, n, "Starting key generation");

    for (party_id, auth_key) in invites {
        let code = keygen.create_join_code(
            party_id,
            &auth_key,
            password.map(str::to_string),
            &cli.join_options(),
        )?;
        println!("Join code for party {party_id}: {code}");
    }

    run_keygen(cli, &keygen).await
}

async fn keygen_join(cli: &Cli, code: &str, password: Option<&str>) -> Result<()> {
    let mut keygen = TssKeyGen::new(keygen_context(cli)?);
    keygen.join_key(code, password, &cli.join_options()).await?;
    info!(id = ?keygen.id(), "Joined key generation");
    run_keygen(cli, &keygen).await
}

fn keygen_inspect(cli: &Cli, code: &str) -> Result<()> {
    let keygen = TssKeyGen::new(keygen_context(cli)?);
    let payload = keygen.check_join_code(code, &cli.join_options())?;

    println!("Invitation:");
    println!("  Session: {}", payload.id);
    println!("  Party ID: {}", payload.party_id);
    println!("  Threshold: {}-of-{}", payload.m, payload.n);
    println!("  Chain: {} ({})", payload.chain, payload.network);
    println!("  Extra: {}", payload.extra.is_some());
    Ok(())
}

async fn run_keygen(cli: &Cli, keygen: &TssKeyGen) -> Result<()> {
    let subscription = keygen.subscribe(subscribe_options(cli)?)?;
    drive(subscription, &cli.session_file(ResumeRole::Keygen), || {
        keygen.export_session()
    })
    .await?;

    let key = keygen
        .tss_key()
        .ok_or_else(|| anyhow!("key generation finished without a key"))?;
    let path = cli.data_dir.join(KEY_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(&key)?)?;

    info!(path = ?path, "Key generation completed, key saved");
    println!("Public Key: {}", encode_public_key(&key.keychain.public_key()?));
    println!("xpub: {}", key.xpub(key.network)?);
    Ok(())
}

async fn sign(cli: &Cli, request: SignRequest) -> Result<()> {
    let mut signer = TssSign::new(sign_context(cli)?);
    info!(id = %request.session_id(), path = %request.derivation_path, "Starting signing");
    signer.start(request).await?;
    run_sign(cli, &signer).await
}

async fn run_sign(cli: &Cli, signer: &TssSign) -> Result<()> {
    let subscription = signer.subscribe(subscribe_options(cli)?)?;
    drive(subscription, &cli.session_file(ResumeRole::Sign), || {
        signer.export_session()
    })
    .await?;

    let signature = signer
        .signature()
        .ok_or_else(|| anyhow!("signing finished without a signature"))?;
    println!("Signature:");
    println!("  r: {}", signature.r);
    println!("  s: {}", signature.s);
    println!("  v: {}", signature.v);
    println!("  DER: {}", hex::encode(signature.to_der()?));
    println!("  pubKey: {}", signature.pub_key);
    Ok(())
}

async fn resume(cli: &Cli, role: ResumeRole) -> Result<()> {
    let path = cli.session_file(role);
    let exported = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;

    match role {
        ResumeRole::Keygen => {
            let mut keygen = TssKeyGen::new(keygen_context(cli)?);
            keygen.restore_session(&exported).await?;
            info!(id = ?keygen.id(), "Resuming key generation");
            run_keygen(cli, &keygen).await
        }
        ResumeRole::Sign => {
            let mut signer = TssSign::new(sign_context(cli)?);
            signer.restore_session(&exported).await?;
            info!(id = ?signer.id(), "Resuming signing");
            run_sign(cli, &signer).await
        }
    }
}

/// Follow the loop to completion, keeping the export file current
async fn drive<F>(mut subscription: Subscription, export_path: &Path, export: F) -> Result<()>
where
    F: Fn() -> tss_core::Result<String>,
{
    while let Some(event) = subscription.next().await {
        match event {
            RoundEvent::Ready(round) | RoundEvent::Processed(round) => {
                debug!(round, "round progress");
            }
            RoundEvent::Submitted(round) => {
                info!(round, "Round submitted");
                match export() {
                    Ok(exported) => std::fs::write(export_path, exported)?,
                    // the loop ran ahead and finished; Complete follows
                    Err(tss_core::Error::SessionCompleted) => {
                        debug!(round, "session already completed, export skipped");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            RoundEvent::Artifact(_) => info!("Session artifact received"),
            RoundEvent::Complete => {
                if export_path.exists() {
                    std::fs::remove_file(export_path)?;
                }
                return Ok(());
            }
            RoundEvent::Error(err) => warn!(error = %err, "iteration failed"),
        }
    }
    bail!("session loop stopped before completion")
}

fn show_info(cli: &Cli) -> Result<()> {
    let key = load_key(cli)?;
    let default_path = tss_core::sign::DEFAULT_DERIVATION_PATH;

    println!("Key Info:");
    println!("  Session: {}", key.metadata.id);
    println!("  Party ID: {}", key.metadata.party_id);
    println!("  Threshold: {}-of-{}", key.metadata.m, key.metadata.n);
    println!("  Chain: {} ({})", key.chain, key.network);
    println!("  Public Key: {}", encode_public_key(&key.keychain.public_key()?));
    println!(
        "  {default_path}: {}",
        encode_public_key(&key.keychain.derive_public_key(default_path)?)
    );
    println!("  xpub: {}", key.xpub(key.network)?);
    Ok(())
}

fn transport(cli: &Cli) -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(HttpTransport::from_config(&cli.config()?)?))
}

fn subscribe_options(cli: &Cli) -> Result<SubscribeOptions> {
    Ok(SubscribeOptions::from(&cli.config()?))
}

fn keygen_context(cli: &Cli) -> Result<KeyGenContext> {
    let config = cli.config()?;
    Ok(KeyGenContext {
        transport: transport(cli)?,
        engine: Arc::new(SimulatedEngine),
        party: load_party(cli)?,
        chain: config.chain,
        network: config.network,
    })
}

fn sign_context(cli: &Cli) -> Result<SignContext> {
    Ok(SignContext {
        transport: transport(cli)?,
        engine: Arc::new(SimulatedEngine),
        party: load_party(cli)?,
        key: load_key(cli)?,
    })
}

fn load_party(cli: &Cli) -> Result<PartyKey> {
    let path = cli.data_dir.join(SEED_FILE);
    let seed = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}; run `tss-party init` first", path.display()))?;
    let seed = zeroize::Zeroizing::new(hex::decode(seed.trim())?);
    Ok(PartyKey::from_seed(&seed)?)
}

fn load_key(cli: &Cli) -> Result<TssKey> {
    let path = cli.data_dir.join(KEY_FILE);
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_str(&json)?)
}

fn parse_invite(invite: &str) -> Result<(usize, PublicKey)> {
    let (party_id, key) = invite
        .split_once(':')
        .ok_or_else(|| anyhow!("invite must be PARTY_ID:AUTH_PUBLIC_KEY_HEX"))?;
    let key = PublicKey::from_sec1_bytes(&hex::decode(key.trim())?)
        .map_err(|_| anyhow!("invalid auth public key for party {party_id}"))?;
    Ok((party_id.trim().parse()?, key))
}

fn encode_public_key(key: &PublicKey) -> String {
    hex::encode(key.to_encoded_point(true).as_bytes())
}
