//! `csfle` CLI tool for key management and an end-to-end walkthrough.

#![warn(clippy::pedantic, clippy::nursery)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use csfle::prelude::*;
use csfle_key_file::{FileKeyVault, MASTER_KEY_FILE};
use csfle_kms_aws::AwsKms;
use tracing_subscriber::EnvFilter;

const DEFAULT_KEY_VAULT: &str = "demoFLE.__keystore";
const PEOPLE: &str = "demoFLE.people";

#[derive(Parser)]
#[command(name = "csfle")]
#[command(about = "Client-side field-level encryption CLI", long_about = None)]
struct Cli {
    /// Key directory holding the local master key and the key vault
    #[arg(short, long, global = true, default_value = "./keys")]
    key_dir: PathBuf,

    /// Client configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Register the AWS provider using the SDK's default credential chain
    #[arg(long, global = true)]
    aws_from_env: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a key directory with a fresh local master key
    Init,
    /// Create a data key bound to an alias
    CreateKey {
        /// Key alias (keyAltName)
        alias: String,
        #[command(flatten)]
        master_key: MasterKeyArgs,
    },
    /// List the data keys in the key vault
    Keys,
    /// Walk through automatic, explicit and bypassed encryption on an in-memory store
    Demo {
        #[command(flatten)]
        master_key: MasterKeyArgs,
    },
}

#[derive(Args)]
struct MasterKeyArgs {
    /// Wrap data keys under this AWS KMS key (ARN or alias) instead of the local master key
    #[arg(long)]
    aws_key: Option<String>,
    /// Region of the AWS KMS key (defaults to the configured region)
    #[arg(long, default_value = "")]
    aws_region: String,
    /// Custom AWS KMS endpoint
    #[arg(long)]
    aws_endpoint: Option<String>,
}

impl MasterKeyArgs {
    fn master_key(&self) -> MasterKey {
        match &self.aws_key {
            Some(key) => MasterKey::Aws {
                region: self.aws_region.clone(),
                key: key.clone(),
                endpoint: self.aws_endpoint.clone(),
            },
            None => MasterKey::Local,
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(std::io::stderr).compact().init();
}

/// Configuration, KMS providers and key vault shared by every command.
struct Session {
    config: ClientConfig,
    kms: KmsProviders,
    key_vault: Arc<dyn KeyVaultStore>,
}

impl Session {
    fn open(cli: &Cli) -> anyhow::Result<Self> {
        let config = match &cli.config {
            Some(path) => ClientConfig::from_path(path)?,
            None => ClientConfig::new(DEFAULT_KEY_VAULT.parse()?),
        };

        let mut kms = config.kms_providers()?;
        let credentials = config.kms_credentials();
        if credentials.local.is_none() && cli.key_dir.join(MASTER_KEY_FILE).exists() {
            kms = kms.with(csfle_key_file::local_kms(&cli.key_dir)?);
        }
        if let Some(aws) = &credentials.aws {
            kms = kms.with(AwsKms::new(aws)?);
        } else if cli.aws_from_env {
            kms = kms.with(AwsKms::from_env()?);
        }

        let namespace = config.key_vault_namespace().to_string();
        let key_vault = Arc::new(
            FileKeyVault::for_namespace(&cli.key_dir, &namespace)
                .with_context(|| format!("cannot open key vault in {}", cli.key_dir.display()))?,
        );

        Ok(Self { config, kms, key_vault })
    }

    /// Client over the store named by the configuration's connection target.
    fn connect(&self) -> anyhow::Result<EncryptedClient> {
        Ok(EncryptedClient::connect(self.config.clone(), self.kms.clone(), self.key_vault.clone())?)
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Init => init(&cli.key_dir),
        Commands::CreateKey { alias, master_key } => {
            let session = Session::open(&cli)?;
            let client = session.connect()?;
            let key = client.create_key(alias, master_key.master_key())?;
            println!("Created data key {} ({alias})", key.id());
            Ok(())
        }
        Commands::Keys => {
            let session = Session::open(&cli)?;
            for key in session.key_vault.list()? {
                println!("{}", serde_json::to_string_pretty(&key)?);
            }
            Ok(())
        }
        Commands::Demo { master_key } => demo(&Session::open(&cli)?, &master_key.master_key()),
    }
}

fn init(key_dir: &Path) -> anyhow::Result<()> {
    csfle_key_file::init(key_dir).with_context(|| format!("cannot initialize {}", key_dir.display()))?;
    println!("Initialized key directory: {}", key_dir.display());
    println!("Local master key: {}", key_dir.join(MASTER_KEY_FILE).display());
    Ok(())
}

fn report<T>(result: &Result<T, Error>) {
    match result {
        Ok(_) => println!("Result: inserted 1 document"),
        Err(err) => println!("Result: error: {err}"),
    }
}

fn people_table() -> Result<PolicyTable, Error> {
    PolicyTable::define([
        FieldPolicy::new("ssn", BsonType::String, Algorithm::Deterministic, "fieldKey1"),
        FieldPolicy::new("dob", BsonType::Date, Algorithm::Randomized, "fieldKey1"),
        FieldPolicy::new("contact.email", BsonType::String, Algorithm::Deterministic, "fieldKey2"),
        FieldPolicy::new("contact.mobile", BsonType::String, Algorithm::Deterministic, "fieldKey2"),
    ])
}

fn date(year: i32, month: u32, day: u32) -> anyhow::Result<Value> {
    Value::date_ymd(year, month, day).with_context(|| format!("invalid date {year}-{month}-{day}"))
}

fn grace_hopper() -> anyhow::Result<Document> {
    Ok(Document::new()
        .with("firstName", "Grace")
        .with("lastName", "Hopper")
        .with("ssn", "901-01-0001")
        .with("dob", date(1989, 12, 13)?)
        .with(
            "address",
            Document::new()
                .with("street", "123 Main Street")
                .with("city", "Omaha")
                .with("state", "Nebraska")
                .with("zip", "90210"),
        )
        .with("contact", Document::new().with("mobile", "202-555-1212").with("email", "grace@example.com")))
}

/// Alan Turing's record with every sensitive field encrypted explicitly.
fn alan_turing(client: &EncryptedClient, key1: KeyId, key2: KeyId) -> anyhow::Result<Document> {
    let encrypt = |key: KeyId, value: Value, algorithm| client.encrypt(&KeyRef::Id(key), &value, algorithm);

    Ok(Document::new()
        .with("firstName", "Alan")
        .with("lastName", "Turing")
        .with("ssn", encrypt(key1, "901-01-0002".into(), Algorithm::Deterministic)?)
        .with("dob", encrypt(key1, date(1912, 6, 23)?, Algorithm::Randomized)?)
        .with(
            "address",
            Document::new()
                .with("street", "123 Oak Lane")
                .with("city", "Cleveland")
                .with("state", "Ohio")
                .with("zip", "90210"),
        )
        .with(
            "contact",
            Document::new()
                .with("mobile", encrypt(key2, "202-555-1234".into(), Algorithm::Deterministic)?)
                .with("email", encrypt(key2, "alan@example.net".into(), Algorithm::Deterministic)?),
        ))
}

fn dump(client: &EncryptedClient, filter: &Document) -> anyhow::Result<()> {
    for doc in client.find(PEOPLE, filter)? {
        println!("{doc}");
    }
    Ok(())
}

fn demo(session: &Session, master_key: &MasterKey) -> anyhow::Result<()> {
    // Key provisioning needs no schema
    let client = session.connect()?;
    let client = client.with_config(client.config().clone().with_schema_map(SchemaMap::new()))?;
    let store = client.store().clone();
    println!("Using store {}", client.config().connection_target());
    store.drop_namespace(PEOPLE)?;

    println!("Attempting to create 2 field keys aliased fieldKey1 and fieldKey2...");
    for alias in ["fieldKey1", "fieldKey2"] {
        match client.create_key(alias, master_key.clone()) {
            Ok(key) => println!("Created {alias}: {}", key.id()),
            Err(Error::DuplicateAlias(_)) => println!("{alias} already exists, reusing it"),
            Err(err) => return Err(err.into()),
        }
    }

    println!("\nKey vault ({}):", client.config().key_vault_namespace());
    for key in client.key_directory().keys()? {
        println!("{}", serde_json::to_string_pretty(&key)?);
    }

    println!("\nAttempting to retrieve field keys...");
    let key1 = client.key_directory().resolve("fieldKey1")?;
    let key2 = client.key_directory().resolve("fieldKey2")?;
    println!("fieldKey1 = {key1}\nfieldKey2 = {key2}");

    let table = people_table()?;
    println!("\nSetting store-side validation: encrypted fields of `people` must be binData...");
    store.set_validator(PEOPLE, SchemaNode::validator_for(&table))?;

    println!("Creating client-side schema for automatic encryption on `people`...");
    let schema_map = SchemaMap::new().with_table(PEOPLE, &table);
    println!("{}", schema_map.to_json_pretty()?);

    println!("\nSwitching to a client with automatic encryption...");
    let automatic = client.with_config(client.config().clone().with_schema_map(schema_map).with_bypass(false))?;

    println!("Attempting to insert sample document with automatic encryption...");
    report(&automatic.insert_one(PEOPLE, &grace_hopper()?));

    println!("Attempting to insert sample document with explicit encryption...");
    report(&automatic.insert_one(PEOPLE, &alan_turing(&automatic, key1, key2)?));

    println!("\nEnabling bypass of automatic encrypt/decrypt...");
    let bypass = automatic.with_config(automatic.config().clone().with_bypass(true))?;

    println!("Attempting to insert sample document with explicit encryption...");
    report(&bypass.insert_one(PEOPLE, &alan_turing(&bypass, key1, key2)?));

    println!("\nDumping (raw) records from `people`:");
    dump(&bypass, &Document::new())?;

    println!("\nDumping (automatically decrypted) records from `people`:");
    dump(&automatic, &Document::new())?;

    println!("\nCreating an index on the encrypted ssn field...");
    println!("(the in-memory store matches ciphertext by scanning; deterministic ssn values compare equal)");

    println!("\nFetching a person record by ssn value against the encrypted field...");
    dump(&automatic, &Document::new().with("ssn", "901-01-0002"))?;

    println!("\nDemo complete.");
    Ok(())
}
