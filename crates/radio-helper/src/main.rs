use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use radio_core::decoder::media_type;
use radio_core::protocol::constants::{IDEMPOTENCY_KEY_HEADER, JOB_ID_HEADER};
use radio_core::{Capabilities, OfferSigner, ServiceOffer, ServiceOfferData, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "radio-helper")]
#[command(about = "A CLI tool to create provider keys and talk to a Radio broker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a provider signing key (TOML file)
    Keygen {
        /// Signature scheme: ed25519 or secp256k1
        #[arg(long, default_value = "ed25519")]
        scheme: SignatureScheme,
        /// Output file path
        #[arg(short, long, default_value = "provider-key.toml")]
        output: String,
    },
    /// Print a signed service offer as JSON
    SignOffer {
        #[command(flatten)]
        offer: OfferArgs,
    },
    /// Sign a service offer and submit it to a broker
    SubmitOffer {
        #[command(flatten)]
        offer: OfferArgs,
        /// Broker base URL
        #[arg(long, default_value = "http://localhost:8000")]
        broker: String,
        /// Idempotency key, so retries do not create duplicate jobs
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Deliver a result for a job
    SubmitResult {
        /// Broker base URL
        #[arg(long, default_value = "http://localhost:8000")]
        broker: String,
        /// Job id from the job request
        #[arg(long)]
        id: Uuid,
        /// Deliver a JSON result pointing at this audio URL
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        audio_url: Option<String>,
        /// Deliver this audio file as a binary result
        #[arg(long)]
        file: Option<String>,
    },
    /// Show the state of a job
    Status {
        /// Broker base URL
        #[arg(long, default_value = "http://localhost:8000")]
        broker: String,
        /// Job id
        #[arg(long)]
        id: Uuid,
    },
}

#[derive(Args)]
struct OfferArgs {
    /// Path to the provider key file
    #[arg(long, default_value = "provider-key.toml")]
    key: String,
    /// Provider name placed in the offer
    #[arg(long)]
    provider: String,
    #[arg(long)]
    receipt_analysis: bool,
    #[arg(long)]
    data_processing: bool,
    #[arg(long)]
    data_storage: bool,
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    identity: IdentityConfig,
}

#[derive(Serialize, Deserialize)]
struct IdentityConfig {
    scheme: SignatureScheme,
    private_key: String,
    public_key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { scheme, output } => generate_key(scheme, &output),
        Commands::SignOffer { offer } => {
            let signed = build_offer(&offer)?;
            println!("{}", serde_json::to_string_pretty(&signed)?);
            Ok(())
        }
        Commands::SubmitOffer {
            offer,
            broker,
            idempotency_key,
        } => submit_offer(&offer, &broker, idempotency_key.as_deref()).await,
        Commands::SubmitResult {
            broker,
            id,
            audio_url,
            file,
        } => submit_result(&broker, id, audio_url.as_deref(), file.as_deref()).await,
        Commands::Status { broker, id } => show_status(&broker, id).await,
    }
}

fn generate_key(scheme: SignatureScheme, output: &str) -> Result<()> {
    let signer = OfferSigner::generate(scheme);
    let key_file = KeyFile {
        identity: IdentityConfig {
            scheme,
            private_key: signer.secret_hex(),
            public_key: signer.public_key_base58(),
        },
    };

    let toml_content = toml::to_string_pretty(&key_file)
        .context("Failed to serialize key file to TOML")?;

    fs::write(output, toml_content).context("Failed to write key file")?;

    println!("✅ Provider key generated successfully!");
    println!("📄 File: {}", output);
    println!("🔐 Scheme: {:?}", scheme);
    println!("🔑 Public Key: {}", key_file.identity.public_key);
    println!("\n📋 Next steps:");
    println!("   1. Keep the key file secure");
    println!("   2. Run: radio-helper submit-offer --key {} --provider <name>", output);

    Ok(())
}

fn load_signer(path: impl AsRef<Path>) -> Result<OfferSigner> {
    let content = fs::read_to_string(path.as_ref()).context("Failed to read key file")?;
    let key_file: KeyFile = toml::from_str(&content).context("Failed to parse key file")?;

    OfferSigner::from_secret_hex(key_file.identity.scheme, &key_file.identity.private_key)
        .context("Failed to load signing key")
}

fn build_offer(args: &OfferArgs) -> Result<ServiceOffer> {
    let signer = load_signer(&args.key)?;
    let capabilities = Capabilities {
        receipt_analysis: args.receipt_analysis,
        data_processing: args.data_processing,
        data_storage: args.data_storage,
    };

    signer
        .sign_offer(ServiceOfferData::new(args.provider.clone(), capabilities))
        .context("Failed to sign offer")
}

async fn submit_offer(args: &OfferArgs, broker: &str, idempotency_key: Option<&str>) -> Result<()> {
    let offer = build_offer(args)?;
    println!("📡 Submitting offer from {} to {}", offer.data.provider, broker);

    let job_request = post_offer(broker, &offer, idempotency_key).await?;

    println!("✅ Offer accepted!");
    println!("{}", serde_json::to_string_pretty(&job_request)?);
    if let Some(id) = job_request["id"].as_str() {
        println!("\n📋 Poll with: radio-helper status --broker {} --id {}", broker, id);
    }

    Ok(())
}

async fn post_offer(
    broker: &str,
    offer: &ServiceOffer,
    idempotency_key: Option<&str>,
) -> Result<serde_json::Value> {
    let client = reqwest::Client::new();
    let mut request = client.post(format!("{}/offers", broker)).json(offer);
    if let Some(key) = idempotency_key {
        request = request.header(IDEMPOTENCY_KEY_HEADER, key);
    }

    let response = request.send().await.context("Failed to send offer")?;
    if !response.status().is_success() {
        let error_text = response.text().await.unwrap_or_default();
        anyhow::bail!("Offer rejected: {}", error_text);
    }

    response
        .json()
        .await
        .context("Failed to parse job request")
}

async fn submit_result(
    broker: &str,
    id: Uuid,
    audio_url: Option<&str>,
    file: Option<&str>,
) -> Result<()> {
    let ack = post_result(broker, id, audio_url, file).await?;

    println!("✅ {}", ack["message"].as_str().unwrap_or("Result stored"));
    if let Some(filename) = ack["filename"].as_str() {
        println!("📄 Stored as: {}", filename);
    }

    Ok(())
}

async fn post_result(
    broker: &str,
    id: Uuid,
    audio_url: Option<&str>,
    file: Option<&str>,
) -> Result<serde_json::Value> {
    let client = reqwest::Client::new();
    let url = format!("{}/results", broker);

    let request = match (audio_url, file) {
        (Some(audio_url), _) => {
            println!("📡 Submitting audio URL for job {}", id);
            client
                .post(&url)
                .json(&serde_json::json!({"id": id, "audio_url": audio_url}))
        }
        (None, Some(path)) => {
            let bytes = fs::read(path).context("Failed to read audio file")?;
            println!("📡 Uploading {} bytes for job {}", bytes.len(), id);
            client
                .post(&url)
                .header(JOB_ID_HEADER, id.to_string())
                .header("content-type", content_type_for(path))
                .body(bytes)
        }
        (None, None) => anyhow::bail!("Either --audio-url or --file is required"),
    };

    let response = request.send().await.context("Failed to send result")?;
    if !response.status().is_success() {
        let error_text = response.text().await.unwrap_or_default();
        anyhow::bail!("Result rejected: {}", error_text);
    }

    response
        .json()
        .await
        .context("Failed to parse acknowledgement")
}

fn content_type_for(path: &str) -> &'static str {
    let extension = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    media_type(&extension)
}

async fn show_status(broker: &str, id: Uuid) -> Result<()> {
    let response = reqwest::get(format!("{}/jobs/{}", broker, id))
        .await
        .context("Failed to query job")?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        anyhow::bail!("Job {} is unknown to the broker", id);
    }
    if !response.status().is_success() {
        let error_text = response.text().await.unwrap_or_default();
        anyhow::bail!("Status query failed: {}", error_text);
    }

    let job: serde_json::Value = response.json().await.context("Failed to parse job")?;
    println!("🔍 Job {}: {}", id, job["state"].as_str().unwrap_or("unknown"));
    println!("{}", serde_json::to_string_pretty(&job)?);

    Ok(())
}
