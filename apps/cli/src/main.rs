use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    ArtifactSink, DirArtifactSink, MissingQrDecoder, SessionEvent, UploadDisposition, VerifyClient,
};
use shared::domain::ScanStatus;
use shared::protocol::ScanResponse;
use tokio::sync::broadcast::error::RecvError;
use url::Url;

mod config;

#[derive(Parser, Debug)]
#[command(about = "Client for the product-authenticity verification service")]
struct Args {
    /// Verification server base URL; overrides client.toml and environment.
    #[arg(long)]
    server_url: Option<String>,
    /// Bearer token for authenticated commands; falls back to VERIFY_TOKEN.
    #[arg(long)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account.
    Register {
        username: String,
        password: String,
        #[arg(long)]
        manufacturer: bool,
    },
    /// Log in and print the session token.
    Login { username: String, password: String },
    /// Verify a product code as a visitor.
    Scan {
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        pincode: String,
        /// Decoded QR payload (the product id printed under the code).
        code: String,
    },
    /// List scans recorded for the logged-in account.
    Scans,
    /// List the manufacturer's products with scan counts.
    Products,
    /// List duplicate-scan alerts.
    Notifications,
    /// Upload a product CSV and save the generated QR archive.
    Upload { file: PathBuf },
    /// Download the sample CSV template.
    SampleCsv,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();
    let settings = config::load_settings();

    let server_url =
        config::normalize_server_url(&args.server_url.unwrap_or(settings.server_url));
    Url::parse(&server_url).with_context(|| format!("invalid server url: {server_url}"))?;

    let client = VerifyClient::new_with_dependencies(
        &server_url,
        Arc::new(MissingQrDecoder),
        Arc::new(DirArtifactSink::new(&settings.download_dir)),
    );

    match args.command {
        Command::Register {
            username,
            password,
            manufacturer,
        } => {
            let user = client
                .api()
                .register(&username, &password, manufacturer)
                .await?;
            println!("Registered {} (manufacturer: {})", user.username, user.is_manufacturer);
        }
        Command::Login { username, password } => {
            let body = client.api().login(&username, &password).await?;
            println!("Logged in (manufacturer: {})", body.is_manufacturer);
            println!("{}", body.token);
        }
        Command::Scan {
            name,
            phone,
            pincode,
            code,
        } => {
            let result = run_scan(&client, &name, &phone, &pincode, code).await?;
            print_scan_result(&result);
        }
        Command::Scans => {
            init_auth(&client, args.token).await?;
            for scan in client.api().fetch_scans().await? {
                println!(
                    "{}  {}  {}  {}  {:?}",
                    scan.timestamp, scan.product_id, scan.name, scan.phone, scan.status
                );
            }
        }
        Command::Products => {
            init_auth(&client, args.token).await?;
            for product in client.api().fetch_products().await? {
                println!(
                    "{}  {}  scans={}",
                    product.product_id, product.manufacturer, product.scan_count
                );
            }
        }
        Command::Notifications => {
            init_auth(&client, args.token).await?;
            for alert in client.api().fetch_notifications().await? {
                println!("{}  {}  {}", alert.timestamp, alert.product_id, alert.message);
                println!(
                    "    scanned by {} ({}) pincode {}",
                    alert.scanned_by, alert.phone, alert.pincode
                );
            }
        }
        Command::Upload { file } => {
            init_auth(&client, args.token).await?;
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let file_name = file
                .file_name()
                .and_then(|name| name.to_str())
                .with_context(|| format!("invalid file name: {}", file.display()))?;
            client.upload.select_file(file_name, bytes).await?;
            match client.upload.submit().await {
                UploadDisposition::Saved { filename } => {
                    println!("QR codes generated; saved {filename} to {}", settings.download_dir);
                }
                UploadDisposition::Rejected { report } => {
                    println!("CSV rejected by validation:");
                    for entry in &report {
                        println!("  row {}: missing {}", entry.row, entry.missing_fields.join(", "));
                    }
                    bail!("fix the CSV and upload again");
                }
                UploadDisposition::Failed { message } => bail!(message),
                UploadDisposition::Skipped(reason) => bail!("upload skipped: {reason:?}"),
            }
        }
        Command::SampleCsv => {
            init_auth(&client, args.token).await?;
            let bytes = client.api().download_sample_csv().await?;
            let sink = DirArtifactSink::new(&settings.download_dir);
            sink.save("sample_products.csv", &bytes).await?;
            println!("Saved sample_products.csv to {}", settings.download_dir);
        }
    }

    Ok(())
}

async fn init_auth(client: &VerifyClient, token: Option<String>) -> Result<()> {
    let token = token
        .or_else(|| std::env::var("VERIFY_TOKEN").ok())
        .context("--token (or VERIFY_TOKEN) is required for this command")?;
    client.auth().init(token, false).await;
    Ok(())
}

/// Drives the scan session the way the scanning screen does: identity first,
/// then a decoded payload, then wait for the bound result.
async fn run_scan(
    client: &VerifyClient,
    name: &str,
    phone: &str,
    pincode: &str,
    code: String,
) -> Result<ScanResponse> {
    if let Err(errors) = client.scan.submit_identity(name, phone, pincode).await {
        let mut invalid = Vec::new();
        if errors.name {
            invalid.push("name");
        }
        if errors.phone {
            invalid.push("phone (exactly 10 digits required)");
        }
        if errors.pincode {
            invalid.push("pincode");
        }
        bail!("invalid identity fields: {}", invalid.join(", "));
    }

    let mut events = client.scan.subscribe_events();
    client.scan.on_decoded(code).await;

    let result = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::ResultUpdated(result)) => return Ok(result),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("scan session closed unexpectedly"),
            }
        }
    })
    .await
    .context("timed out waiting for the verification result")??;

    client.scan.reset_session().await;
    Ok(result)
}

fn print_scan_result(result: &ScanResponse) {
    let label = match result.status {
        ScanStatus::Genuine => "GENUINE",
        ScanStatus::AlreadyScanned => "ALREADY SCANNED",
        ScanStatus::Invalid => "INVALID",
        ScanStatus::Error => "ERROR",
    };
    println!("{label}: {}", result.message);
    if let Some(product) = &result.product {
        println!("  product {}  manufacturer {}", product.product_id, product.manufacturer);
    }
    if let Some(first) = &result.first_scan {
        println!("  first scanned by {} at {}", first.name, first.timestamp);
    }
}
