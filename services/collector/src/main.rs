//! Collector Service - Downloads and stores raw source extracts
//!
//! Responsibilities:
//! - Fetch the tax and population extracts from public URLs (Census API, CSV)
//! - Apply rate limiting to avoid degrading source sites
//! - Hash responses to avoid redundant re-downloads
//! - Store raw files in the local raw store under predictable names
//! - Record artifact provenance in a JSON manifest
//!
//! Usage:
//!   # Single URL:
//!   cargo run --bin collector -- --source-id census-tax --url https://...
//!
//!   # From config (batch mode):
//!   cargo run --bin collector -- --config config/sources.json
//!
//!   # Specific source from config:
//!   cargo run --bin collector -- --config config/sources.json --source-id population

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(name = "collector", about = "Collects raw source extracts from public URLs")]
struct Args {
    /// Source identifier (string key)
    #[arg(long)]
    source_id: Option<String>,

    /// URL to fetch (for single-URL mode)
    #[arg(long)]
    url: Option<String>,

    /// Path to sources config file (for batch mode)
    #[arg(long)]
    config: Option<String>,

    /// Force re-download even if the content hash is unchanged
    #[arg(long, default_value = "false")]
    force: bool,

    /// Fetch and report without writing anything
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Only collect enabled sources (default: true)
    #[arg(long, default_value = "true")]
    enabled_only: bool,
}

// =============================================================================
// Source Configuration Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct SourcesConfig {
    version: String,
    sources: Vec<Source>,
}

#[derive(Debug, Deserialize)]
struct Source {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    provider: String,
    /// Declared payload format ("json" or "csv"); decides the stored extension
    format: String,
    #[serde(default)]
    urls: Vec<SourceUrl>,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct SourceUrl {
    #[serde(default)]
    year: Option<i32>,
    url: String,
    #[serde(default)]
    description: String,
}

// =============================================================================
// Raw Store Manifest
// =============================================================================
// One entry per source id, replaced wholesale on each successful fetch. This
// is the provenance record for everything in the raw store.

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactMeta {
    source_id: String,
    url: String,
    captured_at: DateTime<Utc>,
    content_hash: String,
    mime_type: String,
    size_bytes: u64,
    path: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    artifacts: Vec<ArtifactMeta>,
}

impl Manifest {
    async fn load(path: &PathBuf) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(content) => {
                serde_json::from_str(&content).context("failed to parse raw-store manifest")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).context("failed to read raw-store manifest"),
        }
    }

    async fn save(&self, path: &PathBuf) -> Result<()> {
        let body = serde_json::to_string_pretty(self)?;
        fs::write(path, body)
            .await
            .context("failed to write raw-store manifest")?;
        Ok(())
    }

    fn has_hash(&self, content_hash: &str) -> bool {
        self.artifacts.iter().any(|a| a.content_hash == content_hash)
    }

    fn upsert(&mut self, meta: ArtifactMeta) {
        match self
            .artifacts
            .iter_mut()
            .find(|a| a.source_id == meta.source_id)
        {
            Some(existing) => *existing = meta,
            None => self.artifacts.push(meta),
        }
    }
}

#[derive(Debug, Clone)]
struct Config {
    raw_dir: PathBuf,
    rate_limit_ms: u64,
}

impl Config {
    fn from_env() -> Self {
        Self {
            raw_dir: PathBuf::from(
                std::env::var("RAW_DIR").unwrap_or_else(|_| "./data/raw".to_string()),
            ),
            rate_limit_ms: std::env::var("RATE_LIMIT_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.raw_dir.join("manifest.json")
    }
}

/// Stored extension: declared source format first, response content type as
/// the fallback.
fn extension_for(format: &str, mime_type: &str) -> &'static str {
    match format {
        "json" => "json",
        "csv" => "csv",
        _ if mime_type.contains("json") => "json",
        _ if mime_type.contains("csv") => "csv",
        _ => "raw",
    }
}

// =============================================================================
// Fetching
// =============================================================================

enum FetchOutcome {
    Collected,
    Unchanged,
}

async fn fetch_source(
    client: &reqwest::Client,
    config: &Config,
    manifest: &mut Manifest,
    source_id: &str,
    url: &str,
    format: &str,
    force: bool,
    dry_run: bool,
) -> Result<FetchOutcome> {
    // Rate limit: wait before request
    println!("  Rate limit: waiting {}ms...", config.rate_limit_ms);
    sleep(Duration::from_millis(config.rate_limit_ms)).await;

    println!("  Fetching: {}", url);
    let resp = client
        .get(url)
        .send()
        .await?
        .error_for_status()
        .context("HTTP request failed")?;

    let mime_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let bytes = resp.bytes().await?;
    let size_bytes = bytes.len() as u64;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let content_hash = format!("sha256:{:x}", hasher.finalize());

    println!("  Downloaded: {} bytes, mime: {}", size_bytes, mime_type);
    println!("  Hash: {}", content_hash);

    if !force && manifest.has_hash(&content_hash) {
        println!("  Content unchanged - keeping existing artifact");
        return Ok(FetchOutcome::Unchanged);
    }

    let filename = format!("{}.{}", source_id, extension_for(format, &mime_type));
    let path = config.raw_dir.join(&filename);

    if dry_run {
        println!("  Dry run - would save to: {}", path.display());
        return Ok(FetchOutcome::Collected);
    }

    fs::create_dir_all(&config.raw_dir).await?;
    fs::write(&path, &bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("  Saved to: {}", path.display());

    manifest.upsert(ArtifactMeta {
        source_id: source_id.to_string(),
        url: url.to_string(),
        captured_at: Utc::now(),
        content_hash,
        mime_type,
        size_bytes,
        path: path.to_string_lossy().to_string(),
    });
    manifest.save(&config.manifest_path()).await?;

    Ok(FetchOutcome::Collected)
}

/// Load sources configuration from JSON file
async fn load_sources_config(path: &str) -> Result<SourcesConfig> {
    let content = fs::read_to_string(path)
        .await
        .context("Failed to read sources config")?;
    let config: SourcesConfig =
        serde_json::from_str(&content).context("Failed to parse sources config")?;
    Ok(config)
}

/// Print summary of available sources
fn print_sources_summary(sources_config: &SourcesConfig) {
    println!("\nConfigured sources:");
    println!("{:-<60}", "");
    for source in &sources_config.sources {
        let status = if source.enabled { "+" } else { "-" };
        println!(
            "  {} {} - {} [{}]",
            status, source.id, source.name, source.format
        );
        for url_entry in &source.urls {
            if let Some(year) = url_entry.year {
                println!("      - {} ({})", url_entry.description, year);
            }
        }
    }
    println!("{:-<60}", "");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env();

    println!("=== State Revenue Collector ===");
    println!("Raw store: {}", config.raw_dir.display());

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .user_agent("StateRevenueAtlas/0.1 (research dashboard; data from census.gov)")
        .build()?;

    let mut manifest = Manifest::load(&config.manifest_path()).await?;

    if let Some(config_path) = &args.config {
        // Config-based mode
        println!("Loading sources from: {}", config_path);
        let sources_config = load_sources_config(config_path).await?;
        println!("Config version: {}", sources_config.version);

        let sources: Vec<&Source> = sources_config
            .sources
            .iter()
            .filter(|s| {
                if args.enabled_only && !s.enabled {
                    return false;
                }
                if let Some(ref filter_id) = args.source_id {
                    return &s.id == filter_id;
                }
                true
            })
            .collect();

        if sources.is_empty() {
            print_sources_summary(&sources_config);
            anyhow::bail!("No sources match the filter criteria");
        }

        println!("\nProcessing {} source(s)...", sources.len());

        let mut collected = 0;
        let mut unchanged = 0;
        let mut failed = 0;

        for source in sources {
            println!("\n[{}] {}", source.id, source.name);
            println!("  Provider: {}", source.provider);
            if !source.description.is_empty() {
                println!("  {}", source.description);
            }

            for url_entry in &source.urls {
                match fetch_source(
                    &client,
                    &config,
                    &mut manifest,
                    &source.id,
                    &url_entry.url,
                    &source.format,
                    args.force,
                    args.dry_run,
                )
                .await
                {
                    Ok(FetchOutcome::Collected) => {
                        println!("  Collected: {}", source.id);
                        collected += 1;
                    }
                    Ok(FetchOutcome::Unchanged) => {
                        unchanged += 1;
                    }
                    Err(e) => {
                        eprintln!("  Failed: {:#}", e);
                        failed += 1;
                    }
                }
            }
        }

        println!("\n=== Collection Summary ===");
        println!("Collected: {}", collected);
        println!("Unchanged: {}", unchanged);
        println!("Failed: {}", failed);

        if collected == 0 && unchanged == 0 {
            anyhow::bail!("No sources were collected");
        }
    } else if let (Some(source_id), Some(url)) = (&args.source_id, &args.url) {
        // Single URL mode
        println!("Source: {}", source_id);
        println!("URL: {}", url);

        fetch_source(
            &client,
            &config,
            &mut manifest,
            source_id,
            url,
            "",
            args.force,
            args.dry_run,
        )
        .await?;

        println!("\n=== Collection Complete ===");
        println!(
            "Ready for the pipeline: cargo run --bin pipeline -- --tax {}",
            config.raw_dir.join(format!("{source_id}.json")).display()
        );
    } else {
        anyhow::bail!(
            "Must specify either:\n  \
             --config <path> for batch mode, or\n  \
             --source-id <id> --url <url> for single URL mode"
        );
    }

    Ok(())
}
