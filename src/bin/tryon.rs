//! CLI for tryon - virtual try-on image generation.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tryon::keys::mask_key;
use tryon::{
    AspectRatio, CancellationToken, Dispatcher, EncodedImage, JsonFileKeyStore, KeyPool,
    ProgressReporter, ProviderKind, Settings, TryOnImages,
};

#[derive(Parser)]
#[command(name = "tryon")]
#[command(about = "Dress a photo of a person in a garment via AI image APIs (Google, Grsai)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file
    #[arg(long, global = true, default_value = "tryon.json")]
    settings: PathBuf,

    /// Google API key pool file
    #[arg(long, global = true, default_value = "tryon-keys.json")]
    keys: PathBuf,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a try-on image
    Generate(GenerateArgs),

    /// Manage the Google API key pool
    #[command(subcommand)]
    Keys(KeysCommand),

    /// Show or change saved settings
    #[command(subcommand)]
    Settings(SettingsCommand),

    /// List available providers
    Providers,
}

#[derive(Args)]
struct GenerateArgs {
    /// Photo of the person (defaults to the saved subject photo)
    #[arg(long)]
    subject: Option<PathBuf>,

    /// Save --subject as the default subject photo
    #[arg(long, requires = "subject")]
    save_subject: bool,

    /// Photo of the garment
    #[arg(long)]
    garment: PathBuf,

    /// Output file path
    #[arg(short, long)]
    output: PathBuf,

    /// Provider to use (defaults to the settings file)
    #[arg(short, long, value_enum)]
    provider: Option<ProviderArg>,

    /// Prompt; `[garment]` marks the garment
    #[arg(long)]
    prompt: Option<String>,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Aspect ratio (e.g., 3:4, or auto)
    #[arg(long, value_parser = parse_aspect_ratio)]
    aspect_ratio: Option<AspectRatio>,
}

#[derive(Subcommand)]
enum KeysCommand {
    /// Show every key with its status
    List,
    /// Add a key
    Add { key: String },
    /// Remove a key
    Remove { key: String },
    /// Mark a key unknown so it is tried again
    Reset { key: String },
    /// Check every key not yet known to be valid
    Verify,
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Print the settings, with secrets masked
    Show,
    /// Save the photo used when `generate` gets no --subject
    Subject { path: PathBuf },
    /// Forget the saved subject photo
    ClearSubject,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProviderArg {
    Google,
    Grsai,
}

impl From<ProviderArg> for ProviderKind {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Google => ProviderKind::Google,
            ProviderArg::Grsai => ProviderKind::Grsai,
        }
    }
}

fn parse_aspect_ratio(s: &str) -> Result<AspectRatio, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tryon=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let pool = Arc::new(KeyPool::new(JsonFileKeyStore::new(&cli.keys)));

    match cli.command {
        Commands::Generate(args) => {
            generate(args, &cli.settings, pool, cli.json).await?;
        }
        Commands::Keys(command) => {
            manage_keys(command, pool, cli.json).await?;
        }
        Commands::Settings(command) => {
            manage_settings(command, &cli.settings, cli.json)?;
        }
        Commands::Providers => {
            list_providers(cli.json)?;
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> anyhow::Result<EncodedImage> {
    let bytes = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
    Ok(EncodedImage::from_bytes(&bytes)?)
}

async fn generate(
    args: GenerateArgs,
    settings_path: &Path,
    pool: Arc<KeyPool>,
    json_output: bool,
) -> anyhow::Result<()> {
    let subject = args.subject.as_deref().map(read_image).transpose()?;
    if let Some(subject) = subject.as_ref().filter(|_| args.save_subject) {
        let mut saved = Settings::load(settings_path);
        saved.model_image = Some(subject.clone());
        saved.save(settings_path)?;
        tracing::info!(path = %settings_path.display(), "saved subject photo");
    }

    let mut settings = Settings::load(settings_path).with_env_overrides();
    if let Some(provider) = args.provider {
        settings.api_provider = ProviderKind::from(provider).to_string();
    }
    if let Some(prompt) = args.prompt {
        settings.ai_params.prompt = prompt;
    }
    if let Some(temperature) = args.temperature {
        settings.ai_params.temperature = temperature;
    }
    if let Some(ratio) = args.aspect_ratio {
        settings.aspect_ratio = ratio;
    }

    let mut images = TryOnImages::from_settings(&settings, Some(read_image(&args.garment)?));
    if let Some(subject) = subject {
        images = images.with_subject(subject);
    }

    let client = reqwest::Client::new();
    let dispatcher = Dispatcher::builder()
        .key_pool(pool)
        .client(client.clone())
        .build();

    let (progress, mut events) = ProgressReporter::channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event.percent {
                Some(percent) => eprintln!("[{:>3}%] {}", percent, event.stage),
                None => eprintln!("[ -- ] {}", event.stage),
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            on_interrupt.cancel();
        }
    });

    let started = std::time::Instant::now();
    let result = dispatcher
        .generate_with_cancel(&settings, &images, &progress, &cancel)
        .await;
    drop(progress);
    join_printer(printer).await;
    let image = result?;

    let bytes = image.fetch(&client).await?;
    std::fs::write(&args.output, &bytes)?;
    let duration_ms = started.elapsed().as_millis() as u64;

    if json_output {
        let result = serde_json::json!({
            "success": true,
            "output": args.output.display().to_string(),
            "size_bytes": bytes.len(),
            "format": image.format().map(|f| f.extension()),
            "provider": settings.api_provider,
            "duration_ms": duration_ms,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!(
            "Generated image: {} ({} bytes) via {}",
            args.output.display(),
            bytes.len(),
            settings.api_provider
        );
        println!("Duration: {}ms", duration_ms);
    }

    Ok(())
}

/// Waits for the progress printer to drain. A failed printer never fails the job.
async fn join_printer(printer: tokio::task::JoinHandle<()>) {
    if let Err(e) = printer.await {
        tracing::warn!("progress printer stopped early: {e}");
    }
}

fn manage_settings(
    command: SettingsCommand,
    settings_path: &Path,
    json_output: bool,
) -> anyhow::Result<()> {
    let mut settings = Settings::load(settings_path);
    match command {
        SettingsCommand::Show => {
            let subject = settings.model_image.as_ref().map(|image| {
                let mime_type = image
                    .parse()
                    .map(|inline| inline.mime_type)
                    .unwrap_or_else(|_| "unreadable".to_string());
                format!("{} ({} bytes encoded)", mime_type, image.as_str().len())
            });
            let view = serde_json::json!({
                "apiProvider": settings.api_provider,
                "grsaiApiKey": (!settings.grsai_api_key.is_empty())
                    .then(|| mask_key(&settings.grsai_api_key)),
                "aiParams": settings.ai_params,
                "aspectRatio": settings.aspect_ratio,
                "modelImage": subject,
            });
            if json_output {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                println!("Provider:     {}", settings.api_provider);
                println!("Temperature:  {}", settings.ai_params.temperature);
                println!("Aspect ratio: {}", settings.aspect_ratio);
                println!("Prompt:       {}", settings.ai_params.prompt);
                println!("Subject:      {}", subject.as_deref().unwrap_or("not saved"));
            }
        }
        SettingsCommand::Subject { path } => {
            settings.model_image = Some(read_image(&path)?);
            settings.save(settings_path)?;
            println!("Saved subject photo from {}", path.display());
        }
        SettingsCommand::ClearSubject => {
            settings.model_image = None;
            settings.save(settings_path)?;
            println!("Cleared saved subject photo");
        }
    }
    Ok(())
}

async fn manage_keys(
    command: KeysCommand,
    pool: Arc<KeyPool>,
    json_output: bool,
) -> anyhow::Result<()> {
    match command {
        KeysCommand::List => {
            let state = pool.snapshot()?;
            if json_output {
                let keys: Vec<_> = state
                    .records
                    .iter()
                    .map(|r| serde_json::json!({"key": r.masked(), "status": r.status}))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&keys)?);
            } else if state.records.is_empty() {
                println!("No keys configured.");
            } else {
                for (idx, record) in state.records.iter().enumerate() {
                    let marker = if state.cursor == Some(idx) { "*" } else { " " };
                    println!("{} {:<16} {}", marker, record.masked(), record.status);
                }
            }
        }
        KeysCommand::Add { key } => {
            if !pool.add(&key)? {
                anyhow::bail!("key is empty or already present");
            }
            println!("Added {}", mask_key(key.trim()));
        }
        KeysCommand::Remove { key } => {
            if !pool.remove(&key)? {
                anyhow::bail!("no such key: {}", mask_key(&key));
            }
            println!("Removed {}", mask_key(&key));
        }
        KeysCommand::Reset { key } => {
            if !pool.reset(&key)? {
                anyhow::bail!("no such key: {}", mask_key(&key));
            }
            println!("Reset {}", mask_key(&key));
        }
        KeysCommand::Verify => {
            let outcomes = Dispatcher::new(pool).verify_keys().await?;
            if json_output {
                let keys: Vec<_> = outcomes
                    .iter()
                    .map(|(key, status)| serde_json::json!({"key": mask_key(key), "status": status}))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&keys)?);
            } else if outcomes.is_empty() {
                println!("Nothing to verify.");
            } else {
                for (key, status) in &outcomes {
                    println!("  {:<16} {}", mask_key(key), status);
                }
            }
        }
    }

    Ok(())
}

fn list_providers(json_output: bool) -> anyhow::Result<()> {
    #[derive(serde::Serialize)]
    struct ProviderInfo {
        name: &'static str,
        kind: &'static str,
        credentials: &'static str,
        flow: &'static str,
    }

    let providers = vec![
        ProviderInfo {
            name: "Google Gemini",
            kind: ProviderKind::Google.as_str(),
            credentials: "key pool (tryon keys add)",
            flow: "synchronous",
        },
        ProviderInfo {
            name: "Grsai Nano Banana",
            kind: ProviderKind::Grsai.as_str(),
            credentials: "grsaiApiKey setting or GRSAI_API_KEY",
            flow: "submit and poll",
        },
    ];

    if json_output {
        println!("{}", serde_json::to_string_pretty(&providers)?);
    } else {
        println!("Available providers:\n");
        for p in &providers {
            println!("  {} ({}, {})", p.name, p.kind, p.flow);
            println!("    API key: {}", p.credentials);
        }
    }

    Ok(())
}
