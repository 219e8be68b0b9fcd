//! Dresses a subject in a garment with whichever provider has a key.
//!
//! Run with: `cargo run --example try_on -- <subject> <garment>`
//!
//! Requires `GOOGLE_API_KEYS` (comma separated) or `GRSAI_API_KEY`.

use std::sync::Arc;
use tryon::{Dispatcher, EncodedImage, KeyPool, ProgressReporter, Settings, TryOnImages};

#[tokio::main]
async fn main() -> tryon::Result<()> {
    let mut args = std::env::args().skip(1);
    let (Some(subject), Some(garment)) = (args.next(), args.next()) else {
        eprintln!("usage: try_on <subject> <garment>");
        std::process::exit(2);
    };

    let google_keys: Vec<String> = std::env::var("GOOGLE_API_KEYS")
        .unwrap_or_default()
        .split(',')
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();

    let mut settings = Settings::default().with_env_overrides();
    if google_keys.is_empty() {
        if settings.grsai_api_key.is_empty() {
            eprintln!("Set GOOGLE_API_KEYS or GRSAI_API_KEY.");
            std::process::exit(1);
        }
        settings.api_provider = "grsai".into();
    }
    println!("Using provider: {}", settings.api_provider);

    let dispatcher = Dispatcher::new(Arc::new(KeyPool::in_memory(google_keys)));
    let images = TryOnImages::new(
        EncodedImage::from_bytes(&std::fs::read(subject)?)?,
        EncodedImage::from_bytes(&std::fs::read(garment)?)?,
    );

    let (progress, mut events) = ProgressReporter::channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("  {:<10} {:?}", event.stage, event.percent);
        }
    });

    let result = dispatcher.generate(&settings, &images, &progress).await;
    drop(progress);
    if let Err(e) = printer.await {
        eprintln!("progress printer stopped early: {e}");
    }
    let image = result?;

    let bytes = image.fetch(&reqwest::Client::new()).await?;
    let ext = image.format().unwrap_or_default().extension();
    let filename = format!("try_on_output.{ext}");
    std::fs::write(&filename, &bytes)?;
    println!("Saved to {} ({} bytes)", filename, bytes.len());

    Ok(())
}
