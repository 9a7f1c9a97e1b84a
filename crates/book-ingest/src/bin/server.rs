//! Ingestion server binary
//!
//! Run with: cargo run -p book-ingest --bin book-ingest-server
//! Set BOOK_INGEST_CONFIG to a TOML file to override the defaults.

use book_ingest::{config::IngestConfig, render::PdftoppmRenderer, server::IngestServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "book_ingest=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!(
        r#"
╔═══════════════════════════════════════════════════════════╗
║                       Book Ingest                         ║
║        Resumable PDF Parsing with Full-Text Search        ║
╚═══════════════════════════════════════════════════════════╝
"#
    );

    // Load configuration
    let config = IngestConfig::load()?;

    tracing::info!("Configuration loaded");
    tracing::info!("  - Storage root: {}", config.storage.root.display());
    tracing::info!("  - Engine: {:?} ({})", config.engine.kind, config.engine.command);
    tracing::info!("  - Renderer: {:?} at {} dpi", config.renderer.kind, config.renderer.dpi);
    tracing::info!("  - Batch size: {}", config.processing.batch_size);
    tracing::info!("  - Workers: {}", config.processing.worker_count());

    if !PdftoppmRenderer::is_available().await {
        tracing::warn!("pdftoppm not found on PATH; page images and crops will fail");
        tracing::warn!("Install poppler-utils, or set renderer.kind = \"disabled\"");
    }

    // Create and start server
    let server = IngestServer::new(config).await?;

    println!("\nServer starting...");
    println!("  API: http://{}", server.address());
    println!("  Health: http://{}/health", server.address());
    println!("  API Info: http://{}/api", server.address());
    println!("\nEndpoints:");
    println!("  POST /api/books          - Upload a PDF");
    println!("  GET  /api/jobs/:id       - Job progress");
    println!("  GET  /api/search?q=      - Full-text search");
    println!("\nPress Ctrl+C to stop\n");

    server.start().await?;

    Ok(())
}
