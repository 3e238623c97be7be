//! XPrize embedding CLI
//!
//! Per-instance DINOv2 embeddings for COCO-labeled forest tiles.

#[cfg(feature = "cli")]
use xprize_embed::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Please rebuild with --features cli");
    std::process::exit(1);
}
