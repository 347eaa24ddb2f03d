//! chromaswap — replace a color in a binary pixel-map image, on the GPU.
//!
//! Usage:
//!   chromaswap input.ppm 255,255,255 0,0,0
//!   chromaswap input.ppm 200,10,10 0,0,255 --threshold 400
//!   chromaswap input.ppm 255,255,255 0,0,0 --cpu
//!
//! The result is always written to `recolored.ppm` in the working
//! directory. Colors are comma-separated `r,g,b` triples; the threshold
//! is in squared-distance units (sum of squared channel differences).

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chroma_swap::{
    ppm, Color, CpuRecolorEngine, GpuRecolorEngine, RecolorBackend, RecolorConfig,
};

use std::path::PathBuf;

/// Fixed destination for the recolored image.
const OUTPUT_PATH: &str = "recolored.ppm";

#[derive(Parser)]
#[command(name = "chromaswap")]
#[command(about = "Replace a color in a binary PPM image using a GPU compute kernel")]
struct Cli {
    /// Input pixel-map file (binary RGB, magic "P6")
    input: PathBuf,

    /// Color to replace, as r,g,b (0-255 each)
    #[arg(value_parser = parse_color)]
    target: Color,

    /// Color to substitute, as r,g,b (0-255 each)
    #[arg(value_parser = parse_color)]
    replacement: Color,

    /// Squared-distance threshold: pixels whose sum of squared channel
    /// differences from the target is within this value are replaced
    #[arg(long, default_value_t = 1.0)]
    threshold: f32,

    /// Run the CPU reference kernel instead of the GPU
    #[arg(long)]
    cpu: bool,
}

/// Parse an `r,g,b` triple. The core assumes already-validated colors, so
/// all validation happens here at the command surface.
fn parse_color(s: &str) -> Result<Color, String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("expected r,g,b (got {s:?})"));
    }
    let channel = |p: &str| {
        p.trim()
            .parse::<u8>()
            .map_err(|_| format!("channel {p:?} is not an integer in 0-255"))
    };
    Ok(Color::new(channel(parts[0])?, channel(parts[1])?, channel(parts[2])?))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut image = ppm::decode(&cli.input)
        .with_context(|| format!("failed to decode {}", cli.input.display()))?;
    info!(
        width = image.width(),
        height = image.height(),
        "decoded input image"
    );

    let config = RecolorConfig::new(cli.target, cli.replacement, cli.threshold);

    let backend: Box<dyn RecolorBackend> = if cli.cpu {
        Box::new(CpuRecolorEngine)
    } else {
        let engine = GpuRecolorEngine::new().context("failed to initialize GPU backend")?;
        info!(device = %engine.device(), "using GPU backend");
        Box::new(engine)
    };

    backend
        .apply(&mut image, &config)
        .context("recolor pass failed")?;

    ppm::encode(&image, OUTPUT_PATH)
        .with_context(|| format!("failed to write {OUTPUT_PATH}"))?;
    info!(output = OUTPUT_PATH, "wrote recolored image");

    Ok(())
}
