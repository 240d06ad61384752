use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nuts_chains::plot::{render_normal_figure, FigureOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let out_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("course_materials").join("img");
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("Could not create directory {}", out_dir.display()))?;

    let path = out_dir.join("norm.png");
    render_normal_figure(&path, &FigureOptions::default())
        .with_context(|| format!("Could not write figure to {}", path.display()))?;
    info!(path = %path.display(), "Saved figure");
    Ok(())
}
