use std::fs;
use std::path::Path;
use std::process::Command;

use nuts_chains::plot::{render_normal_figure, FigureOptions};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

#[test]
fn writes_png_without_labels() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("norm.png");
    let options = FigureOptions {
        width: 400,
        height: 300,
        draw_labels: false,
        ..FigureOptions::default()
    };
    render_normal_figure(&path, &options)?;

    let bytes = fs::read(&path)?;
    assert!(bytes.starts_with(PNG_SIGNATURE));
    Ok(())
}

#[test]
fn writes_png_with_labels() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("norm.png");
    render_normal_figure(&path, &FigureOptions::default())?;

    let bytes = fs::read(&path)?;
    assert!(bytes.starts_with(PNG_SIGNATURE));
    Ok(())
}

#[test]
fn plot_binary_writes_course_figure() -> anyhow::Result<()> {
    let output = Command::new(env!("CARGO_BIN_EXE_plot_normal_distribution")).output()?;
    assert!(
        output.status.success(),
        "plot_normal_distribution failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("course_materials/img/norm.png");
    let bytes = fs::read(&path)?;
    assert!(bytes.starts_with(PNG_SIGNATURE));
    Ok(())
}
