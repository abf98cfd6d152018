// ============================================================================
// LayerCraft CLI: headless composition and export
// ============================================================================
//
// Usage examples:
//   LayerCraft -i background.png sticker.png -o card.png
//   LayerCraft -i photo.jpg -o out.jpg --quality 85 --flatten-onto '#ffffff'
//   LayerCraft -i shots/*.png --frame 1080x1080 --render-size half -o grid.png
//   LayerCraft --project card.lcp --wand 10,10 --wand-mode erase -o cut.png
//   LayerCraft -i a.png b.png --save-project ab.lcp
//
// Every input becomes one layer, stacked in argument order (last on top).
// All processing runs synchronously on the current thread.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use image::Rgba;
use kurbo::{Point, Size};

use crate::canvas::LayerStack;
use crate::components::history::{SessionTag, SnapshotManager};
use crate::io::{self, ExportFormat, TiffCompression};
use crate::ops::compositor::{self, AlphaPolicy, RenderOptions, RenderSize};
use crate::ops::geometry;
use crate::ops::selection::SelectionScope;
use crate::ops::tools::{self, MagicWandMode, ToolAction, ToolOutcome};
use crate::settings::EngineSettings;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// LayerCraft headless layer compositor.
#[derive(Parser, Debug)]
#[command(
    name = "LayerCraft",
    about = "Stack images as layers, magic-wand edit them and export a flattened raster",
    long_about = "Stack images as transformable layers, optionally run a magic wand\n\
                  edit on the top layer, and export the flattened result as PNG, JPEG,\n\
                  BMP, TGA or TIFF, or save the layers as an .lcp project.\n\n\
                  Example:\n  \
                  LayerCraft -i background.png sticker.png -o card.png\n  \
                  LayerCraft --project card.lcp --wand 10,10 -o cut.png"
)]
pub struct CliArgs {
    /// Input image(s), stacked bottom to top. Glob patterns accepted.
    #[arg(short, long, num_args = 1..)]
    pub input: Vec<String>,

    /// Start from an .lcp project instead of (or below) the inputs.
    #[arg(long, value_name = "FILE.lcp")]
    pub project: Option<PathBuf>,

    /// Write the flattened render here.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Write the layer stack as an .lcp project.
    #[arg(long, value_name = "FILE.lcp")]
    pub save_project: Option<PathBuf>,

    /// Project frame in display units (default: first input's pixel size).
    #[arg(long, value_name = "WxH", value_parser = parse_size)]
    pub frame: Option<(u32, u32)>,

    /// Exact output size in pixels.
    #[arg(long, value_name = "WxH", value_parser = parse_size, conflicts_with = "render_size")]
    pub size: Option<(u32, u32)>,

    /// Output size relative to raw: raw, three-quarters, half, quarter, tenth, preview.
    #[arg(long, value_name = "SIZE", value_parser = parse_render_size)]
    pub render_size: Option<RenderSize>,

    /// Output format: png, jpeg, bmp, tga, tiff.
    /// When omitted, the format is inferred from --output's extension (png if it has none).
    #[arg(short, long, value_name = "FORMAT", value_parser = parse_format_name)]
    pub format: Option<String>,

    /// JPEG quality (1–100, default from settings).
    #[arg(short, long, value_name = "1-100")]
    pub quality: Option<u8>,

    /// TIFF compression mode: none, lzw, deflate (default from settings).
    #[arg(long, value_name = "MODE", value_parser = parse_tiff_compression)]
    pub tiff_compression: Option<TiffCompression>,

    /// Fill painted below every layer, e.g. '#ffffff'.
    #[arg(long, value_name = "COLOR", value_parser = parse_color)]
    pub background: Option<Rgba<u8>>,

    /// Flatten transparency onto this colour when the format has no alpha.
    #[arg(long, value_name = "COLOR", value_parser = parse_color)]
    pub flatten_onto: Option<Rgba<u8>>,

    /// Magic wand seed, in pixels of the top-most visible layer.
    #[arg(long, value_name = "X,Y", value_parser = parse_point)]
    pub wand: Option<(u32, u32)>,

    /// Magic wand tolerance in [0, 1] (default from settings).
    #[arg(long, value_name = "0-1")]
    pub tolerance: Option<f32>,

    /// erase, or fill:#rrggbb for a bucket fill.
    #[arg(long, value_name = "MODE", default_value = "erase", value_parser = parse_wand_mode)]
    pub wand_mode: MagicWandMode,

    /// Select every matching pixel, not just the connected region.
    #[arg(long)]
    pub global: bool,

    /// Debug logging and per-step timing.
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run the pipeline and return an OS exit code.
pub fn run(args: CliArgs) -> ExitCode {
    let settings = EngineSettings::load();
    match run_pipeline(&args, &settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run_pipeline(args: &CliArgs, settings: &EngineSettings) -> Result<(), String> {
    let start = Instant::now();
    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() && args.project.is_none() {
        return Err("no input files matched and no --project given".into());
    }
    if args.output.is_none() && args.save_project.is_none() {
        return Err("nothing to do: pass --output and/or --save-project".into());
    }

    // -- Step 1: Load ----------------------------------------------------
    let mut stack = load_stack(args, &inputs)?;
    if args.verbose {
        println!("  loaded {} layer(s) ({:.0}ms)", stack.len(), elapsed_ms(start));
    }

    // -- Step 2: Magic wand (optional) -----------------------------------
    if let Some(seed) = args.wand {
        let tolerance = args.tolerance.unwrap_or(settings.default_tolerance);
        let mut history = SnapshotManager::from_settings(settings);
        apply_wand(&mut stack, &mut history, seed, tolerance, args)?;
    }

    // -- Step 3: Save ----------------------------------------------------
    if let Some(path) = &args.save_project {
        io::save_project(&stack, path).map_err(|e| format!("project save failed: {e}"))?;
        println!("  → {}", path.display());
    }

    if let Some(output) = &args.output {
        let quality = args.quality.unwrap_or(settings.jpeg_quality).clamp(1, 100);
        let tiff = args.tiff_compression.unwrap_or(settings.tiff_compression);
        let format = parse_format(args.format.as_deref(), Some(output), quality, tiff)?;
        let size = match (args.size, args.render_size) {
            (Some((w, h)), _) => RenderSize::Exact(w, h),
            (None, Some(RenderSize::Preview { .. })) => RenderSize::Preview {
                max_width: settings.preview_max_width,
            },
            (None, Some(size)) => size,
            (None, None) => RenderSize::Raw,
        };
        let options = RenderOptions {
            background: args.background,
            alpha_policy: args.flatten_onto.map(AlphaPolicy::FlattenOnto).unwrap_or_default(),
        };
        let encoded = compositor::render(&stack, size, format, options).map_err(|e| format!("render failed: {e}"))?;
        encoded
            .write_to(output)
            .map_err(|e| format!("could not write '{}': {e}", output.display()))?;
        log::info!(
            "exported {}×{} {} to {}",
            encoded.width,
            encoded.height,
            encoded.mime_type(),
            output.display()
        );
        println!(
            "  → {} ({}×{}, {:.0}ms)",
            output.display(),
            encoded.width,
            encoded.height,
            elapsed_ms(start)
        );
    }
    Ok(())
}

fn load_stack(args: &CliArgs, inputs: &[PathBuf]) -> Result<LayerStack, String> {
    let mut stack = match &args.project {
        Some(path) => io::load_project(path).map_err(|e| format!("load failed: {e}"))?,
        None => {
            let frame = match args.frame {
                Some((w, h)) => Size::new(w as f64, h as f64),
                None => {
                    let first = inputs.first().ok_or("no inputs to size the frame from")?;
                    let (w, h) = image::image_dimensions(first)
                        .map_err(|e| format!("could not read '{}': {e}", first.display()))?;
                    Size::new(w as f64, h as f64)
                }
            };
            LayerStack::new(frame).map_err(|e| e.to_string())?
        }
    };

    for path in inputs {
        let pixels = io::import_image(path).map_err(|e| format!("load failed: {e}"))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Layer".to_string());
        stack
            .add_named_layer(name, pixels, None)
            .map_err(|e| format!("'{}': {e}", path.display()))?;
    }
    Ok(stack)
}

/// Run the wand on the top-most visible layer.  On failure the stack is
/// restored from the snapshot taken beforehand, active layer included.
fn apply_wand(
    stack: &mut LayerStack,
    history: &mut SnapshotManager,
    seed: (u32, u32),
    tolerance: f32,
    args: &CliArgs,
) -> Result<(), String> {
    let before = history
        .snapshot_tagged(stack, SessionTag::MagicWand, "Magic Wand")
        .map_err(|e| e.to_string())?;
    match wand_top_layer(stack, seed, tolerance, args) {
        Ok(()) => Ok(()),
        Err(e) => {
            history
                .restore(stack, before)
                .map_err(|r| format!("magic wand failed: {e}; restore failed: {r}"))?;
            log::warn!("magic wand failed, stack restored");
            Err(format!("magic wand failed: {e}"))
        }
    }
}

fn wand_top_layer(stack: &mut LayerStack, seed: (u32, u32), tolerance: f32, args: &CliArgs) -> Result<(), String> {
    let top = stack
        .visible_layers_by_z_order()
        .last()
        .map(|l| l.id())
        .ok_or("magic wand needs a visible layer")?;
    stack.set_active_layer(Some(top)).map_err(|e| e.to_string())?;
    let layer = stack.get(top).map_err(|e| e.to_string())?;
    let point = geometry::to_display_space(Point::new(seed.0 as f64 + 0.5, seed.1 as f64 + 0.5), layer);

    let action = ToolAction::MagicWand {
        point,
        tolerance,
        mode: args.wand_mode,
        scope: if args.global {
            SelectionScope::Global
        } else {
            SelectionScope::Contiguous
        },
    };
    match tools::dispatch(stack, action).map_err(|e| e.to_string())? {
        ToolOutcome::Selected { mask, .. } if args.verbose => {
            println!("  magic wand: {} pixel(s), bounds {:?}", mask.count(), mask.bounds());
            Ok(())
        }
        _ => Ok(()),
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    log::warn!("pattern '{}' matched no files", pattern);
                }
            }
            Err(e) => {
                log::warn!("invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

/// Choose the [`ExportFormat`] from the `--format` string or infer it from
/// the output file extension.  PNG when neither is given; an unknown
/// extension is an error.
fn parse_format(
    format_arg: Option<&str>,
    output: Option<&Path>,
    quality: u8,
    tiff: TiffCompression,
) -> Result<ExportFormat, String> {
    let ext = format_arg
        .map(str::to_string)
        .or_else(|| output.and_then(|o| o.extension()).map(|e| e.to_string_lossy().into_owned()));
    match ext {
        None => Ok(ExportFormat::Png),
        Some(ext) => ExportFormat::from_extension(&ext, quality, tiff)
            .ok_or_else(|| format!("cannot tell the output format from '.{ext}'; pass --format")),
    }
}

pub fn parse_format_name(s: &str) -> Result<String, String> {
    let name = s.trim().to_ascii_lowercase();
    match ExportFormat::from_extension(&name, 100, TiffCompression::None) {
        Some(_) => Ok(name),
        None => Err(format!("unknown format '{s}' (expected png, jpeg, bmp, tga or tiff)")),
    }
}

pub fn parse_tiff_compression(s: &str) -> Result<TiffCompression, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "none" => Ok(TiffCompression::None),
        "lzw" => Ok(TiffCompression::Lzw),
        "deflate" => Ok(TiffCompression::Deflate),
        _ => Err(format!("unknown TIFF compression '{s}' (expected none, lzw or deflate)")),
    }
}

pub fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got '{s}'"))?;
    let w: u32 = w.trim().parse().map_err(|_| format!("bad width in '{s}'"))?;
    let h: u32 = h.trim().parse().map_err(|_| format!("bad height in '{s}'"))?;
    if w == 0 || h == 0 {
        return Err(format!("size '{s}' is empty"));
    }
    Ok((w, h))
}

pub fn parse_point(s: &str) -> Result<(u32, u32), String> {
    let (x, y) = s.split_once(',').ok_or_else(|| format!("expected X,Y, got '{s}'"))?;
    let x = x.trim().parse().map_err(|_| format!("bad x in '{s}'"))?;
    let y = y.trim().parse().map_err(|_| format!("bad y in '{s}'"))?;
    Ok((x, y))
}

/// `#rrggbb` or `#rrggbbaa` (the `#` is optional).
pub fn parse_color(s: &str) -> Result<Rgba<u8>, String> {
    let hex = s.trim().trim_start_matches('#');
    let byte = |i: usize| {
        hex.get(i..i + 2)
            .and_then(|h| u8::from_str_radix(h, 16).ok())
            .ok_or_else(|| format!("bad colour '{s}'"))
    };
    match hex.len() {
        6 => Ok(Rgba([byte(0)?, byte(2)?, byte(4)?, 255])),
        8 => Ok(Rgba([byte(0)?, byte(2)?, byte(4)?, byte(6)?])),
        _ => Err(format!("expected #rrggbb or #rrggbbaa, got '{s}'")),
    }
}

pub fn parse_wand_mode(s: &str) -> Result<MagicWandMode, String> {
    match s.split_once(':') {
        None if s.eq_ignore_ascii_case("erase") => Ok(MagicWandMode::Erase),
        Some((mode, color)) if mode.eq_ignore_ascii_case("fill") => Ok(MagicWandMode::BucketFill(parse_color(color)?)),
        _ => Err(format!("expected 'erase' or 'fill:#rrggbb', got '{s}'")),
    }
}

pub fn parse_render_size(s: &str) -> Result<RenderSize, String> {
    RenderSize::parse(s).ok_or_else(|| format!("unknown render size '{s}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sizes_points_and_colours() {
        assert_eq!(parse_size("640x480"), Ok((640, 480)));
        assert!(parse_size("0x4").is_err());
        assert!(parse_size("640").is_err());
        assert_eq!(parse_point("3, 9"), Ok((3, 9)));
        assert_eq!(parse_color("#ff8000"), Ok(Rgba([255, 128, 0, 255])));
        assert_eq!(parse_color("00000080"), Ok(Rgba([0, 0, 0, 128])));
        assert!(parse_color("#fff").is_err());
    }

    #[test]
    fn parses_wand_modes() {
        assert_eq!(parse_wand_mode("erase"), Ok(MagicWandMode::Erase));
        assert_eq!(
            parse_wand_mode("fill:#00ff00"),
            Ok(MagicWandMode::BucketFill(Rgba([0, 255, 0, 255])))
        );
        assert!(parse_wand_mode("paint").is_err());
    }

    #[test]
    fn format_follows_flag_then_extension() {
        let out = Path::new("x.JPG");
        assert_eq!(
            parse_format(None, Some(out), 80, TiffCompression::None),
            Ok(ExportFormat::Jpeg { quality: 80 })
        );
        assert_eq!(
            parse_format(Some("tiff"), Some(out), 80, TiffCompression::Lzw),
            Ok(ExportFormat::Tiff(TiffCompression::Lzw))
        );
        assert_eq!(parse_format(None, Some(Path::new("plain")), 80, TiffCompression::None), Ok(ExportFormat::Png));
        assert!(parse_format(None, Some(Path::new("x.webp")), 80, TiffCompression::None).is_err());
    }

    #[test]
    fn unknown_format_and_compression_are_rejected() {
        let parse = |extra: &[&str]| {
            let mut argv = vec!["LayerCraft", "-i", "a.png", "-o", "b.tif"];
            argv.extend_from_slice(extra);
            CliArgs::try_parse_from(argv)
        };
        assert!(parse(&["--format", "webp"]).is_err());
        assert!(parse(&["--tiff-compression", "zip"]).is_err());
        let ok = parse(&["--format", "TIFF", "--tiff-compression", "lzw"]).unwrap();
        assert_eq!(ok.format.as_deref(), Some("tiff"));
        assert_eq!(ok.tiff_compression, Some(TiffCompression::Lzw));
    }

    #[test]
    fn failed_wand_restores_the_stack() {
        let mut stack = LayerStack::new(Size::new(4.0, 4.0)).unwrap();
        let id = stack
            .add_layer(crate::canvas::TiledImage::new_filled(4, 4, Rgba([9, 9, 9, 255])).unwrap(), None)
            .unwrap();
        let mut history = SnapshotManager::default();
        let args = CliArgs::try_parse_from(["LayerCraft", "-o", "x.png"]).unwrap();

        let err = apply_wand(&mut stack, &mut history, (40, 40), 0.0, &args).unwrap_err();
        assert!(err.starts_with("magic wand failed"));
        assert!(stack.active_layer_id().is_none());
        assert_eq!(stack.get(id).unwrap().pixels().get_pixel(0, 0)[3], 255);

        apply_wand(&mut stack, &mut history, (0, 0), 0.0, &args).unwrap();
        assert_eq!(stack.active_layer_id(), Some(id));
        assert_eq!(stack.get(id).unwrap().pixels().get_pixel(0, 0)[3], 0);
    }

    #[test]
    fn clap_definition_is_consistent() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
        let args = CliArgs::try_parse_from(["LayerCraft", "-i", "a.png", "-o", "b.png", "--render-size", "half"]).unwrap();
        assert_eq!(args.render_size, Some(RenderSize::Half));
        assert_eq!(args.wand_mode, MagicWandMode::Erase);
    }
}
