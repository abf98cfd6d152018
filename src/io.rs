use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::tga::TgaEncoder;
use image::{ColorType, DynamicImage, ImageEncoder, RgbaImage};
use kurbo::{Point, Size};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Cursor};
use std::path::Path;
use thiserror::Error;

use crate::canvas::{CHUNK_SIZE, Layer, LayerId, LayerStack, LayerTransform, TiledImage};
use crate::error::{EngineError, Result};

// ============================================================================
// EXPORT FORMATS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TiffCompression {
    None,
    #[default]
    Lzw,
    Deflate,
}

/// Target encoding of a render.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Png,
    Jpeg { quality: u8 },
    Bmp,
    Tga,
    Tiff(TiffCompression),
}

impl ExportFormat {
    /// JPEG is the only format here without an alpha channel.
    pub fn supports_alpha(&self) -> bool {
        !matches!(self, ExportFormat::Jpeg { .. })
    }

    pub fn is_lossy(&self) -> bool {
        matches!(self, ExportFormat::Jpeg { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Png => "PNG",
            ExportFormat::Jpeg { .. } => "JPEG",
            ExportFormat::Bmp => "BMP",
            ExportFormat::Tga => "TGA",
            ExportFormat::Tiff(_) => "TIFF",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Png => "image/png",
            ExportFormat::Jpeg { .. } => "image/jpeg",
            ExportFormat::Bmp => "image/bmp",
            ExportFormat::Tga => "image/x-tga",
            ExportFormat::Tiff(_) => "image/tiff",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Png => "png",
            ExportFormat::Jpeg { .. } => "jpg",
            ExportFormat::Bmp => "bmp",
            ExportFormat::Tga => "tga",
            ExportFormat::Tiff(_) => "tiff",
        }
    }

    /// Pick a format from a file extension (case-insensitive).
    pub fn from_extension(ext: &str, jpeg_quality: u8, tiff: TiffCompression) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(ExportFormat::Png),
            "jpg" | "jpeg" => Some(ExportFormat::Jpeg { quality: jpeg_quality }),
            "bmp" => Some(ExportFormat::Bmp),
            "tga" => Some(ExportFormat::Tga),
            "tif" | "tiff" => Some(ExportFormat::Tiff(tiff)),
            _ => None,
        }
    }
}

/// Encoded export bytes plus what they are.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub format: ExportFormat,
    pub width: u32,
    pub height: u32,
}

impl EncodedImage {
    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }

    pub fn extension(&self) -> &'static str {
        self.format.extension()
    }

    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, &self.bytes)
    }
}

/// Encode a raster in memory.  Alpha handling for lossy targets is the
/// caller's decision (see `compositor::encode_with_policy`); JPEG simply
/// drops the channel here.
pub fn encode_image(image: &RgbaImage, format: ExportFormat) -> Result<EncodedImage> {
    let mut bytes = Vec::new();
    let (w, h) = image.dimensions();
    let enc_err = |e: image::ImageError| EngineError::Encoding(e.to_string());

    match format {
        ExportFormat::Png => {
            PngEncoder::new(&mut bytes)
                .write_image(image.as_raw(), w, h, ColorType::Rgba8)
                .map_err(enc_err)?;
        }
        ExportFormat::Jpeg { quality } => {
            let rgb_image = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100))
                .write_image(rgb_image.as_raw(), w, h, ColorType::Rgb8)
                .map_err(enc_err)?;
        }
        ExportFormat::Bmp => {
            BmpEncoder::new(&mut bytes)
                .write_image(image.as_raw(), w, h, ColorType::Rgba8)
                .map_err(enc_err)?;
        }
        ExportFormat::Tga => {
            TgaEncoder::new(&mut bytes)
                .write_image(image.as_raw(), w, h, ColorType::Rgba8)
                .map_err(enc_err)?;
        }
        ExportFormat::Tiff(compression) => {
            let tiff_err = |e: tiff::TiffError| EngineError::Encoding(format!("TIFF encode error: {e}"));
            let mut cursor = Cursor::new(&mut bytes);
            let mut tiff_enc = tiff::encoder::TiffEncoder::new(&mut cursor).map_err(tiff_err)?;
            match compression {
                TiffCompression::None => tiff_enc
                    .write_image::<tiff::encoder::colortype::RGBA8>(w, h, image.as_raw())
                    .map_err(tiff_err)?,
                TiffCompression::Lzw => tiff_enc
                    .write_image_with_compression::<tiff::encoder::colortype::RGBA8, _>(
                        w,
                        h,
                        tiff::encoder::compression::Lzw,
                        image.as_raw(),
                    )
                    .map_err(tiff_err)?,
                TiffCompression::Deflate => tiff_enc
                    .write_image_with_compression::<tiff::encoder::colortype::RGBA8, _>(
                        w,
                        h,
                        tiff::encoder::compression::Deflate::default(),
                        image.as_raw(),
                    )
                    .map_err(tiff_err)?,
            }
        }
    }

    log::debug!("encoded {w}×{h} as {} ({} bytes)", format.name(), bytes.len());
    Ok(EncodedImage {
        bytes,
        format,
        width: w,
        height: h,
    })
}

// ============================================================================
// IMPORT
// ============================================================================

/// Decode any raster the `image` crate understands into a layer buffer.
pub fn import_image(path: &Path) -> std::result::Result<TiledImage, ProjectFileError> {
    let img = image::open(path).map_err(|e| ProjectFileError::Decode(format!("{}: {e}", path.display())))?;
    log::info!("imported {} ({}×{})", path.display(), img.width(), img.height());
    Ok(TiledImage::from_rgba_image(&img.to_rgba8())?)
}

pub fn decode_image(bytes: &[u8]) -> std::result::Result<TiledImage, ProjectFileError> {
    let img = image::load_from_memory(bytes).map_err(|e| ProjectFileError::Decode(e.to_string()))?;
    Ok(TiledImage::from_rgba_image(&img.to_rgba8())?)
}

// ============================================================================
// LCP PROJECT FILE FORMAT
// ============================================================================

/// Magic header of the tiled sparse project format.
const LCP_MAGIC_V1: &str = "LCP1";

/// Largest accepted buffer edge, guards against crafted files.
const MAX_CANVAS_DIM: u32 = 32_768;
const MAX_LAYERS: usize = 256;

/// Serializable project file.
#[derive(Serialize, Deserialize)]
pub struct ProjectFileV1 {
    magic: String,
    frame_width: f64,
    frame_height: f64,
    active_layer: Option<LayerId>,
    layers: Vec<LayerDataV1>,
}

/// Serializable layer: identity, transform fields and sparse chunks.
#[derive(Serialize, Deserialize)]
struct LayerDataV1 {
    id: LayerId,
    name: String,
    width: u32,
    height: u32,
    position: Option<(f64, f64)>,
    display_width: f64,
    display_height: f64,
    scale_x: f64,
    scale_y: f64,
    rotation: f64,
    position_z: i64,
    chunks: Vec<ChunkData>,
}

/// A single serialisable chunk (64×64 × 4 bytes = 16 384 bytes of pixel data)
#[derive(Serialize, Deserialize)]
struct ChunkData {
    cx: u32,
    cy: u32,
    pixels: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ProjectFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(String),
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<Box<bincode::ErrorKind>> for ProjectFileError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        ProjectFileError::Serialize(e.to_string())
    }
}

/// Save the stack as a project file.
pub fn save_project(stack: &LayerStack, path: &Path) -> std::result::Result<(), ProjectFileError> {
    let project = build_project(stack);
    write_project(&project, path)?;
    log::info!("saved project {} ({} layers)", path.display(), stack.len());
    Ok(())
}

/// Copy the stack into its serializable form.  Takes each layer's read
/// guard briefly; the result can be written from any thread.
pub fn build_project(stack: &LayerStack) -> ProjectFileV1 {
    let layers = stack
        .layers()
        .map(|layer| {
            let pixels = layer.pixels();
            let chunks = pixels
                .chunk_keys()
                .filter_map(|(cx, cy)| {
                    pixels.get_chunk(cx, cy).map(|chunk| ChunkData {
                        cx,
                        cy,
                        pixels: chunk.as_raw().clone(),
                    })
                })
                .collect();
            let t = layer.transform();
            LayerDataV1 {
                id: layer.id(),
                name: layer.name.clone(),
                width: pixels.width(),
                height: pixels.height(),
                position: t.position.map(|p| (p.x, p.y)),
                display_width: t.display_size.width,
                display_height: t.display_size.height,
                scale_x: t.scale_x,
                scale_y: t.scale_y,
                rotation: t.rotation,
                position_z: t.position_z,
                chunks,
            }
        })
        .collect();

    ProjectFileV1 {
        magic: LCP_MAGIC_V1.to_string(),
        frame_width: stack.frame().width,
        frame_height: stack.frame().height,
        active_layer: stack.active_layer_id(),
        layers,
    }
}

pub fn write_project(project: &ProjectFileV1, path: &Path) -> std::result::Result<(), ProjectFileError> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, project)?;
    Ok(())
}

pub fn project_to_bytes(stack: &LayerStack) -> std::result::Result<Vec<u8>, ProjectFileError> {
    Ok(bincode::serialize(&build_project(stack))?)
}

/// Load a project file into a fresh stack.
pub fn load_project(path: &Path) -> std::result::Result<LayerStack, ProjectFileError> {
    let raw = std::fs::read(path)?;
    let stack = project_from_bytes(&raw)?;
    log::info!("loaded project {} ({} layers)", path.display(), stack.len());
    Ok(stack)
}

pub fn project_from_bytes(raw: &[u8]) -> std::result::Result<LayerStack, ProjectFileError> {
    if raw.len() < 12 {
        return Err(ProjectFileError::InvalidFormat("file too small".into()));
    }
    // bincode writes a String as an 8-byte length prefix followed by UTF-8,
    // so the 4-char magic sits at bytes 8..12.
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != LCP_MAGIC_V1 {
        return Err(ProjectFileError::InvalidFormat(format!("unknown magic '{magic}'")));
    }
    let project: ProjectFileV1 = bincode::deserialize(raw)?;
    load_project_v1(project)
}

fn load_project_v1(project: ProjectFileV1) -> std::result::Result<LayerStack, ProjectFileError> {
    if project.layers.len() > MAX_LAYERS {
        return Err(ProjectFileError::InvalidFormat(format!(
            "project contains {} layers, which exceeds the maximum of {MAX_LAYERS}",
            project.layers.len()
        )));
    }
    let mut stack = LayerStack::new(Size::new(project.frame_width, project.frame_height))?;
    let expected_chunk_bytes = (CHUNK_SIZE * CHUNK_SIZE * 4) as usize;

    for ld in project.layers {
        if ld.width > MAX_CANVAS_DIM || ld.height > MAX_CANVAS_DIM {
            return Err(ProjectFileError::InvalidFormat(format!(
                "layer '{}' size {}x{} exceeds maximum allowed {MAX_CANVAS_DIM}x{MAX_CANVAS_DIM}",
                ld.name, ld.width, ld.height
            )));
        }
        let mut tiled = TiledImage::new(ld.width, ld.height)?;
        for cd in ld.chunks {
            if cd.pixels.len() != expected_chunk_bytes {
                return Err(ProjectFileError::InvalidFormat(format!(
                    "chunk ({},{}) in layer '{}' has {} bytes, expected {expected_chunk_bytes}",
                    cd.cx,
                    cd.cy,
                    ld.name,
                    cd.pixels.len(),
                )));
            }
            let chunk_img = RgbaImage::from_raw(CHUNK_SIZE, CHUNK_SIZE, cd.pixels).ok_or_else(|| {
                ProjectFileError::InvalidFormat(format!(
                    "failed to reconstruct chunk ({},{}) for layer '{}'",
                    cd.cx, cd.cy, ld.name
                ))
            })?;
            tiled.set_chunk(cd.cx, cd.cy, chunk_img)?;
        }
        let transform = LayerTransform {
            position: ld.position.map(|(x, y)| Point::new(x, y)),
            display_size: Size::new(ld.display_width, ld.display_height),
            scale_x: ld.scale_x,
            scale_y: ld.scale_y,
            rotation: ld.rotation,
            position_z: ld.position_z,
        };
        let layer = Layer::from_parts(ld.id, ld.name, tiled, transform)?;
        stack.insert_layer(layer)?;
    }

    if let Some(active) = project.active_layer
        && let Err(e) = stack.set_active_layer(Some(active))
    {
        log::warn!("ignoring stored active layer: {e}");
    }
    Ok(stack)
}
