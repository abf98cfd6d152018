// ============================================================================
// COMPOSITOR: flatten visible layers into one raster, then encode
// ============================================================================

use std::sync::{PoisonError, RwLockReadGuard};

use image::{Rgba, RgbaImage};
use kurbo::{Affine, Point, Rect, Size, Vec2};
use rayon::prelude::*;

use crate::canvas::{Layer, LayerStack, LayerTransform, MAX_PIXELS, SharedPixels, TiledImage};
use crate::error::{EngineError, Result};
use crate::io::{self, EncodedImage, ExportFormat};
use crate::ops::geometry;

/// Output size of a render, resolved against the raw export size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderSize {
    /// Raw size shrunk to at most `max_width` pixels wide, aspect kept.
    Preview { max_width: u32 },
    Raw,
    ThreeQuarters,
    Half,
    Quarter,
    Tenth,
    Exact(u32, u32),
}

impl RenderSize {
    fn factor(&self) -> Option<f64> {
        match self {
            RenderSize::Raw => Some(1.0),
            RenderSize::ThreeQuarters => Some(0.75),
            RenderSize::Half => Some(0.5),
            RenderSize::Quarter => Some(0.25),
            RenderSize::Tenth => Some(0.1),
            RenderSize::Preview { .. } | RenderSize::Exact(..) => None,
        }
    }

    /// Parse the CLI spelling (`raw`, `half`, `0.25`, `preview`, ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "1" | "1.0" | "full" => Some(RenderSize::Raw),
            "three-quarters" | "0.75" => Some(RenderSize::ThreeQuarters),
            "half" | "0.5" => Some(RenderSize::Half),
            "quarter" | "0.25" => Some(RenderSize::Quarter),
            "tenth" | "0.1" => Some(RenderSize::Tenth),
            "preview" => Some(RenderSize::Preview { max_width: 1024 }),
            _ => None,
        }
    }
}

/// What to do when the target format cannot store transparency.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum AlphaPolicy {
    /// Fail with `Encoding` if any output pixel has alpha < 255.
    #[default]
    Reject,
    /// Composite the output over this colour before encoding.
    FlattenOnto(Rgba<u8>),
}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct RenderOptions {
    /// Fill painted below every layer.  `None` = transparent.
    pub background: Option<Rgba<u8>>,
    pub alpha_policy: AlphaPolicy,
}

// ============================================================================
// SCENE: a detached view of the stack for (possibly off-thread) rendering
// ============================================================================

struct SceneLayer {
    pixels: SharedPixels,
    pixel_size: (u32, u32),
    transform: LayerTransform,
}

impl SceneLayer {
    fn of(layer: &Layer) -> Self {
        Self {
            pixels: layer.shared_pixels(),
            pixel_size: layer.pixel_size(),
            transform: *layer.transform(),
        }
    }
}

/// Visible layers in paint order plus the frame, detached from the stack.
///
/// Capturing clones only buffer handles and transforms.  Rendering holds each
/// layer's read guard for the duration of the pass, so a concurrent selection
/// edit waits instead of tearing the image.
pub struct RenderScene {
    frame: Size,
    /// Display-space centre of the rendered window; the origin for a stack.
    centre: Point,
    layers: Vec<SceneLayer>,
}

impl RenderScene {
    pub fn capture(stack: &LayerStack) -> Self {
        let layers = stack
            .visible_layers_by_z_order()
            .into_iter()
            .map(SceneLayer::of)
            .collect();
        Self {
            frame: stack.frame(),
            centre: Point::ZERO,
            layers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Frame expressed in the pixel density of the top-most visible layer,
    /// or one pixel per display unit when nothing is visible.
    pub fn raw_size(&self) -> (u32, u32) {
        let (rx, ry) = self
            .layers
            .last()
            .map(|l| geometry::pixel_to_display_ratio(&l.transform, l.pixel_size))
            .unwrap_or((1.0, 1.0));
        (
            ((self.frame.width / rx).round() as u32).max(1),
            ((self.frame.height / ry).round() as u32).max(1),
        )
    }

    pub fn resolve_size(&self, size: RenderSize) -> Result<(u32, u32)> {
        let (raw_w, raw_h) = self.raw_size();
        let (w, h) = match size {
            RenderSize::Exact(w, h) => (w, h),
            RenderSize::Preview { max_width } => {
                let w = raw_w.min(max_width.max(1));
                let h = (raw_h as f64 * w as f64 / raw_w as f64).round() as u32;
                (w, h.max(1))
            }
            other => {
                let k = other.factor().unwrap_or(1.0);
                (
                    ((raw_w as f64 * k).round() as u32).max(1),
                    ((raw_h as f64 * k).round() as u32).max(1),
                )
            }
        };
        if w == 0 || h == 0 {
            return Err(EngineError::invalid(format!("render size {w}×{h} is empty")));
        }
        if w as u64 * h as u64 > MAX_PIXELS {
            return Err(EngineError::CapacityExceeded(format!(
                "render size {w}×{h} exceeds {MAX_PIXELS} pixels"
            )));
        }
        Ok((w, h))
    }

    pub fn composite(&self, size: (u32, u32), background: Option<Rgba<u8>>) -> Result<RgbaImage> {
        self.composite_cancellable(size, background, &|| false)
    }

    /// Paint every layer back to front into a fresh `size` raster.  Polls
    /// `cancelled` once per output row and stops with `Superseded`.
    pub fn composite_cancellable(
        &self,
        size: (u32, u32),
        background: Option<Rgba<u8>>,
        cancelled: &(dyn Fn() -> bool + Sync),
    ) -> Result<RgbaImage> {
        let (out_w, out_h) = size;
        if out_w == 0 || out_h == 0 {
            return Err(EngineError::invalid(format!("render size {out_w}×{out_h} is empty")));
        }
        if out_w as u64 * out_h as u64 > MAX_PIXELS {
            return Err(EngineError::CapacityExceeded(format!(
                "render size {out_w}×{out_h} exceeds {MAX_PIXELS} pixels"
            )));
        }

        // output pixel space → display space
        let origin = self.centre.to_vec2() - Vec2::new(self.frame.width * 0.5, self.frame.height * 0.5);
        let out_to_display = Affine::translate(origin)
            * Affine::scale_non_uniform(self.frame.width / out_w as f64, self.frame.height / out_h as f64);

        let guards: Vec<RwLockReadGuard<'_, TiledImage>> = self
            .layers
            .iter()
            .map(|l| l.pixels.read().unwrap_or_else(PoisonError::into_inner))
            .collect();

        let passes: Vec<LayerPass<'_>> = self
            .layers
            .iter()
            .zip(guards.iter())
            .filter_map(|(layer, pixels)| LayerPass::new(layer, pixels, out_to_display, size))
            .collect();

        let fill = background.unwrap_or(Rgba([0, 0, 0, 0]));
        let mut out = RgbaImage::from_pixel(out_w, out_h, fill);
        let row_bytes = out_w as usize * 4;
        let out_raw: &mut [u8] = &mut out;

        out_raw
            .par_chunks_mut(row_bytes)
            .enumerate()
            .try_for_each(|(oy, row)| {
                if cancelled() {
                    return Err(EngineError::Superseded);
                }
                let oy = oy as u32;
                for pass in &passes {
                    pass.paint_row(oy, row);
                }
                Ok(())
            })?;

        log::debug!("composited {} layer(s) into {out_w}×{out_h}", passes.len());
        Ok(out)
    }
}

/// One layer's sampling setup for a composite pass.
struct LayerPass<'a> {
    pixels: &'a TiledImage,
    /// output pixel coordinates → layer pixel coordinates, `[a, b, c, d, e, f]`
    coeffs: [f64; 6],
    src_w: f64,
    src_h: f64,
    /// Output pixels the layer can touch, inclusive-exclusive.
    cols: (u32, u32),
    rows: (u32, u32),
}

impl<'a> LayerPass<'a> {
    fn new(layer: &SceneLayer, pixels: &'a TiledImage, out_to_display: Affine, out: (u32, u32)) -> Option<Self> {
        let to_display = geometry::layer_affine(&layer.transform, layer.pixel_size);
        let out_to_src = to_display.inverse() * out_to_display;
        if !out_to_src.is_finite() {
            return None;
        }

        // bounding box of the layer in output pixels
        let to_out = out_to_display.inverse() * to_display;
        let (w, h) = (layer.pixel_size.0 as f64, layer.pixel_size.1 as f64);
        let pts = [
            Point::new(0.0, 0.0),
            Point::new(w, 0.0),
            Point::new(w, h),
            Point::new(0.0, h),
        ]
        .map(|p| to_out * p);
        let min_x = pts.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
        let max_x = pts.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
        let min_y = pts.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
        let max_y = pts.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
        let clamp = |v: f64, hi: u32| v.max(0.0).min(hi as f64) as u32;
        let cols = (clamp(min_x.floor(), out.0), clamp(max_x.ceil(), out.0));
        let rows = (clamp(min_y.floor(), out.1), clamp(max_y.ceil(), out.1));
        if cols.0 >= cols.1 || rows.0 >= rows.1 {
            return None;
        }

        Some(Self {
            pixels,
            coeffs: out_to_src.as_coeffs(),
            src_w: w,
            src_h: h,
            cols,
            rows,
        })
    }

    /// Nearest-neighbour sample at each output pixel centre, blended "over".
    fn paint_row(&self, oy: u32, row: &mut [u8]) {
        if oy < self.rows.0 || oy >= self.rows.1 {
            return;
        }
        let [a, b, c, d, e, f] = self.coeffs;
        let v = oy as f64 + 0.5;
        let base_x = c * v + e;
        let base_y = d * v + f;
        for ox in self.cols.0..self.cols.1 {
            let u = ox as f64 + 0.5;
            let sx = a * u + base_x;
            let sy = b * u + base_y;
            if !(sx >= 0.0 && sy >= 0.0 && sx < self.src_w && sy < self.src_h) {
                continue;
            }
            let src = *self.pixels.get_pixel(sx as u32, sy as u32);
            let px = ox as usize * 4;
            let dst = Rgba([row[px], row[px + 1], row[px + 2], row[px + 3]]);
            row[px..px + 4].copy_from_slice(&blend_over(dst, src).0);
        }
    }
}

/// Straight-alpha "over": `src` painted on top of `dst`.
pub fn blend_over(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    if src[3] == 0 {
        return dst;
    }
    if src[3] == 255 || dst[3] == 0 {
        return src;
    }
    let sa = src[3] as f32 / 255.0;
    let da = dst[3] as f32 / 255.0;
    let out_a = sa + da * (1.0 - sa);
    let mut out = [0u8; 4];
    for i in 0..3 {
        let s = src[i] as f32 / 255.0;
        let d = dst[i] as f32 / 255.0;
        let v = (s * sa + d * da * (1.0 - sa)) / out_a;
        out[i] = (v * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    out[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgba(out)
}

/// Composite `img` over an opaque `color` in place.
pub fn flatten_onto(img: &mut RgbaImage, color: Rgba<u8>) {
    let base = Rgba([color[0], color[1], color[2], 255]);
    let raw: &mut [u8] = img;
    raw.par_chunks_mut(4).for_each(|px| {
        let out = blend_over(base, Rgba([px[0], px[1], px[2], px[3]]));
        px.copy_from_slice(&out.0);
    });
}

// ============================================================================
// PUBLIC ENTRY POINTS
// ============================================================================

/// Flatten the stack into a raster of the requested size.
pub fn composite(stack: &LayerStack, size: RenderSize, background: Option<Rgba<u8>>) -> Result<RgbaImage> {
    let scene = RenderScene::capture(stack);
    let dims = scene.resolve_size(size)?;
    scene.composite(dims, background)
}

/// Paint `layers` back to front, whatever their visibility, into one buffer
/// covering their joint display bounds.  The buffer uses the finest pixel
/// density among the layers.  Returns the buffer and the bounds it covers.
pub fn flatten_layers(layers: &[&Layer]) -> Result<(TiledImage, Rect)> {
    let mut ordered = layers.to_vec();
    ordered.sort_by_key(|l| l.transform().depth());

    let mut bounds: Option<Rect> = None;
    let mut density: f64 = 0.0;
    for layer in &ordered {
        for corner in geometry::corners(layer) {
            bounds = Some(match bounds {
                Some(r) => r.union_pt(corner),
                None => Rect::from_points(corner, corner),
            });
        }
        let (rx, ry) = layer.pixel_to_display_ratio();
        let (sx, sy) = layer.scale();
        density = density.max(1.0 / (rx * sx.abs())).max(1.0 / (ry * sy.abs()));
    }
    let bounds = bounds.ok_or_else(|| EngineError::invalid("no layers to flatten"))?;

    // shave float noise so an exact fit does not grow by a pixel
    let extent = |v: f64| (((v * density) - 1e-6).ceil().max(1.0)).min(u32::MAX as f64) as u32;
    let size = (extent(bounds.width()), extent(bounds.height()));
    let scene = RenderScene {
        frame: bounds.size(),
        centre: bounds.center(),
        layers: ordered.into_iter().map(SceneLayer::of).collect(),
    };
    let raster = scene.composite(size, None)?;
    Ok((TiledImage::from_rgba_image(&raster)?, bounds))
}

/// Cheap interactive preview: at most `max_width` pixels wide.
pub fn render_preview(stack: &LayerStack, max_width: u32) -> Result<RgbaImage> {
    composite(stack, RenderSize::Preview { max_width }, None)
}

/// Flatten and encode.  Nothing in the stack is modified, so a failure
/// leaves all state as it was.
pub fn render(stack: &LayerStack, size: RenderSize, format: ExportFormat, options: RenderOptions) -> Result<EncodedImage> {
    let img = composite(stack, size, options.background)?;
    encode_with_policy(img, format, options.alpha_policy)
}

/// Apply the alpha policy for `format`, then encode.
pub fn encode_with_policy(mut img: RgbaImage, format: ExportFormat, policy: AlphaPolicy) -> Result<EncodedImage> {
    if !format.supports_alpha() && img.pixels().any(|p| p[3] < 255) {
        match policy {
            AlphaPolicy::Reject => {
                return Err(EngineError::Encoding(format!(
                    "{} cannot store transparency; choose a background to flatten onto",
                    format.name()
                )));
            }
            AlphaPolicy::FlattenOnto(color) => flatten_onto(&mut img, color),
        }
    }
    io::encode_image(&img, format)
}
