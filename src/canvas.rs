use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use image::{Rgba, RgbaImage};
use kurbo::{Point, Size};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::ops::compositor;
use crate::ops::geometry::{self, FlipAxis, Quadrant};

/// Largest buffer we agree to allocate (pixels per layer or per render).
pub const MAX_PIXELS: u64 = 256_000_000;

// ============================================================================
// TILED IMAGE – sparse 64×64 chunk storage (Vec-indexed for speed)
// ============================================================================

pub const CHUNK_SIZE: u32 = 64;

/// A pixel with zero alpha, returned by reference for missing chunks.
static TRANSPARENT_PIXEL: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Sparse tiled RGBA buffer backed by a flat `Vec<Option<Arc<RgbaImage>>>`.
/// Chunk coordinates are mapped to a flat index via `cy * chunks_per_row + cx`.
///
/// Chunks are wrapped in `Arc` for copy-on-write: `clone()` only bumps
/// reference counts and `put_pixel` uses `Arc::make_mut` to copy just the
/// touched chunk. Use [`TiledImage::deep_clone`] when the copy must not share
/// any storage with the original (snapshots).
#[derive(Clone)]
pub struct TiledImage {
    width: u32,
    height: u32,
    chunks_per_row: u32,
    chunks: Vec<Option<Arc<RgbaImage>>>,
}

impl TiledImage {
    // ---- construction -------------------------------------------------------

    /// Create an empty (fully transparent) tiled image.
    ///
    /// Dimensions are immutable for the lifetime of the buffer; zero-sized or
    /// oversized requests are rejected instead of clamped.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        check_dimensions(width, height)?;
        let chunks_per_row = width.div_ceil(CHUNK_SIZE);
        let chunks_per_col = height.div_ceil(CHUNK_SIZE);
        let total = (chunks_per_row * chunks_per_col) as usize;
        Ok(Self {
            width,
            height,
            chunks_per_row,
            chunks: vec![None; total],
        })
    }

    /// Fill the entire image with `color`.  A transparent fill costs nothing.
    pub fn new_filled(width: u32, height: u32, color: Rgba<u8>) -> Result<Self> {
        let mut img = Self::new(width, height)?;
        if color[3] > 0 {
            img.fill(color);
        }
        Ok(img)
    }

    /// Import from a flat `RgbaImage`.  Only non-transparent chunks are stored.
    /// Chunk conversion is parallelised with rayon for faster import of large images.
    pub fn from_rgba_image(src: &RgbaImage) -> Result<Self> {
        let width = src.width();
        let height = src.height();
        let mut img = Self::new(width, height)?;

        let chunks_x = img.chunks_per_row as usize;
        let chunks_y = height.div_ceil(CHUNK_SIZE) as usize;
        let src_raw = src.as_raw();

        let chunk_results: Vec<(usize, Option<Arc<RgbaImage>>)> = (0..chunks_x * chunks_y)
            .into_par_iter()
            .map(|flat| {
                let cx = (flat % chunks_x) as u32;
                let cy = (flat / chunks_x) as u32;
                let base_x = cx * CHUNK_SIZE;
                let base_y = cy * CHUNK_SIZE;

                let cw = CHUNK_SIZE.min(width - base_x);
                let ch = CHUNK_SIZE.min(height - base_y);
                let chunk_stride = CHUNK_SIZE as usize * 4;
                let mut chunk_data = vec![0u8; chunk_stride * CHUNK_SIZE as usize];
                let mut has_content = false;

                for ly in 0..ch {
                    let src_start = ((base_y + ly) * width + base_x) as usize * 4;
                    let dst_start = ly as usize * chunk_stride;
                    let byte_len = cw as usize * 4;
                    chunk_data[dst_start..dst_start + byte_len]
                        .copy_from_slice(&src_raw[src_start..src_start + byte_len]);

                    if !has_content {
                        has_content = chunk_data[dst_start..dst_start + byte_len]
                            .chunks_exact(4)
                            .any(|px| px[3] != 0);
                    }
                }

                let chunk = has_content
                    .then(|| RgbaImage::from_raw(CHUNK_SIZE, CHUNK_SIZE, chunk_data))
                    .flatten()
                    .map(Arc::new);
                (flat, chunk)
            })
            .collect();

        for (idx, chunk) in chunk_results {
            img.chunks[idx] = chunk;
        }
        Ok(img)
    }

    /// Flatten back to a contiguous `RgbaImage`.
    pub fn to_rgba_image(&self) -> RgbaImage {
        let mut out = RgbaImage::new(self.width, self.height);
        let out_stride = self.width as usize * 4;
        let out_raw: &mut [u8] = &mut out;
        for (cx, cy) in self.chunk_keys() {
            if let Some(chunk) = self.get_chunk(cx, cy) {
                let base_x = cx * CHUNK_SIZE;
                let base_y = cy * CHUNK_SIZE;
                let cw = CHUNK_SIZE.min(self.width - base_x) as usize;
                let ch = CHUNK_SIZE.min(self.height - base_y) as usize;
                let chunk_raw = chunk.as_raw();
                let chunk_stride = CHUNK_SIZE as usize * 4;
                for ly in 0..ch {
                    let src_start = ly * chunk_stride;
                    let dst_start = (base_y as usize + ly) * out_stride + base_x as usize * 4;
                    out_raw[dst_start..dst_start + cw * 4]
                        .copy_from_slice(&chunk_raw[src_start..src_start + cw * 4]);
                }
            }
        }
        out
    }

    /// Copy that shares no chunk storage with `self`.
    pub fn deep_clone(&self) -> Self {
        Self {
            width: self.width,
            height: self.height,
            chunks_per_row: self.chunks_per_row,
            chunks: self
                .chunks
                .iter()
                .map(|slot| slot.as_ref().map(|c| Arc::new(RgbaImage::clone(c))))
                .collect(),
        }
    }

    // ---- indexing helpers ----------------------------------------------------

    #[inline(always)]
    fn flat_index(&self, cx: u32, cy: u32) -> usize {
        (cy * self.chunks_per_row + cx) as usize
    }

    #[inline(always)]
    fn chunk_coord(x: u32, y: u32) -> (u32, u32) {
        (x / CHUNK_SIZE, y / CHUNK_SIZE)
    }

    #[inline(always)]
    fn local(x: u32, y: u32) -> (u32, u32) {
        (x % CHUNK_SIZE, y % CHUNK_SIZE)
    }

    // ---- pixel access -------------------------------------------------------

    /// Read a pixel (returns `&TRANSPARENT_PIXEL` for missing chunks or
    /// coordinates outside the buffer).
    #[inline]
    pub fn get_pixel(&self, x: u32, y: u32) -> &Rgba<u8> {
        if x >= self.width || y >= self.height {
            return &TRANSPARENT_PIXEL;
        }
        let (cx, cy) = Self::chunk_coord(x, y);
        let (lx, ly) = Self::local(x, y);
        self.chunks[self.flat_index(cx, cy)]
            .as_ref()
            .map(|c| c.get_pixel(lx, ly))
            .unwrap_or(&TRANSPARENT_PIXEL)
    }

    /// Write a pixel (creates the chunk on demand, COW-clones if shared).
    /// Writes outside the buffer are ignored.
    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: Rgba<u8>) {
        if x >= self.width || y >= self.height {
            return;
        }
        let (cx, cy) = Self::chunk_coord(x, y);
        let (lx, ly) = Self::local(x, y);
        let idx = self.flat_index(cx, cy);
        if pixel == TRANSPARENT_PIXEL && self.chunks[idx].is_none() {
            return;
        }
        let arc = self.chunks[idx].get_or_insert_with(|| Arc::new(RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE)));
        Arc::make_mut(arc).put_pixel(lx, ly, pixel);
    }

    pub fn get_chunk(&self, cx: u32, cy: u32) -> Option<&RgbaImage> {
        let idx = self.flat_index(cx, cy);
        self.chunks.get(idx)?.as_deref()
    }

    /// Install a full 64×64 chunk.  Out-of-range coordinates and chunks of
    /// the wrong size are rejected.
    pub fn set_chunk(&mut self, cx: u32, cy: u32, chunk: RgbaImage) -> Result<()> {
        if chunk.dimensions() != (CHUNK_SIZE, CHUNK_SIZE) {
            return Err(EngineError::invalid(format!(
                "chunk must be {CHUNK_SIZE}×{CHUNK_SIZE}, got {}×{}",
                chunk.width(),
                chunk.height()
            )));
        }
        if cx >= self.chunks_per_row || cy >= self.height.div_ceil(CHUNK_SIZE) {
            return Err(EngineError::out_of_bounds(
                (cx * CHUNK_SIZE) as f64,
                (cy * CHUNK_SIZE) as f64,
                self.width,
                self.height,
            ));
        }
        let idx = self.flat_index(cx, cy);
        self.chunks[idx] = Some(Arc::new(chunk));
        Ok(())
    }

    /// Coordinates of every populated chunk, row-major.
    pub fn chunk_keys(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let cpr = self.chunks_per_row;
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(move |(i, _)| (i as u32 % cpr, i as u32 / cpr))
    }

    pub fn fill(&mut self, color: Rgba<u8>) {
        let chunk = Arc::new(RgbaImage::from_pixel(CHUNK_SIZE, CHUNK_SIZE, color));
        for slot in self.chunks.iter_mut() {
            *slot = Some(Arc::clone(&chunk));
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Bytes held by populated chunks (shared chunks are counted once per owner).
    pub fn memory_bytes(&self) -> usize {
        self.chunks.iter().flatten().count() * (CHUNK_SIZE * CHUNK_SIZE * 4) as usize
    }

    /// True when every pixel is fully opaque.
    pub fn is_opaque(&self) -> bool {
        (0..self.height).all(|y| (0..self.width).all(|x| self.get_pixel(x, y)[3] == 255))
    }
}

impl PartialEq for TiledImage {
    /// Content equality: a missing chunk equals a chunk of transparent zeros.
    fn eq(&self, other: &Self) -> bool {
        if self.dimensions() != other.dimensions() {
            return false;
        }
        self.chunks.iter().zip(other.chunks.iter()).all(|(a, b)| match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a.as_raw() == b.as_raw(),
            (Some(c), None) | (None, Some(c)) => c.as_raw().iter().all(|&v| v == 0),
        })
    }
}

impl fmt::Debug for TiledImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TiledImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("chunks", &self.chunks.iter().flatten().count())
            .finish()
    }
}

fn check_dimensions(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(EngineError::invalid(format!("buffer size {width}×{height} is empty")));
    }
    let total = width as u64 * height as u64;
    if total > MAX_PIXELS {
        return Err(EngineError::CapacityExceeded(format!(
            "buffer size {width}×{height} exceeds {MAX_PIXELS} pixels"
        )));
    }
    Ok(())
}

// ============================================================================
// LAYER
// ============================================================================

/// Stable per-layer identity.  Layers are compared and looked up by id,
/// never by index, since indices shift on reorder and filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(Uuid);

impl LayerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }

    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl Default for LayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Pixel storage guarded for exclusive writes.  Selection edits take the write
/// side; rendering and snapshots take the read side.
pub type SharedPixels = Arc<RwLock<TiledImage>>;

/// Geometric state of a layer, in display units.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LayerTransform {
    /// Layer centre relative to the frame centre.  `None` until placed.
    pub position: Option<Point>,
    /// On-screen size of the unscaled layer.
    pub display_size: Size,
    /// Signed scale factors; the sign encodes mirroring.  Never zero.
    pub scale_x: f64,
    pub scale_y: f64,
    /// Radians, clockwise on screen.  Any value; see [`geometry::normalized_rotation`].
    pub rotation: f64,
    /// `|position_z|` is the stacking depth, the sign is visibility
    /// (positive = visible, negative = hidden at the same depth).  Never zero.
    pub position_z: i64,
}

impl LayerTransform {
    pub fn is_visible(&self) -> bool {
        self.position_z > 0
    }

    pub fn depth(&self) -> u64 {
        self.position_z.unsigned_abs()
    }

    fn validate(&self) -> Result<()> {
        if !(self.scale_x.is_finite() && self.scale_y.is_finite()) || self.scale_x == 0.0 || self.scale_y == 0.0 {
            return Err(EngineError::invalid(format!(
                "scale ({}, {}) must be finite and non-zero",
                self.scale_x, self.scale_y
            )));
        }
        if !(self.display_size.width > 0.0 && self.display_size.height > 0.0)
            || !self.display_size.is_finite()
        {
            return Err(EngineError::invalid(format!(
                "display size {}×{} must be positive",
                self.display_size.width, self.display_size.height
            )));
        }
        if !self.rotation.is_finite() {
            return Err(EngineError::invalid("rotation must be finite"));
        }
        if let Some(p) = self.position
            && !p.is_finite()
        {
            return Err(EngineError::invalid("position must be finite"));
        }
        if self.position_z == 0 || self.position_z == i64::MIN {
            return Err(EngineError::invalid("position_z must be a non-zero depth"));
        }
        Ok(())
    }
}

/// One transformable image unit in a project.
pub struct Layer {
    id: LayerId,
    pub name: String,
    pixels: SharedPixels,
    pixel_size: (u32, u32),
    transform: LayerTransform,
}

impl Layer {
    /// Assemble a layer from stored parts (persistence, snapshot restore).
    pub fn from_parts(id: LayerId, name: String, pixels: TiledImage, transform: LayerTransform) -> Result<Self> {
        transform.validate()?;
        Ok(Self {
            id,
            name,
            pixel_size: pixels.dimensions(),
            pixels: Arc::new(RwLock::new(pixels)),
            transform,
        })
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn pixel_size(&self) -> (u32, u32) {
        self.pixel_size
    }

    pub fn transform(&self) -> &LayerTransform {
        &self.transform
    }

    pub fn position(&self) -> Option<Point> {
        self.transform.position
    }

    pub fn display_size(&self) -> Size {
        self.transform.display_size
    }

    pub fn scale(&self) -> (f64, f64) {
        (self.transform.scale_x, self.transform.scale_y)
    }

    pub fn rotation(&self) -> f64 {
        self.transform.rotation
    }

    pub fn position_z(&self) -> i64 {
        self.transform.position_z
    }

    pub fn is_visible(&self) -> bool {
        self.transform.is_visible()
    }

    /// `display_size / pixel_size` per axis: display units covered by one pixel.
    pub fn pixel_to_display_ratio(&self) -> (f64, f64) {
        geometry::pixel_to_display_ratio(&self.transform, self.pixel_size)
    }

    /// Shared read access to the pixel buffer.
    pub fn pixels(&self) -> RwLockReadGuard<'_, TiledImage> {
        self.pixels.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive write access to the pixel buffer.  Blocks while a render or
    /// selection job holds the buffer.
    pub fn pixels_mut(&self) -> RwLockWriteGuard<'_, TiledImage> {
        self.pixels.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle to the guarded buffer for worker jobs.
    pub fn shared_pixels(&self) -> SharedPixels {
        Arc::clone(&self.pixels)
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pixel_size", &self.pixel_size)
            .field("transform", &self.transform)
            .finish()
    }
}

// ============================================================================
// LAYER STACK
// ============================================================================

/// Ordered (by insertion) set of layers plus the active-layer relation.
///
/// Z-order is derived from `|position_z|`, never from insertion order.  All
/// depth magnitudes are pairwise distinct.  Every mutation takes `&mut self`,
/// so no operation can observe another half-applied.
pub struct LayerStack {
    layers: Vec<Layer>,
    active: Option<LayerId>,
    /// Display size of the project frame (the exported area).
    frame: Size,
}

impl LayerStack {
    pub fn new(frame: Size) -> Result<Self> {
        if !(frame.width > 0.0 && frame.height > 0.0) || !frame.is_finite() {
            return Err(EngineError::invalid(format!(
                "frame size {}×{} must be positive",
                frame.width, frame.height
            )));
        }
        Ok(Self {
            layers: Vec::new(),
            active: None,
            frame,
        })
    }

    pub fn frame(&self) -> Size {
        self.frame
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layers in insertion order.
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    pub fn get(&self, id: LayerId) -> Result<&Layer> {
        self.layers
            .iter()
            .find(|l| l.id == id)
            .ok_or(EngineError::UnknownLayer(id))
    }

    fn get_mut(&mut self, id: LayerId) -> Result<&mut Layer> {
        self.layers
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(EngineError::UnknownLayer(id))
    }

    fn max_depth(&self) -> u64 {
        self.layers.iter().map(|l| l.transform.depth()).max().unwrap_or(0)
    }

    fn next_depth(&self) -> Result<i64> {
        i64::try_from(self.max_depth() + 1)
            .map_err(|_| EngineError::CapacityExceeded("layer depth range exhausted".into()))
    }

    /// Add a decoded asset as a new, visible, top-most layer.
    ///
    /// The display size is the pixel size aspect-fitted into the frame.
    pub fn add_layer(&mut self, pixels: TiledImage, position: Option<Point>) -> Result<LayerId> {
        let name = format!("Layer {}", self.layers.len() + 1);
        self.add_named_layer(name, pixels, position)
    }

    pub fn add_named_layer(&mut self, name: String, pixels: TiledImage, position: Option<Point>) -> Result<LayerId> {
        let transform = LayerTransform {
            position,
            display_size: geometry::aspect_fit(pixels.dimensions(), self.frame),
            scale_x: 1.0,
            scale_y: 1.0,
            rotation: 0.0,
            position_z: self.next_depth()?,
        };
        let id = LayerId::new();
        let layer = Layer::from_parts(id, name, pixels, transform)?;
        log::debug!(
            "add layer {} ({}×{}) at depth {}",
            id,
            layer.pixel_size.0,
            layer.pixel_size.1,
            transform.position_z
        );
        self.layers.push(layer);
        Ok(id)
    }

    /// Insert a fully-formed layer (persistence load).  Rejects duplicate ids
    /// and depth magnitudes that collide with an existing layer.
    pub fn insert_layer(&mut self, layer: Layer) -> Result<LayerId> {
        if self.layers.iter().any(|l| l.id == layer.id) {
            return Err(EngineError::invalid(format!("duplicate layer id {}", layer.id)));
        }
        let depth = layer.transform.depth();
        if self.layers.iter().any(|l| l.transform.depth() == depth) {
            return Err(EngineError::invalid(format!("depth {depth} is already taken")));
        }
        let id = layer.id;
        self.layers.push(layer);
        Ok(id)
    }

    /// Copy a layer, buffer included, into a new top-most layer.  The copy
    /// keeps the source's transform and visibility.
    pub fn duplicate_layer(&mut self, id: LayerId) -> Result<LayerId> {
        let source = self.get(id)?;
        let depth = self.next_depth()?;
        let mut transform = source.transform;
        transform.position_z = if source.is_visible() { depth } else { -depth };
        let pixels = source.pixels().deep_clone();
        let copy = Layer::from_parts(LayerId::new(), format!("{} copy", source.name), pixels, transform)?;
        let copy_id = copy.id;
        log::debug!("duplicate layer {id} as {copy_id} at depth {depth}");
        self.layers.push(copy);
        Ok(copy_id)
    }

    /// Flatten two or more visible layers into one new layer that takes the
    /// highest merged depth.  The sources are removed.  If one of them was
    /// active, the merged layer becomes active.
    pub fn merge_layers(&mut self, ids: &[LayerId]) -> Result<LayerId> {
        let mut unique: Vec<LayerId> = Vec::with_capacity(ids.len());
        for &id in ids {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        if unique.len() < 2 {
            return Err(EngineError::invalid("merging needs at least two distinct layers"));
        }
        let sources = unique.iter().map(|&id| self.get(id)).collect::<Result<Vec<&Layer>>>()?;
        if let Some(hidden) = sources.iter().find(|l| !l.is_visible()) {
            return Err(EngineError::invalid(format!("hidden layer {} cannot be merged", hidden.id)));
        }
        let top = sources.iter().map(|l| l.transform.depth()).max().unwrap_or(1);
        let (pixels, bounds) = compositor::flatten_layers(&sources)?;

        let transform = LayerTransform {
            position: Some(bounds.center()),
            display_size: bounds.size(),
            scale_x: 1.0,
            scale_y: 1.0,
            rotation: 0.0,
            position_z: i64::try_from(top).map_err(|_| EngineError::invalid("merged depth out of range"))?,
        };
        let merged = Layer::from_parts(LayerId::new(), "Merged".to_string(), pixels, transform)?;
        let merged_id = merged.id;
        let was_active = self.active.is_some_and(|a| unique.contains(&a));

        self.layers.retain(|l| !unique.contains(&l.id));
        self.layers.push(merged);
        if was_active {
            self.active = Some(merged_id);
        }
        log::debug!("merged {} layer(s) into {merged_id} at depth {top}", unique.len());
        Ok(merged_id)
    }

    /// Remove a layer.  Remaining depths are not renumbered.
    pub fn remove_layer(&mut self, id: LayerId) -> Result<Layer> {
        let idx = self
            .layers
            .iter()
            .position(|l| l.id == id)
            .ok_or(EngineError::UnknownLayer(id))?;
        if self.active == Some(id) {
            self.active = None;
        }
        log::debug!("remove layer {id}");
        Ok(self.layers.remove(idx))
    }

    /// Negate `position_z`.  Returns the new visibility.
    pub fn toggle_visibility(&mut self, id: LayerId) -> Result<bool> {
        let layer = self.get_mut(id)?;
        layer.transform.position_z = -layer.transform.position_z;
        let visible = layer.transform.is_visible();
        if !visible && self.active == Some(id) {
            self.active = None;
        }
        Ok(visible)
    }

    /// Exchange the `position_z` values of two layers, signs included.  A
    /// layer that ends up hidden stops being active.
    pub fn swap_order(&mut self, a: LayerId, b: LayerId) -> Result<()> {
        if a == b {
            return Err(EngineError::invalid("cannot swap a layer with itself"));
        }
        let ia = self.layers.iter().position(|l| l.id == a).ok_or(EngineError::UnknownLayer(a))?;
        let ib = self.layers.iter().position(|l| l.id == b).ok_or(EngineError::UnknownLayer(b))?;
        let za = self.layers[ia].transform.position_z;
        self.layers[ia].transform.position_z = self.layers[ib].transform.position_z;
        self.layers[ib].transform.position_z = za;
        if let Some(active) = self.active
            && (active == a || active == b)
            && !self.get(active)?.is_visible()
        {
            self.active = None;
        }
        Ok(())
    }

    /// Swap with the next layer towards the back in the visible sequence.
    /// Returns `false` when the layer is already the back-most.
    pub fn move_backward(&mut self, id: LayerId) -> Result<bool> {
        self.swap_with_visible_neighbour(id, -1)
    }

    /// Swap with the next layer towards the front in the visible sequence.
    /// Returns `false` when the layer is already the front-most.
    pub fn move_forward(&mut self, id: LayerId) -> Result<bool> {
        self.swap_with_visible_neighbour(id, 1)
    }

    fn swap_with_visible_neighbour(&mut self, id: LayerId, step: isize) -> Result<bool> {
        if !self.get(id)?.is_visible() {
            return Err(EngineError::invalid(format!("layer {id} is hidden")));
        }
        let order: Vec<LayerId> = self.visible_layers_by_z_order().iter().map(|l| l.id).collect();
        let Some(pos) = order.iter().position(|&l| l == id) else {
            return Ok(false);
        };
        let Some(neighbour) = pos.checked_add_signed(step).and_then(|n| order.get(n)) else {
            return Ok(false);
        };
        self.swap_order(id, *neighbour)?;
        Ok(true)
    }

    /// Put the layer above every other layer, make it visible and active.
    pub fn bring_to_front(&mut self, id: LayerId) -> Result<()> {
        let top = self.get(id)?.transform.depth();
        if top != self.max_depth() || !self.get(id)?.is_visible() {
            let depth = if top == self.max_depth() { top as i64 } else { self.next_depth()? };
            self.get_mut(id)?.transform.position_z = depth;
        }
        self.active = Some(id);
        Ok(())
    }

    /// Select the layer tools act on.  Hidden layers cannot be active.
    pub fn set_active_layer(&mut self, id: Option<LayerId>) -> Result<()> {
        if let Some(id) = id
            && !self.get(id)?.is_visible()
        {
            return Err(EngineError::invalid(format!("hidden layer {id} cannot be active")));
        }
        self.active = id;
        Ok(())
    }

    pub fn active_layer(&self) -> Option<&Layer> {
        self.active.and_then(|id| self.get(id).ok())
    }

    pub fn active_layer_id(&self) -> Option<LayerId> {
        self.active
    }

    /// Mirror the layer along its visual horizontal or vertical axis, picking
    /// the scale component from the layer's rotation at call time.
    pub fn flip(&mut self, id: LayerId, axis: FlipAxis) -> Result<()> {
        let layer = self.get_mut(id)?;
        let t = &mut layer.transform;
        let toggle_x = match (axis, geometry::quadrant_of(t.rotation)) {
            (FlipAxis::VisualHorizontal, Quadrant::Horizontal) => true,
            (FlipAxis::VisualHorizontal, Quadrant::Vertical) => false,
            (FlipAxis::VisualVertical, Quadrant::Horizontal) => false,
            (FlipAxis::VisualVertical, Quadrant::Vertical) => true,
        };
        if toggle_x {
            t.scale_x = -t.scale_x;
        } else {
            t.scale_y = -t.scale_y;
        }
        Ok(())
    }

    pub fn set_position(&mut self, id: LayerId, position: Option<Point>) -> Result<()> {
        self.update_transform(id, |t| t.position = position)
    }

    pub fn set_rotation(&mut self, id: LayerId, radians: f64) -> Result<()> {
        self.update_transform(id, |t| t.rotation = radians)
    }

    pub fn set_scale(&mut self, id: LayerId, scale_x: f64, scale_y: f64) -> Result<()> {
        self.update_transform(id, |t| {
            t.scale_x = scale_x;
            t.scale_y = scale_y;
        })
    }

    pub fn set_display_size(&mut self, id: LayerId, size: Size) -> Result<()> {
        self.update_transform(id, |t| t.display_size = size)
    }

    /// Apply `edit` to a copy of the transform and commit it only if valid.
    fn update_transform(&mut self, id: LayerId, edit: impl FnOnce(&mut LayerTransform)) -> Result<()> {
        let layer = self.get_mut(id)?;
        let mut next = layer.transform;
        edit(&mut next);
        next.validate()?;
        layer.transform = next;
        Ok(())
    }

    /// Visible layers, back to front (ascending `|position_z|`).  This is the
    /// canonical paint order.
    pub fn visible_layers_by_z_order(&self) -> Vec<&Layer> {
        let mut visible: Vec<&Layer> = self.layers.iter().filter(|l| l.is_visible()).collect();
        visible.sort_by_key(|l| l.transform.depth());
        visible
    }

    /// Every layer, hidden included, front first (layer-panel order).
    pub fn layers_by_depth(&self) -> Vec<&Layer> {
        let mut all: Vec<&Layer> = self.layers.iter().collect();
        all.sort_by_key(|l| std::cmp::Reverse(l.transform.depth()));
        all
    }

    /// Top-most visible layer whose transformed bounds contain `point`.
    pub fn hit_test(&self, point: Point) -> Option<LayerId> {
        self.visible_layers_by_z_order()
            .into_iter()
            .rev()
            .find(|l| geometry::contains_display_point(l, point))
            .map(|l| l.id)
    }

    /// Replace every layer and the active relation at once.  On error the
    /// stack is left untouched.
    pub(crate) fn replace_layers(&mut self, frame: Size, layers: Vec<Layer>, active: Option<LayerId>) -> Result<()> {
        let mut depths: Vec<u64> = layers.iter().map(|l| l.transform.depth()).collect();
        depths.sort_unstable();
        if depths.windows(2).any(|w| w[0] == w[1]) {
            return Err(EngineError::invalid("layer depths are not unique"));
        }
        let active = active.filter(|id| layers.iter().any(|l| l.id == *id && l.is_visible()));
        self.frame = frame;
        self.layers = layers;
        self.active = active;
        Ok(())
    }
}
