// ============================================================================
// SELECTION: magic wand flood fill, global colour select, mask edits
// ============================================================================
//
// Pixels are a 4-connected grid.  Two colours match when the largest absolute
// difference over R, G, B and A, normalised to [0, 1], is at most the
// tolerance.  Two fully transparent pixels always match.  Candidates are
// compared to the seed colour, never to a running average.

use image::{GrayImage, Luma, Rgba, RgbaImage};
use rayon::prelude::*;

use crate::canvas::{Layer, TiledImage};
use crate::error::{EngineError, Result};

/// How often (in popped pixels) a long fill checks its cancel hook.
const CANCEL_CHECK_INTERVAL: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SelectionScope {
    /// Region connected to the seed.
    #[default]
    Contiguous,
    /// Every pixel within tolerance of the seed colour.
    Global,
}

/// How a new mask combines with an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SelectionMode {
    #[default]
    Replace,
    Add,
    Subtract,
    Intersect,
}

/// Edit applied to every selected pixel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FillAction {
    Recolor(Rgba<u8>),
    Erase,
}

impl FillAction {
    fn pixel(&self) -> Rgba<u8> {
        match *self {
            FillAction::Recolor(c) => c,
            FillAction::Erase => Rgba([0, 0, 0, 0]),
        }
    }
}

// ============================================================================
// MASK
// ============================================================================

/// Per-pixel membership of a selection, same dimensions as its target buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct SelectionMask {
    width: u32,
    height: u32,
    /// 255 = selected, 0 = not selected.
    bits: Vec<u8>,
}

impl SelectionMask {
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![0; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.bits[self.index(x, y)] != 0
    }

    pub fn set(&mut self, x: u32, y: u32, selected: bool) {
        if x < self.width && y < self.height {
            let i = self.index(x, y);
            self.bits[i] = if selected { 255 } else { 0 };
        }
    }

    #[inline(always)]
    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&b| b != 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Inclusive bounding box `(min_x, min_y, max_x, max_y)`.
    pub fn bounds(&self) -> Option<(u32, u32, u32, u32)> {
        let w = self.width as usize;
        let mut bbox: Option<(u32, u32, u32, u32)> = None;
        for (i, _) in self.bits.iter().enumerate().filter(|(_, b)| **b != 0) {
            let (x, y) = ((i % w) as u32, (i / w) as u32);
            bbox = Some(match bbox {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
        bbox
    }

    /// Selected pixels in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let w = self.width as usize;
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, b)| **b != 0)
            .map(move |(i, _)| ((i % w) as u32, (i / w) as u32))
    }

    /// Merge `self` (the new mask) into `previous` according to `mode`.
    pub fn combine(&self, previous: Option<&SelectionMask>, mode: SelectionMode) -> Result<SelectionMask> {
        let Some(base) = previous else {
            return Ok(match mode {
                SelectionMode::Replace | SelectionMode::Add => self.clone(),
                SelectionMode::Subtract | SelectionMode::Intersect => Self::empty(self.width, self.height),
            });
        };
        if (base.width, base.height) != (self.width, self.height) {
            return Err(EngineError::invalid(format!(
                "mask sizes differ: {}×{} vs {}×{}",
                base.width, base.height, self.width, self.height
            )));
        }
        let bits = base
            .bits
            .iter()
            .zip(&self.bits)
            .map(|(&old, &new)| {
                let keep = match mode {
                    SelectionMode::Replace => new != 0,
                    SelectionMode::Add => old != 0 || new != 0,
                    SelectionMode::Subtract => old != 0 && new == 0,
                    SelectionMode::Intersect => old != 0 && new != 0,
                };
                if keep { 255 } else { 0 }
            })
            .collect();
        Ok(SelectionMask {
            width: self.width,
            height: self.height,
            bits,
        })
    }

    pub fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| Luma([self.bits[self.index(x, y)]]))
    }

    /// Tinted overlay for the UI: `tint` where selected, transparent elsewhere.
    pub fn overlay(&self, tint: Rgba<u8>) -> RgbaImage {
        let mut out = RgbaImage::new(self.width, self.height);
        let row_bytes = self.width as usize * 4;
        let w = self.width as usize;
        let out_raw: &mut [u8] = &mut out;
        out_raw.par_chunks_mut(row_bytes).enumerate().for_each(|(y, row)| {
            for x in 0..w {
                if self.bits[y * w + x] != 0 {
                    row[x * 4..x * 4 + 4].copy_from_slice(&tint.0);
                }
            }
        });
        out
    }
}

impl std::fmt::Debug for SelectionMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionMask")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("count", &self.count())
            .finish()
    }
}

// ============================================================================
// COLOUR MATCHING
// ============================================================================

/// Normalised colour distance in `[0, 1]`.
pub fn color_distance(a: &Rgba<u8>, b: &Rgba<u8>) -> f32 {
    if a[3] == 0 && b[3] == 0 {
        return 0.0;
    }
    let d = a.0.iter().zip(b.0.iter()).map(|(&p, &q)| p.abs_diff(q)).max().unwrap_or(0);
    d as f32 / 255.0
}

#[inline(always)]
fn matches(p: [u8; 4], seed: [u8; 4], max_diff: u8) -> bool {
    if seed[3] == 0 && p[3] == 0 {
        return true;
    }
    p.iter().zip(seed.iter()).all(|(&a, &b)| a.abs_diff(b) <= max_diff)
}

/// Largest per-channel byte difference allowed by a `[0, 1]` tolerance.
fn tolerance_to_max_diff(tolerance: f32) -> Result<u8> {
    if !(0.0..=1.0).contains(&tolerance) {
        return Err(EngineError::invalid(format!("tolerance {tolerance} is outside [0, 1]")));
    }
    // small epsilon so 0.1 * 255 = 25.5 keeps the 25 it visibly means
    Ok((tolerance * 255.0 + 1e-4).floor() as u8)
}

// ============================================================================
// SELECT / APPLY
// ============================================================================

/// Compute the selection grown from `seed` over `pixels`.
pub fn select(pixels: &TiledImage, seed: (u32, u32), tolerance: f32, scope: SelectionScope) -> Result<SelectionMask> {
    select_cancellable(pixels, seed, tolerance, scope, &|| false)
}

/// [`select`] with a cancel hook polled during the fill.  Returns
/// `Superseded` as soon as `cancelled()` reports true.
pub fn select_cancellable(
    pixels: &TiledImage,
    seed: (u32, u32),
    tolerance: f32,
    scope: SelectionScope,
    cancelled: &(dyn Fn() -> bool + Sync),
) -> Result<SelectionMask> {
    let (w, h) = pixels.dimensions();
    if seed.0 >= w || seed.1 >= h {
        return Err(EngineError::out_of_bounds(seed.0 as f64, seed.1 as f64, w, h));
    }
    let max_diff = tolerance_to_max_diff(tolerance)?;
    let flat = pixels.to_rgba_image();
    let seed_color = flat.get_pixel(seed.0, seed.1).0;
    let bits = match scope {
        SelectionScope::Contiguous => flood_fill(flat.as_raw(), seed, seed_color, max_diff, w, h, cancelled)?,
        SelectionScope::Global => global_select(flat.as_raw(), seed_color, max_diff, w, cancelled)?,
    };
    let mask = SelectionMask { width: w, height: h, bits };
    log::debug!(
        "select seed=({}, {}) tol={tolerance} scope={scope:?}: {} px",
        seed.0,
        seed.1,
        mask.count()
    );
    Ok(mask)
}

/// DFS over packed flat indices; the mask doubles as the visited set.
fn flood_fill(
    flat: &[u8],
    seed: (u32, u32),
    seed_color: [u8; 4],
    max_diff: u8,
    w: u32,
    h: u32,
    cancelled: &(dyn Fn() -> bool + Sync),
) -> Result<Vec<u8>> {
    let wu = w as usize;
    let hu = h as usize;
    let mut mask = vec![0u8; wu * hu];

    #[inline(always)]
    fn pix(flat: &[u8], idx: usize) -> [u8; 4] {
        let o = idx * 4;
        [flat[o], flat[o + 1], flat[o + 2], flat[o + 3]]
    }

    let seed_idx = seed.1 as usize * wu + seed.0 as usize;
    let mut stack: Vec<usize> = Vec::with_capacity(4096);
    mask[seed_idx] = 255;
    stack.push(seed_idx);

    let mut popped = 0usize;
    while let Some(idx) = stack.pop() {
        popped += 1;
        if popped % CANCEL_CHECK_INTERVAL == 0 && cancelled() {
            return Err(EngineError::Superseded);
        }
        let x = idx % wu;
        let y = idx / wu;

        let mut visit = |ni: usize| {
            if mask[ni] == 0 && matches(pix(flat, ni), seed_color, max_diff) {
                mask[ni] = 255;
                stack.push(ni);
            }
        };
        if x > 0 {
            visit(idx - 1);
        }
        if x + 1 < wu {
            visit(idx + 1);
        }
        if y > 0 {
            visit(idx - wu);
        }
        if y + 1 < hu {
            visit(idx + wu);
        }
    }
    Ok(mask)
}

fn global_select(
    flat: &[u8],
    seed_color: [u8; 4],
    max_diff: u8,
    w: u32,
    cancelled: &(dyn Fn() -> bool + Sync),
) -> Result<Vec<u8>> {
    let wu = w as usize;
    let rows: Vec<Option<Vec<u8>>> = flat
        .par_chunks(wu * 4)
        .map(|row| {
            if cancelled() {
                return None;
            }
            Some(
                row.chunks_exact(4)
                    .map(|p| if matches([p[0], p[1], p[2], p[3]], seed_color, max_diff) { 255 } else { 0 })
                    .collect(),
            )
        })
        .collect();
    let mut bits = Vec::with_capacity(flat.len() / 4);
    for row in rows {
        bits.extend(row.ok_or(EngineError::Superseded)?);
    }
    Ok(bits)
}

/// Overwrite every selected pixel.  Returns the number of pixels written.
/// Transform fields are untouched; a size mismatch changes nothing.
pub fn apply(mask: &SelectionMask, pixels: &mut TiledImage, action: FillAction) -> Result<usize> {
    if (mask.width, mask.height) != pixels.dimensions() {
        return Err(EngineError::invalid(format!(
            "mask is {}×{} but buffer is {}×{}",
            mask.width,
            mask.height,
            pixels.width(),
            pixels.height()
        )));
    }
    let px = action.pixel();
    let mut written = 0;
    for (x, y) in mask.iter() {
        pixels.put_pixel(x, y, px);
        written += 1;
    }
    Ok(written)
}

/// Select on a layer's buffer and apply `action` under one write guard, so no
/// other edit can interleave between the two steps.
pub fn fill_layer(
    layer: &Layer,
    seed: (u32, u32),
    tolerance: f32,
    scope: SelectionScope,
    action: FillAction,
) -> Result<SelectionMask> {
    let mut pixels = layer.pixels_mut();
    let mask = select(&pixels, seed, tolerance, scope)?;
    apply(&mask, &mut pixels, action)?;
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);

    /// 6×6 red image with a blue vertical wall at x = 3.
    fn walled() -> TiledImage {
        let mut img = TiledImage::new_filled(6, 6, RED).unwrap();
        for y in 0..6 {
            img.put_pixel(3, y, BLUE);
        }
        img
    }

    #[test]
    fn uniform_buffer_selects_everything_at_zero_tolerance() {
        let img = TiledImage::new_filled(4, 4, RED).unwrap();
        let mask = select(&img, (2, 1), 0.0, SelectionScope::Contiguous).unwrap();
        assert_eq!(mask.count(), 16);
        assert_eq!(mask.bounds(), Some((0, 0, 3, 3)));
    }

    #[test]
    fn wall_stops_contiguous_fill_but_not_global() {
        let img = walled();
        let left = select(&img, (0, 0), 0.1, SelectionScope::Contiguous).unwrap();
        assert_eq!(left.count(), 18);
        assert!(!left.contains(4, 0));
        let all = select(&img, (0, 0), 0.1, SelectionScope::Global).unwrap();
        assert_eq!(all.count(), 30);
    }

    #[test]
    fn diagonal_neighbours_are_not_connected() {
        let mut img = TiledImage::new_filled(3, 3, BLUE).unwrap();
        img.put_pixel(0, 0, RED);
        img.put_pixel(1, 1, RED);
        let mask = select(&img, (0, 0), 0.0, SelectionScope::Contiguous).unwrap();
        assert_eq!(mask.count(), 1);
    }

    #[test]
    fn tolerance_is_normalised_per_channel() {
        let mut img = TiledImage::new_filled(2, 1, Rgba([100, 100, 100, 255])).unwrap();
        img.put_pixel(1, 0, Rgba([125, 100, 100, 255]));
        assert_eq!(select(&img, (0, 0), 0.1, SelectionScope::Contiguous).unwrap().count(), 2);
        assert_eq!(select(&img, (0, 0), 0.09, SelectionScope::Contiguous).unwrap().count(), 1);
    }

    #[test]
    fn transparent_pixels_match_regardless_of_colour() {
        let mut img = TiledImage::new(2, 1).unwrap();
        img.put_pixel(1, 0, Rgba([40, 50, 60, 0]));
        assert_eq!(select(&img, (0, 0), 0.0, SelectionScope::Contiguous).unwrap().count(), 2);
        assert_eq!(color_distance(&Rgba([1, 2, 3, 0]), &Rgba([200, 0, 0, 0])), 0.0);
    }

    #[test]
    fn seed_outside_buffer_fails() {
        let img = walled();
        assert!(matches!(
            select(&img, (6, 0), 0.1, SelectionScope::Contiguous),
            Err(EngineError::OutOfBounds { .. })
        ));
        assert!(select(&img, (0, 0), 1.5, SelectionScope::Contiguous).is_err());
    }

    #[test]
    fn select_is_deterministic() {
        let img = walled();
        let a = select(&img, (5, 5), 0.2, SelectionScope::Contiguous).unwrap();
        let b = select(&img, (5, 5), 0.2, SelectionScope::Contiguous).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn recolor_then_reselect_keeps_region() {
        let mut img = walled();
        let first = select(&img, (0, 0), 0.1, SelectionScope::Contiguous).unwrap();
        let green = Rgba([0, 200, 0, 255]);
        assert_eq!(apply(&first, &mut img, FillAction::Recolor(green)).unwrap(), 18);
        let second = select(&img, (0, 0), 0.1, SelectionScope::Contiguous).unwrap();
        assert_eq!(first, second);
        assert_eq!(img.get_pixel(2, 5), &green);
        assert_eq!(img.get_pixel(4, 5), &RED);
    }

    #[test]
    fn erase_clears_alpha() {
        let mut img = walled();
        let wall = select(&img, (3, 0), 0.0, SelectionScope::Contiguous).unwrap();
        apply(&wall, &mut img, FillAction::Erase).unwrap();
        assert_eq!(img.get_pixel(3, 2)[3], 0);
        assert_eq!(img.get_pixel(2, 2), &RED);
    }

    #[test]
    fn apply_rejects_mismatched_mask() {
        let mut img = walled();
        let mask = SelectionMask::empty(2, 2);
        let before = img.clone();
        assert!(apply(&mask, &mut img, FillAction::Erase).is_err());
        assert_eq!(img, before);
    }

    #[test]
    fn combine_modes() {
        let mut a = SelectionMask::empty(2, 1);
        a.set(0, 0, true);
        let mut b = SelectionMask::empty(2, 1);
        b.set(0, 0, true);
        b.set(1, 0, true);
        assert_eq!(b.combine(Some(&a), SelectionMode::Add).unwrap().count(), 2);
        assert_eq!(a.combine(Some(&b), SelectionMode::Subtract).unwrap().iter().collect::<Vec<_>>(), vec![(1, 0)]);
        assert_eq!(b.combine(Some(&a), SelectionMode::Intersect).unwrap().count(), 1);
        assert_eq!(a.combine(None, SelectionMode::Intersect).unwrap().count(), 0);
        assert!(a.combine(Some(&SelectionMask::empty(3, 3)), SelectionMode::Add).is_err());
    }

    #[test]
    fn cancelled_fill_reports_superseded() {
        let img = TiledImage::new_filled(256, 256, RED).unwrap();
        let result = select_cancellable(&img, (0, 0), 0.0, SelectionScope::Contiguous, &|| true);
        assert_eq!(result, Err(EngineError::Superseded));
        let result = select_cancellable(&img, (0, 0), 0.0, SelectionScope::Global, &|| true);
        assert_eq!(result, Err(EngineError::Superseded));
    }

    #[test]
    fn overlay_tints_selected_pixels() {
        let img = walled();
        let mask = select(&img, (3, 0), 0.0, SelectionScope::Contiguous).unwrap();
        let tint = Rgba([0, 120, 255, 128]);
        let overlay = mask.overlay(tint);
        assert_eq!(overlay.get_pixel(3, 4), &tint);
        assert_eq!(overlay.get_pixel(0, 4)[3], 0);
        assert_eq!(mask.to_gray_image().get_pixel(3, 4)[0], 255);
    }
}
