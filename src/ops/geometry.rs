// ============================================================================
// GEOMETRY: display space ↔ pixel space mapping for transformed layers
// ============================================================================
//
// Display space has its origin at the centre of the project frame, x to the
// right, y down.  Rotations are radians, clockwise on screen.  A layer maps
// its pixel grid into display space by
//
//     translate(position) · rotate(θ) · scale(sx·rx, sy·ry) · translate(-centre)
//
// where (rx, ry) is the pixel-to-display ratio and `centre` is the middle of
// the pixel buffer.  Unplaced layers sit at the frame centre.

use std::f64::consts::{FRAC_PI_4, TAU};

use kurbo::{Affine, Point, Size, Vec2};

use crate::canvas::{Layer, LayerTransform};
use crate::error::{EngineError, Result};

/// Which visual axis a flip gesture mirrors across.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlipAxis {
    VisualHorizontal,
    VisualVertical,
}

/// Dominant orientation of a rotated layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quadrant {
    /// Buffer x axis still reads roughly horizontal on screen.
    Horizontal,
    /// Rotated into `(π/4, 3π/4) ∪ (5π/4, 7π/4)`: axes appear swapped.
    Vertical,
}

/// Wrap any finite angle into `[0, 2π)`.
pub fn normalized_rotation(angle: f64) -> f64 {
    let r = angle.rem_euclid(TAU);
    // rem_euclid can round up to exactly TAU for tiny negative inputs
    if r >= TAU { 0.0 } else { r }
}

pub fn quadrant_of(rotation: f64) -> Quadrant {
    let r = normalized_rotation(rotation);
    let vertical = (r > FRAC_PI_4 && r < 3.0 * FRAC_PI_4) || (r > 5.0 * FRAC_PI_4 && r < 7.0 * FRAC_PI_4);
    if vertical { Quadrant::Vertical } else { Quadrant::Horizontal }
}

/// `display_size / pixel_size` per axis.
pub fn pixel_to_display_ratio(t: &LayerTransform, pixel_size: (u32, u32)) -> (f64, f64) {
    (
        t.display_size.width / pixel_size.0 as f64,
        t.display_size.height / pixel_size.1 as f64,
    )
}

/// Largest size with the aspect of `pixel_size` that fits inside `frame`.
pub fn aspect_fit(pixel_size: (u32, u32), frame: Size) -> Size {
    let (w, h) = (pixel_size.0 as f64, pixel_size.1 as f64);
    let k = (frame.width / w).min(frame.height / h);
    Size::new(w * k, h * k)
}

/// Pixel space → display space for a layer with the given transform.
pub fn layer_affine(t: &LayerTransform, pixel_size: (u32, u32)) -> Affine {
    let (rx, ry) = pixel_to_display_ratio(t, pixel_size);
    let centre = Vec2::new(pixel_size.0 as f64 * 0.5, pixel_size.1 as f64 * 0.5);
    let position = t.position.unwrap_or(Point::ZERO).to_vec2();
    Affine::translate(position)
        * Affine::rotate(t.rotation)
        * Affine::scale_non_uniform(t.scale_x * rx, t.scale_y * ry)
        * Affine::translate(-centre)
}

/// Map a display-space point to (fractional) pixel coordinates of `layer`.
///
/// Fails with `OutOfBounds` when the result is outside `[0, pixel_size)`.
pub fn to_pixel_space(display_point: Point, layer: &Layer) -> Result<Point> {
    let (w, h) = layer.pixel_size();
    let p = layer_affine(layer.transform(), (w, h)).inverse() * display_point;
    if p.x >= 0.0 && p.y >= 0.0 && p.x < w as f64 && p.y < h as f64 {
        Ok(p)
    } else {
        Err(EngineError::out_of_bounds(p.x, p.y, w, h))
    }
}

/// Integer pixel under a display point.
pub fn pixel_at(display_point: Point, layer: &Layer) -> Result<(u32, u32)> {
    let p = to_pixel_space(display_point, layer)?;
    Ok((p.x.floor() as u32, p.y.floor() as u32))
}

/// Inverse of [`to_pixel_space`]; no bounds check.
pub fn to_display_space(pixel_point: Point, layer: &Layer) -> Point {
    layer_affine(layer.transform(), layer.pixel_size()) * pixel_point
}

/// Display-space apexes of the transformed layer, in buffer order
/// top-left, top-right, bottom-right, bottom-left.
pub fn corners(layer: &Layer) -> [Point; 4] {
    let (w, h) = layer.pixel_size();
    let a = layer_affine(layer.transform(), (w, h));
    let (w, h) = (w as f64, h as f64);
    [
        a * Point::new(0.0, 0.0),
        a * Point::new(w, 0.0),
        a * Point::new(w, h),
        a * Point::new(0.0, h),
    ]
}

pub fn contains_display_point(layer: &Layer, point: Point) -> bool {
    to_pixel_space(point, layer).is_ok()
}

#[cfg(test)]
mod tests {
    use std::f64::consts::{FRAC_PI_2, PI};

    use image::Rgba;

    use super::*;
    use crate::canvas::{LayerId, TiledImage};

    fn layer(w: u32, h: u32, t: LayerTransform) -> Layer {
        let px = TiledImage::new_filled(w, h, Rgba([0, 0, 0, 255])).unwrap();
        Layer::from_parts(LayerId::new(), "t".into(), px, t).unwrap()
    }

    fn transform(display: Size) -> LayerTransform {
        LayerTransform {
            position: None,
            display_size: display,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation: 0.0,
            position_z: 1,
        }
    }

    fn close(a: Point, b: Point) -> bool {
        (a - b).hypot() < 1e-9
    }

    #[test]
    fn normalizes_into_half_open_range() {
        assert_eq!(normalized_rotation(0.0), 0.0);
        assert!((normalized_rotation(-FRAC_PI_2) - 3.0 * FRAC_PI_2).abs() < 1e-12);
        assert!((normalized_rotation(5.0 * PI) - PI).abs() < 1e-12);
        assert_eq!(normalized_rotation(TAU), 0.0);
        assert!(normalized_rotation(-1e-20) < TAU);
    }

    #[test]
    fn quadrant_boundaries_are_open() {
        assert_eq!(quadrant_of(0.0), Quadrant::Horizontal);
        assert_eq!(quadrant_of(FRAC_PI_4), Quadrant::Horizontal);
        assert_eq!(quadrant_of(FRAC_PI_2), Quadrant::Vertical);
        assert_eq!(quadrant_of(PI), Quadrant::Horizontal);
        assert_eq!(quadrant_of(-FRAC_PI_2), Quadrant::Vertical);
        assert_eq!(quadrant_of(7.0 * FRAC_PI_4 - 1e-3), Quadrant::Vertical);
    }

    #[test]
    fn identity_layer_maps_centre_to_centre() {
        let l = layer(10, 20, transform(Size::new(10.0, 20.0)));
        let p = to_pixel_space(Point::ZERO, &l).unwrap();
        assert!(close(p, Point::new(5.0, 10.0)));
        let p = to_pixel_space(Point::new(-4.5, -9.5), &l).unwrap();
        assert!(close(p, Point::new(0.5, 0.5)));
    }

    #[test]
    fn ratio_and_position_are_applied() {
        let mut t = transform(Size::new(50.0, 50.0));
        t.position = Some(Point::new(10.0, 0.0));
        let l = layer(100, 100, t);
        assert_eq!(l.pixel_to_display_ratio(), (0.5, 0.5));
        // one display unit right of the layer centre is two pixels
        let p = to_pixel_space(Point::new(11.0, 0.0), &l).unwrap();
        assert!(close(p, Point::new(52.0, 50.0)));
    }

    #[test]
    fn rotation_and_mirroring_invert_cleanly() {
        let mut t = transform(Size::new(8.0, 4.0));
        t.rotation = FRAC_PI_2;
        t.scale_x = -2.0;
        let l = layer(8, 4, t);
        let px = Point::new(1.25, 3.5);
        let shown = to_display_space(px, &l);
        assert!(close(to_pixel_space(shown, &l).unwrap(), px));
    }

    #[test]
    fn quarter_turn_moves_top_left_corner() {
        let mut t = transform(Size::new(4.0, 2.0));
        t.rotation = FRAC_PI_2;
        let l = layer(4, 2, t);
        let c = corners(&l);
        // clockwise quarter turn in a y-down frame: (-2, -1) → (1, -2)
        assert!(close(c[0], Point::new(1.0, -2.0)));
    }

    #[test]
    fn outside_points_fail() {
        let l = layer(4, 4, transform(Size::new(4.0, 4.0)));
        assert!(matches!(
            to_pixel_space(Point::new(2.0, 0.0), &l),
            Err(EngineError::OutOfBounds { .. })
        ));
        assert!(contains_display_point(&l, Point::new(1.99, -2.0)));
        assert!(!contains_display_point(&l, Point::new(0.0, 2.5)));
    }

    #[test]
    fn aspect_fit_respects_both_edges() {
        assert_eq!(aspect_fit((200, 100), Size::new(100.0, 100.0)), Size::new(100.0, 50.0));
        assert_eq!(aspect_fit((10, 40), Size::new(100.0, 100.0)), Size::new(25.0, 100.0));
    }
}
