// ============================================================================
// TOOLS: every editing gesture as one closed enum, dispatched in one place
// ============================================================================

use image::Rgba;
use kurbo::{Point, Size};

use crate::canvas::{LayerId, LayerStack, TiledImage};
use crate::components::history::SessionTag;
use crate::error::{EngineError, Result};
use crate::ops::geometry::{self, FlipAxis};
use crate::ops::selection::{self, FillAction, SelectionMask, SelectionScope};

/// Magic wand flavour: erase the region, or flood it with a colour.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MagicWandMode {
    Erase,
    BucketFill(Rgba<u8>),
}

impl MagicWandMode {
    pub fn fill_action(self) -> FillAction {
        match self {
            MagicWandMode::Erase => FillAction::Erase,
            MagicWandMode::BucketFill(color) => FillAction::Recolor(color),
        }
    }
}

#[derive(Debug)]
pub enum ToolAction {
    AddLayer { pixels: TiledImage, position: Option<Point> },
    RemoveLayer(LayerId),
    DuplicateLayer(LayerId),
    /// Flatten the listed layers into one.
    MergeLayers(Vec<LayerId>),
    ToggleVisibility(LayerId),
    SwapOrder(LayerId, LayerId),
    MoveBackward(LayerId),
    MoveForward(LayerId),
    BringToFront(LayerId),
    SetActive(Option<LayerId>),
    Flip { layer: LayerId, axis: FlipAxis },
    Move { layer: LayerId, position: Option<Point> },
    Rotate { layer: LayerId, radians: f64 },
    Scale { layer: LayerId, x: f64, y: f64 },
    Resize { layer: LayerId, size: Size },
    /// Tap on the active layer at a display-space point.
    MagicWand {
        point: Point,
        tolerance: f32,
        mode: MagicWandMode,
        scope: SelectionScope,
    },
}

impl ToolAction {
    /// Session a snapshot taken before this action belongs to.
    pub fn session_tag(&self) -> SessionTag {
        match self {
            ToolAction::MagicWand { .. } => SessionTag::MagicWand,
            ToolAction::Flip { .. }
            | ToolAction::Move { .. }
            | ToolAction::Rotate { .. }
            | ToolAction::Scale { .. }
            | ToolAction::Resize { .. } => SessionTag::Transform,
            _ => SessionTag::Normal,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ToolAction::AddLayer { .. } => "Add Layer",
            ToolAction::RemoveLayer(_) => "Remove Layer",
            ToolAction::DuplicateLayer(_) => "Copy Layer",
            ToolAction::MergeLayers(_) => "Merge Layers",
            ToolAction::ToggleVisibility(_) => "Toggle Visibility",
            ToolAction::SwapOrder(..) => "Swap Order",
            ToolAction::MoveBackward(_) => "Move Backward",
            ToolAction::MoveForward(_) => "Move Forward",
            ToolAction::BringToFront(_) => "Bring to Front",
            ToolAction::SetActive(_) => "Select Layer",
            ToolAction::Flip { .. } => "Flip",
            ToolAction::Move { .. } => "Move",
            ToolAction::Rotate { .. } => "Rotate",
            ToolAction::Scale { .. } => "Scale",
            ToolAction::Resize { .. } => "Resize",
            ToolAction::MagicWand { mode: MagicWandMode::Erase, .. } => "Magic Wand",
            ToolAction::MagicWand { .. } => "Bucket Fill",
        }
    }
}

#[derive(Debug)]
pub enum ToolOutcome {
    Added(LayerId),
    Removed(LayerId),
    /// New visibility after a toggle.
    Visibility(bool),
    /// Whether a neighbour swap happened.
    Reordered(bool),
    Selected { layer: LayerId, mask: SelectionMask },
    Done,
}

pub fn dispatch(stack: &mut LayerStack, action: ToolAction) -> Result<ToolOutcome> {
    log::debug!("tool: {}", action.label());
    match action {
        ToolAction::AddLayer { pixels, position } => stack.add_layer(pixels, position).map(ToolOutcome::Added),
        ToolAction::RemoveLayer(id) => stack.remove_layer(id).map(|l| ToolOutcome::Removed(l.id())),
        ToolAction::DuplicateLayer(id) => stack.duplicate_layer(id).map(ToolOutcome::Added),
        ToolAction::MergeLayers(ids) => stack.merge_layers(&ids).map(ToolOutcome::Added),
        ToolAction::ToggleVisibility(id) => stack.toggle_visibility(id).map(ToolOutcome::Visibility),
        ToolAction::SwapOrder(a, b) => stack.swap_order(a, b).map(|_| ToolOutcome::Reordered(true)),
        ToolAction::MoveBackward(id) => stack.move_backward(id).map(ToolOutcome::Reordered),
        ToolAction::MoveForward(id) => stack.move_forward(id).map(ToolOutcome::Reordered),
        ToolAction::BringToFront(id) => stack.bring_to_front(id).map(|_| ToolOutcome::Done),
        ToolAction::SetActive(id) => stack.set_active_layer(id).map(|_| ToolOutcome::Done),
        ToolAction::Flip { layer, axis } => stack.flip(layer, axis).map(|_| ToolOutcome::Done),
        ToolAction::Move { layer, position } => stack.set_position(layer, position).map(|_| ToolOutcome::Done),
        ToolAction::Rotate { layer, radians } => stack.set_rotation(layer, radians).map(|_| ToolOutcome::Done),
        ToolAction::Scale { layer, x, y } => stack.set_scale(layer, x, y).map(|_| ToolOutcome::Done),
        ToolAction::Resize { layer, size } => stack.set_display_size(layer, size).map(|_| ToolOutcome::Done),
        ToolAction::MagicWand {
            point,
            tolerance,
            mode,
            scope,
        } => {
            let layer = stack
                .active_layer()
                .ok_or_else(|| EngineError::invalid("magic wand needs an active layer"))?;
            let seed = geometry::pixel_at(point, layer)?;
            let mask = selection::fill_layer(layer, seed, tolerance, scope, mode.fill_action())?;
            Ok(ToolOutcome::Selected { layer: layer.id(), mask })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (LayerStack, LayerId) {
        let mut s = LayerStack::new(Size::new(4.0, 4.0)).unwrap();
        let mut px = TiledImage::new_filled(4, 4, Rgba([255, 0, 0, 255])).unwrap();
        px.put_pixel(3, 3, Rgba([0, 0, 255, 255]));
        let id = s.add_layer(px, None).unwrap();
        (s, id)
    }

    #[test]
    fn wand_needs_active_layer() {
        let (mut s, _) = setup();
        let action = ToolAction::MagicWand {
            point: Point::ZERO,
            tolerance: 0.1,
            mode: MagicWandMode::Erase,
            scope: SelectionScope::Contiguous,
        };
        assert!(matches!(dispatch(&mut s, action), Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn bucket_fill_maps_display_tap_to_pixels() {
        let (mut s, id) = setup();
        dispatch(&mut s, ToolAction::SetActive(Some(id))).unwrap();
        let green = Rgba([0, 255, 0, 255]);
        let action = ToolAction::MagicWand {
            point: Point::new(-1.5, -1.5),
            tolerance: 0.0,
            mode: MagicWandMode::BucketFill(green),
            scope: SelectionScope::Contiguous,
        };
        assert_eq!(action.session_tag(), SessionTag::MagicWand);
        match dispatch(&mut s, action).unwrap() {
            ToolOutcome::Selected { layer, mask } => {
                assert_eq!(layer, id);
                assert_eq!(mask.count(), 15);
            }
            other => panic!("unexpected {other:?}"),
        }
        let layer = s.get(id).unwrap();
        assert_eq!(layer.pixels().get_pixel(0, 0), &green);
        assert_eq!(layer.pixels().get_pixel(3, 3), &Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn wand_outside_layer_is_out_of_bounds() {
        let (mut s, id) = setup();
        s.set_active_layer(Some(id)).unwrap();
        let action = ToolAction::MagicWand {
            point: Point::new(10.0, 0.0),
            tolerance: 0.1,
            mode: MagicWandMode::Erase,
            scope: SelectionScope::Global,
        };
        assert!(matches!(dispatch(&mut s, action), Err(EngineError::OutOfBounds { .. })));
    }

    #[test]
    fn layer_actions_route_to_stack() {
        let (mut s, id) = setup();
        let added = match dispatch(
            &mut s,
            ToolAction::AddLayer {
                pixels: TiledImage::new(2, 2).unwrap(),
                position: None,
            },
        )
        .unwrap()
        {
            ToolOutcome::Added(new) => new,
            other => panic!("unexpected {other:?}"),
        };
        assert!(matches!(dispatch(&mut s, ToolAction::MoveForward(id)).unwrap(), ToolOutcome::Reordered(true)));
        assert_eq!(s.get(id).unwrap().position_z(), 2);
        assert!(matches!(
            dispatch(&mut s, ToolAction::ToggleVisibility(added)).unwrap(),
            ToolOutcome::Visibility(false)
        ));
        let rotate = ToolAction::Rotate { layer: id, radians: 1.0 };
        assert_eq!(rotate.session_tag(), SessionTag::Transform);
        dispatch(&mut s, rotate).unwrap();
        assert_eq!(s.get(id).unwrap().rotation(), 1.0);
        assert!(dispatch(&mut s, ToolAction::Scale { layer: id, x: 0.0, y: 1.0 }).is_err());
    }

    #[test]
    fn copy_then_merge_routes_to_stack() {
        let (mut s, id) = setup();
        let copy = match dispatch(&mut s, ToolAction::DuplicateLayer(id)).unwrap() {
            ToolOutcome::Added(copy) => copy,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(s.len(), 2);
        let merge = ToolAction::MergeLayers(vec![id, copy]);
        assert_eq!(merge.session_tag(), SessionTag::Normal);
        assert_eq!(merge.label(), "Merge Layers");
        let merged = match dispatch(&mut s, merge).unwrap() {
            ToolOutcome::Added(merged) => merged,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(s.len(), 1);
        let layer = s.get(merged).unwrap();
        assert_eq!(layer.pixel_size(), (4, 4));
        assert_eq!(layer.pixels().get_pixel(3, 3), &Rgba([0, 0, 255, 255]));
        assert_eq!(layer.pixels().get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
    }
}
