use thiserror::Error;

use crate::canvas::LayerId;

/// Errors reported by the layer engine.
///
/// Every variant is recoverable: a failed operation leaves the stack, its
/// layers and the snapshot history exactly as they were before the call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// A coordinate fell outside the pixel extent of a buffer or layer.
    #[error("point ({x:.2}, {y:.2}) is outside the {width}×{height} pixel extent")]
    OutOfBounds {
        x: f64,
        y: f64,
        width: u32,
        height: u32,
    },

    /// A degenerate request (self-swap, zero scale, bad tolerance, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The layer id does not belong to this stack (removed, or from another stack).
    #[error("unknown layer {0}")]
    UnknownLayer(LayerId),

    /// The requested export format cannot represent the rendered pixels.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A history or allocation limit would be exceeded.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// A newer job of the same kind replaced this one before it finished.
    #[error("superseded by a newer request")]
    Superseded,
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }

    pub fn out_of_bounds(x: f64, y: f64, width: u32, height: u32) -> Self {
        EngineError::OutOfBounds { x, y, width, height }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
