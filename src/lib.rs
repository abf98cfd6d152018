//! Layer composition engine: transformable layers, magic wand selection,
//! snapshot history and flattening export.

pub mod canvas;
pub mod cli;
pub mod components;
pub mod error;
pub mod io;
pub mod jobs;
pub mod logger;
pub mod ops;
pub mod settings;

pub use canvas::{Layer, LayerId, LayerStack, LayerTransform, TiledImage};
pub use components::history::{SessionTag, SnapshotId, SnapshotManager, StackSnapshot};
pub use error::{EngineError, Result};
pub use io::{EncodedImage, ExportFormat, TiffCompression};
pub use jobs::{JobKind, JobOutput, JobQueue, SelectionRequest};
pub use ops::compositor::{AlphaPolicy, RenderOptions, RenderScene, RenderSize, render, render_preview};
pub use ops::geometry::{FlipAxis, Quadrant};
pub use ops::selection::{FillAction, SelectionMask, SelectionMode, SelectionScope};
pub use ops::tools::{MagicWandMode, ToolAction, ToolOutcome, dispatch};
pub use settings::EngineSettings;
