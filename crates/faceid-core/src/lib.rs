//! faceid-core — Face identity matching engine.
//!
//! Detection and alignment to a canonical 112×112 crop, ArcFace-style
//! embeddings via ONNX Runtime, a cosine-similarity identity index with a
//! persisted cache, and the recognition and enrollment sessions built on it.

pub mod alignment;
pub mod detector;
pub mod index;
pub mod pipeline;
pub mod quality;
pub mod recognizer;
pub mod session;
pub mod types;

pub use detector::{FaceDetector, ScrfdDetector};
pub use index::{IdentityIndex, IdentitySummary, IndexError, IndexStore, RebuildSource, ResolvedHit};
pub use pipeline::FacePipeline;
pub use quality::QualityGate;
pub use recognizer::{ArcFaceEmbedder, FaceEmbedder};
pub use session::{CancelFlag, FrameFeed, Phase, Progress, Verdict};
pub use types::{AlignedFace, BoundingBox, Detection, Embedding, Frame, Landmarks, Point, EMBEDDING_DIM};
