//! facegate-core — identity matching engine for the face gate.
//!
//! Face detection (UltraFace) and embedding (FaceNet) run via ONNX Runtime;
//! matching, cooldown and the identity store are plain Rust.

pub mod config;
pub mod cooldown;
pub mod detector;
pub mod encoder;
pub mod store;
pub mod types;

pub use config::Config;
pub use cooldown::{Clock, CooldownTracker, SystemClock};
pub use detector::{FaceDetector, UltraFaceDetector};
pub use encoder::{FaceEncoder, FaceNetEncoder, FACENET_MODEL_VERSION};
pub use store::{FaceDb, IdentityStore};
pub use types::{
    BoundingBox, CosineMatcher, Embedding, MatchResult, Matcher, ReferenceEmbedding, UNKNOWN_LABEL,
};
