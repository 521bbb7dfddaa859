pub mod address;
pub mod budget;
pub mod error;
pub mod generate;
pub mod localize;
pub mod manifest;
pub mod progress;
pub mod size;
pub mod verify;

pub use error::{CafError, Result};
pub use generate::{CollisionPolicy, GenerationEngine, GenerationReport, GenerationRequest};
pub use manifest::{FileRecord, Manifest};
pub use size::{SizeDistribution, SizeSpec};
pub use verify::{FileStatus, VerificationEngine, VerificationReport, VerifyOptions};
