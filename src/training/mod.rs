//! Adapter training.
//!
//! [`Trainer`] packages captioned images into an archive, hands it to the
//! training service and follows the job until weights are available.
//! Parameters for each attempt come from [`overrides_for_attempt`].

mod archive;
mod params;
mod trainer;

pub use archive::{build_archive, ArchiveEntry};
pub use params::{overrides_for_attempt, ParamOverrides, TrainingParams};
pub use trainer::{dataset_archive_path, TrainedArtifact, Trainer};
