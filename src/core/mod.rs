pub mod engine;
pub mod mounts;
pub mod process;
pub mod progress;
pub mod strategy;
pub mod verifier;
pub mod volumes;

pub use engine::{BackupRestoreEngine, PartitionSelection};
pub use mounts::{MountController, MountSnapshot};
pub use progress::JobProgress;
pub use strategy::{EncodingStrategy, RestorePlan};
pub use volumes::{Volume, VolumeRegistry};
