pub mod devices;
pub mod drive_manager;
pub mod exclusion;
pub mod hardware;
pub mod home;
pub mod manifest;
pub mod models;
pub mod operation;
pub mod orchestrator;
pub mod ownership;
pub mod progress;
pub mod sync_engine;
pub mod verifier;

pub use drive_manager::{DriveManager, MountedDrive, SpaceScope};
pub use exclusion::{ExclusionMatcher, ProtectedSet};
pub use hardware::{DriveAdapter, FsUsage};
pub use models::{BackupConfig, BackupType, DriveInfo, OperationPhase, ProgressUpdate};
pub use operation::OperationHandle;
pub use orchestrator::{BackupRequest, MirrorOutcome, Orchestrator, RestoreRequest, VerifyRequest};
pub use progress::ProgressEstimator;
pub use sync_engine::{SyncOptions, SyncStats, Synchronizer};
pub use verifier::{VerificationReport, Verifier, VerifyOptions};
