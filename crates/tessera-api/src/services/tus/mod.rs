//! Resumable upload sessions
//!
//! [`TusService`] implements the protocol operations on top of the session
//! registry, the chunk store, permanent storage and the metadata store.
//! Every mutation of an upload (append, finalize, cancel, expiry) runs under
//! that upload's per-id lock.

mod protocol;
mod recovery;
pub mod registry;
mod sweeper;

pub use protocol::{
    AppendChunk, AppendOutcome, Capabilities, CreateUpload, CreatedUpload, TusService,
    TusSettings, UploadInfo, UploadLength,
};
pub use recovery::RestoreReport;
pub use registry::{SessionEnd, UploadRegistry, UploadSession};
pub use sweeper::{spawn_sweeper, SweepReport};
