pub mod auth;
mod batch;
pub mod config;
mod dispatch;
mod error;
pub mod logging;
pub mod protocol;
mod receiver;
pub mod session;
pub mod status;
pub mod store;
mod tracker;

pub const APP_NAME: &str = "DriveProgress";

pub use batch::{BatchProgress, BatchTracker, BatchUpdate};
pub use dispatch::{DispatchOutcome, Dispatcher, Handler, dispatch};
pub use error::{DecodeError, Error, OrderingViolation, Result, SessionError};
pub use protocol::{
    BatchKey, BatchProgressEvent, Event, FileType, Message, MessageKind, PhaseKind, Route,
    TransferEvent, TransferFailure, TransferItem, TransferKind, TransferPhase, decode, encode,
};
pub use receiver::{
    DrainReport, EmitOutcome, HandleOutcome, ProgressEmitter, ProgressReceiver, ProgressState,
    channel, channel_with_state, coalesce_progress,
};
pub use tracker::{TrackedTransfer, TransferKey, TransferState, TransferTracker};
