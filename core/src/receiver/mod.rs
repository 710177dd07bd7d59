use crate::event::{ChangeEvent, ChangeKind, SyncMetadata};

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io;

mod local;
mod remote;

pub use local::{LocalFolderReceiver, HOLDING_AREAS};
pub use remote::RemoteServerReceiver;

#[derive(Error, Debug)]
pub enum ReceiverError {
	#[error("I/O error applying {kind:?} for <file_name='{file_name}'>: {source}")]
	Io {
		kind: ChangeKind,
		file_name: String,
		source: io::Error,
	},
	#[error("{0:?} event arrived without its required payload")]
	MissingPayload(ChangeKind),
	#[error("Renamed event arrived without an old file name: <file_name='{0}'>")]
	MissingOldFileName(String),
	#[error("Tried to rename a non-existing file: <path='{0}'>")]
	RenameNonExistingFile(PathBuf),
	#[error("Remote transport not available for peer <address='{0}'>")]
	RemoteTransportUnavailable(String),
}

/// What a receiver did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
	/// The event is fully applied (or was a no-op / duplicate).
	Applied,
	/// A Sync event resolved in favor of the announcing side: the receiver
	/// wants the file contents, which the dispatcher sends in a second
	/// `apply` call carrying bytes.
	NeedsContent,
}

/// Anything capable of applying a change event: the local folder owned by a
/// folder listener, or a remote peer behind a network transport.
///
/// `bytes` is present only for Created/Changed (and the content follow-up of
/// a Sync); `metadata` only for Sync. Dispatch makes no exactly-once
/// guarantee, so implementations must tolerate duplicate delivery.
#[async_trait]
pub trait Receiver: Send + Sync {
	async fn apply(
		&self,
		event: &ChangeEvent,
		bytes: Option<Bytes>,
		metadata: Option<&SyncMetadata>,
	) -> Result<ApplyOutcome, ReceiverError>;
}
