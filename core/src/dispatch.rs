use crate::{
	digest,
	event::{ChangeEvent, ChangeKind, SyncMetadata},
	receiver::{ApplyOutcome, Receiver, ReceiverError},
};

use std::{
	path::{Path, PathBuf},
	sync::{Arc, Mutex},
};

use bytes::Bytes;
use thiserror::Error;
use tokio::io;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
	#[error("Failed to read <path='{path}'> for a {kind:?} dispatch: {source}")]
	SourceRead {
		kind: ChangeKind,
		path: PathBuf,
		source: io::Error,
	},
	#[error("Receiver failed to apply event: {0}")]
	Receiver(#[from] ReceiverError),
}

/// Fans a drained batch of change events out to a set of peer receivers.
///
/// File contents and sync metadata are read fresh at dispatch time, outside
/// any lock, so a Changed event always carries state no older than the
/// moment it was queued. Within one receiver the batch is applied strictly
/// in capture order; across receivers no ordering is promised.
///
/// A dispatch failure abandons that one event for that one receiver and the
/// batch continues: one bad file must not stop synchronization of the rest.
/// The most recent failure is kept in a single retrievable slot, a minimal
/// diagnostic channel rather than a queue.
#[derive(Default)]
pub struct SyncDispatcher {
	last_error: Mutex<Option<DispatchError>>,
}

impl SyncDispatcher {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns and clears the most recently captured dispatch failure.
	pub fn take_last_error(&self) -> Option<DispatchError> {
		self.last_error
			.lock()
			.expect("dispatcher error slot lock poisoned")
			.take()
	}

	fn record_error(&self, error: DispatchError) {
		warn!(?error, "Dispatch failure, batch continues;");
		*self
			.last_error
			.lock()
			.expect("dispatcher error slot lock poisoned") = Some(error);
	}

	/// Dispatches `batch` from the folder rooted at `root` to every receiver.
	pub async fn dispatch_batch(
		&self,
		root: &Path,
		batch: &[ChangeEvent],
		receivers: &[Arc<dyn Receiver>],
	) {
		debug!(
			root = %root.display(),
			events = batch.len(),
			receivers = receivers.len(),
			"Dispatching batch;"
		);

		for event in batch {
			let (bytes, metadata) = match self.prepare_payload(root, event).await {
				Ok(payload) => payload,
				Err(e) => {
					self.record_error(e);
					continue;
				}
			};

			for receiver in receivers {
				if let Err(e) = self
					.apply_to_receiver(root, event, bytes.clone(), metadata.as_ref(), receiver)
					.await
				{
					self.record_error(e);
				}
			}
		}
	}

	/// Builds the payload an event carries, once per event rather than once
	/// per receiver: file bytes for Created/Changed, fresh metadata for
	/// Sync, nothing for Deleted/Renamed.
	async fn prepare_payload(
		&self,
		root: &Path,
		event: &ChangeEvent,
	) -> Result<(Option<Bytes>, Option<SyncMetadata>), DispatchError> {
		let source_read = |source| DispatchError::SourceRead {
			kind: event.kind,
			path: root.join(&event.file_name),
			source,
		};

		match event.kind {
			ChangeKind::Created | ChangeKind::Changed => {
				let contents = tokio::fs::read(root.join(&event.file_name))
					.await
					.map_err(source_read)?;
				Ok((Some(Bytes::from(contents)), None))
			}
			ChangeKind::Sync => {
				let metadata = digest::read_metadata(root.join(&event.file_name))
					.await
					.map_err(source_read)?;
				Ok((None, Some(metadata)))
			}
			ChangeKind::Deleted | ChangeKind::Renamed => Ok((None, None)),
		}
	}

	async fn apply_to_receiver(
		&self,
		root: &Path,
		event: &ChangeEvent,
		bytes: Option<Bytes>,
		metadata: Option<&SyncMetadata>,
		receiver: &Arc<dyn Receiver>,
	) -> Result<(), DispatchError> {
		match receiver.apply(event, bytes, metadata).await? {
			ApplyOutcome::Applied => Ok(()),
			ApplyOutcome::NeedsContent => {
				// The receiver resolved a Sync in favor of our copy; read it
				// fresh and push the contents in a follow-up apply.
				let contents = tokio::fs::read(root.join(&event.file_name))
					.await
					.map_err(|source| DispatchError::SourceRead {
						kind: event.kind,
						path: root.join(&event.file_name),
						source,
					})?;

				receiver
					.apply(event, Some(Bytes::from(contents)), None)
					.await?;

				Ok(())
			}
		}
	}
}
