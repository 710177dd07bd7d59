use crate::event::{ChangeEvent, SyncMetadata};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{ApplyOutcome, Receiver, ReceiverError};

/// The network-facing variant of the [`Receiver`] contract: forwards change
/// events to a remote peer instead of applying them to a local path.
///
/// The wire protocol is an external collaborator and deliberately not part
/// of this crate; every apply reports the transport as unavailable until a
/// transport implementation fills it in. The event and metadata types are
/// serde-serializable precisely so a transport can put them on a wire
/// unchanged.
pub struct RemoteServerReceiver {
	address: String,
}

impl RemoteServerReceiver {
	pub fn new(address: impl Into<String>) -> Self {
		Self {
			address: address.into(),
		}
	}

	pub fn address(&self) -> &str {
		&self.address
	}
}

#[async_trait]
impl Receiver for RemoteServerReceiver {
	async fn apply(
		&self,
		event: &ChangeEvent,
		bytes: Option<Bytes>,
		_metadata: Option<&SyncMetadata>,
	) -> Result<ApplyOutcome, ReceiverError> {
		debug!(
			address = %self.address,
			kind = ?event.kind,
			file_name = %event.file_name,
			bytes_len = bytes.as_ref().map(Bytes::len),
			"Would forward change event to remote peer;"
		);

		Err(ReceiverError::RemoteTransportUnavailable(
			self.address.clone(),
		))
	}
}
