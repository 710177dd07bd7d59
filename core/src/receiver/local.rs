use crate::{
	conflict::{self, Resolution, TieBreak},
	event::{ChangeEvent, ChangeKind},
	suppress::{IgnoreList, DEFAULT_SUPPRESSION_TTL},
};

use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::{
	fs::{self, OpenOptions},
	io::{self, AsyncWriteExt},
};
use tracing::{debug, trace, warn};

use super::{ApplyOutcome, Receiver, ReceiverError, SyncMetadata};

/// Recoverable side locations where files are moved instead of destroyed.
/// Mirrored deletes fan out to every peer, so nothing a receiver does in
/// place is allowed to be destructive.
pub const HOLDING_AREAS: [&str; 3] = [".backup", ".deleted", ".renamed"];

const LOG_FILE_NAME: &str = "log.txt";

/// Applies change events directly to a local folder.
///
/// Each folder listener exclusively owns one of these, representing itself
/// in the receiver registry. Before every filesystem mutation the receiver
/// registers the notifications that mutation is about to echo back, so the
/// owning listener's handler can drop them instead of re-broadcasting.
pub struct LocalFolderReceiver {
	root: PathBuf,
	ignore: Arc<IgnoreList>,
	tie: TieBreak,
}

impl LocalFolderReceiver {
	pub fn new(root: impl Into<PathBuf>, ignore: Arc<IgnoreList>) -> Self {
		Self {
			root: root.into(),
			ignore,
			tie: TieBreak::default(),
		}
	}

	/// Overrides the conflict tie-break policy, which defaults to preferring
	/// the announcing (remote) side.
	#[must_use]
	pub fn with_tie_break(mut self, tie: TieBreak) -> Self {
		self.tie = tie;
		self
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	fn target_path(&self, file_name: &str) -> PathBuf {
		self.root.join(file_name)
	}

	/// Moves a file into a holding area and appends a who/when line to the
	/// area's log, so replication mistakes stay reversible.
	async fn move_to_holding_area(
		&self,
		file_name: &str,
		area: &str,
		reason: &str,
	) -> Result<(), io::Error> {
		let area_dir = self.root.join(area);
		fs::create_dir_all(&area_dir).await?;

		let mut held_path = area_dir.join(file_name);
		if fs::metadata(&held_path).await.is_ok() {
			// An earlier copy is already held; keep both.
			held_path = area_dir.join(format!("{file_name}.{}", Utc::now().timestamp_millis()));
		}

		// Moving the file out of the watched root echoes back as a deletion
		// of the original name.
		self.ignore
			.register(ChangeKind::Deleted, file_name, DEFAULT_SUPPRESSION_TTL);

		fs::rename(self.target_path(file_name), &held_path).await?;

		self.append_log_line(
			&area_dir,
			&format!(
				"{} {reason} '{file_name}' -> '{}'",
				Utc::now().to_rfc3339(),
				held_path.display()
			),
		)
		.await?;

		debug!(file_name, area, "Moved file into holding area;");

		Ok(())
	}

	async fn append_log_line(&self, area_dir: &Path, line: &str) -> Result<(), io::Error> {
		let mut log = OpenOptions::new()
			.create(true)
			.append(true)
			.open(area_dir.join(LOG_FILE_NAME))
			.await?;
		log.write_all(format!("{line}\n").as_bytes()).await?;

		Ok(())
	}

	/// Writes file contents, registering the notifications the write will
	/// echo back first: filesystem creation plus the content write raise a
	/// Created/Changed pair, a rewrite raises Changed alone.
	async fn write_contents(&self, file_name: &str, bytes: &Bytes) -> Result<(), io::Error> {
		let target = self.target_path(file_name);

		if fs::metadata(&target).await.is_err() {
			self.ignore
				.register(ChangeKind::Created, file_name, DEFAULT_SUPPRESSION_TTL);
		}
		self.ignore
			.register(ChangeKind::Changed, file_name, DEFAULT_SUPPRESSION_TTL);

		fs::write(&target, bytes).await
	}

	async fn apply_created(&self, file_name: &str, bytes: Bytes) -> Result<(), io::Error> {
		if fs::metadata(self.target_path(file_name)).await.is_ok() {
			// Both sides created the same name independently. Anomalous, but
			// never a reason to destroy data.
			warn!(file_name, "Create collision, backing up existing file;");
			self.move_to_holding_area(file_name, ".backup", "create collision, backed up")
				.await?;
		}

		self.write_contents(file_name, &bytes).await
	}

	async fn apply_deleted(&self, file_name: &str) -> Result<(), io::Error> {
		if fs::metadata(self.target_path(file_name)).await.is_err() {
			// Already gone; duplicate delivery or the file never made it
			// here. Either way the delete is satisfied.
			trace!(file_name, "Delete for a file we don't have;");
			return Ok(());
		}

		self.move_to_holding_area(file_name, ".deleted", "deleted by peer")
			.await
	}

	async fn apply_renamed(&self, old_file_name: &str, file_name: &str) -> Result<(), ReceiverError> {
		let old_path = self.target_path(old_file_name);
		let new_path = self.target_path(file_name);

		if fs::metadata(&old_path).await.is_err() {
			if fs::metadata(&new_path).await.is_ok() {
				// Old name gone, new name present: duplicate delivery.
				trace!(old_file_name, file_name, "Rename already applied;");
				return Ok(());
			}
			return Err(ReceiverError::RenameNonExistingFile(old_path));
		}

		let io_context = |source| ReceiverError::Io {
			kind: ChangeKind::Renamed,
			file_name: file_name.to_string(),
			source,
		};

		if fs::metadata(&new_path).await.is_ok() {
			self.move_to_holding_area(file_name, ".backup", "rename collision, backed up")
				.await
				.map_err(io_context)?;
		}

		self.ignore
			.register(ChangeKind::Renamed, file_name, DEFAULT_SUPPRESSION_TTL);

		fs::rename(&old_path, &new_path).await.map_err(io_context)?;

		let renamed_dir = self.root.join(".renamed");
		fs::create_dir_all(&renamed_dir).await.map_err(io_context)?;
		self.append_log_line(
			&renamed_dir,
			&format!(
				"{} renamed '{old_file_name}' -> '{file_name}'",
				Utc::now().to_rfc3339()
			),
		)
		.await
		.map_err(io_context)?;

		Ok(())
	}

	async fn apply_sync(
		&self,
		file_name: &str,
		metadata: &SyncMetadata,
	) -> Result<ApplyOutcome, io::Error> {
		match conflict::resolve(self.target_path(file_name), metadata, self.tie).await? {
			Resolution::Identical | Resolution::KeepLocal => Ok(ApplyOutcome::Applied),
			Resolution::FetchRemote { preserve_local } => {
				if preserve_local {
					self.move_to_holding_area(file_name, ".backup", "conflict, local copy backed up")
						.await?;
				}
				Ok(ApplyOutcome::NeedsContent)
			}
		}
	}
}

#[async_trait]
impl Receiver for LocalFolderReceiver {
	async fn apply(
		&self,
		event: &ChangeEvent,
		bytes: Option<Bytes>,
		metadata: Option<&SyncMetadata>,
	) -> Result<ApplyOutcome, ReceiverError> {
		let file_name = event.file_name.as_str();

		let io_context = |source| ReceiverError::Io {
			kind: event.kind,
			file_name: file_name.to_string(),
			source,
		};

		match event.kind {
			ChangeKind::Created => {
				let bytes = bytes.ok_or(ReceiverError::MissingPayload(ChangeKind::Created))?;
				self.apply_created(file_name, bytes)
					.await
					.map_err(io_context)?;
				Ok(ApplyOutcome::Applied)
			}
			ChangeKind::Changed => {
				let bytes = bytes.ok_or(ReceiverError::MissingPayload(ChangeKind::Changed))?;
				self.write_contents(file_name, &bytes)
					.await
					.map_err(io_context)?;
				Ok(ApplyOutcome::Applied)
			}
			ChangeKind::Deleted => {
				self.apply_deleted(file_name).await.map_err(io_context)?;
				Ok(ApplyOutcome::Applied)
			}
			ChangeKind::Renamed => {
				let old_file_name = event
					.old_file_name
					.as_deref()
					.ok_or_else(|| ReceiverError::MissingOldFileName(file_name.to_string()))?;
				self.apply_renamed(old_file_name, file_name).await?;
				Ok(ApplyOutcome::Applied)
			}
			ChangeKind::Sync => {
				if let Some(bytes) = bytes {
					// Content follow-up after we answered NeedsContent.
					self.write_contents(file_name, &bytes)
						.await
						.map_err(io_context)?;
					Ok(ApplyOutcome::Applied)
				} else {
					let metadata =
						metadata.ok_or(ReceiverError::MissingPayload(ChangeKind::Sync))?;
					self.apply_sync(file_name, metadata)
						.await
						.map_err(io_context)
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::digest;

	async fn receiver_in_tempdir() -> (tempfile::TempDir, LocalFolderReceiver, Arc<IgnoreList>) {
		let dir = tempfile::tempdir().unwrap();
		let ignore = Arc::new(IgnoreList::new());
		let receiver = LocalFolderReceiver::new(dir.path(), Arc::clone(&ignore));
		(dir, receiver, ignore)
	}

	#[tokio::test]
	async fn created_event_writes_bytes_and_registers_suppressions() {
		let (dir, receiver, ignore) = receiver_in_tempdir().await;

		let outcome = receiver
			.apply(
				&ChangeEvent::created("doc.txt"),
				Some(Bytes::from_static(b"contents")),
				None,
			)
			.await
			.unwrap();

		assert_eq!(outcome, ApplyOutcome::Applied);
		assert_eq!(
			tokio::fs::read(dir.path().join("doc.txt")).await.unwrap(),
			b"contents"
		);

		// The write is expected to echo back as a Created/Changed pair.
		assert!(ignore.check_and_consume(ChangeKind::Created, "doc.txt"));
		assert!(ignore.check_and_consume(ChangeKind::Changed, "doc.txt"));
	}

	#[tokio::test]
	async fn create_collision_backs_up_the_existing_file() {
		let (dir, receiver, _ignore) = receiver_in_tempdir().await;

		tokio::fs::write(dir.path().join("doc.txt"), b"mine")
			.await
			.unwrap();

		receiver
			.apply(
				&ChangeEvent::created("doc.txt"),
				Some(Bytes::from_static(b"theirs")),
				None,
			)
			.await
			.unwrap();

		assert_eq!(
			tokio::fs::read(dir.path().join("doc.txt")).await.unwrap(),
			b"theirs"
		);
		assert_eq!(
			tokio::fs::read(dir.path().join(".backup/doc.txt"))
				.await
				.unwrap(),
			b"mine"
		);
		assert!(tokio::fs::metadata(dir.path().join(".backup/log.txt"))
			.await
			.is_ok());
	}

	#[tokio::test]
	async fn delete_relocates_instead_of_destroying() {
		let (dir, receiver, _ignore) = receiver_in_tempdir().await;

		tokio::fs::write(dir.path().join("doc.txt"), b"precious")
			.await
			.unwrap();

		receiver
			.apply(&ChangeEvent::deleted("doc.txt"), None, None)
			.await
			.unwrap();

		assert!(tokio::fs::metadata(dir.path().join("doc.txt")).await.is_err());
		assert_eq!(
			tokio::fs::read(dir.path().join(".deleted/doc.txt"))
				.await
				.unwrap(),
			b"precious"
		);
		assert!(tokio::fs::metadata(dir.path().join(".deleted/log.txt"))
			.await
			.is_ok());
	}

	#[tokio::test]
	async fn delete_of_a_missing_file_is_idempotent() {
		let (_dir, receiver, _ignore) = receiver_in_tempdir().await;

		let outcome = receiver
			.apply(&ChangeEvent::deleted("ghost.txt"), None, None)
			.await
			.unwrap();
		assert_eq!(outcome, ApplyOutcome::Applied);
	}

	#[tokio::test]
	async fn rename_moves_the_file_and_logs_it() {
		let (dir, receiver, ignore) = receiver_in_tempdir().await;

		tokio::fs::write(dir.path().join("old.txt"), b"x")
			.await
			.unwrap();

		receiver
			.apply(&ChangeEvent::renamed("old.txt", "new.txt"), None, None)
			.await
			.unwrap();

		assert!(tokio::fs::metadata(dir.path().join("old.txt")).await.is_err());
		assert_eq!(
			tokio::fs::read(dir.path().join("new.txt")).await.unwrap(),
			b"x"
		);
		assert!(ignore.check_and_consume(ChangeKind::Renamed, "new.txt"));
		assert!(tokio::fs::metadata(dir.path().join(".renamed/log.txt"))
			.await
			.is_ok());
	}

	#[tokio::test]
	async fn duplicate_rename_delivery_is_tolerated() {
		let (dir, receiver, _ignore) = receiver_in_tempdir().await;

		tokio::fs::write(dir.path().join("new.txt"), b"x")
			.await
			.unwrap();

		// Old name is gone and new name exists: already applied.
		let outcome = receiver
			.apply(&ChangeEvent::renamed("old.txt", "new.txt"), None, None)
			.await
			.unwrap();
		assert_eq!(outcome, ApplyOutcome::Applied);
	}

	#[tokio::test]
	async fn rename_of_a_fully_missing_file_is_an_error() {
		let (_dir, receiver, _ignore) = receiver_in_tempdir().await;

		assert!(matches!(
			receiver
				.apply(&ChangeEvent::renamed("old.txt", "new.txt"), None, None)
				.await,
			Err(ReceiverError::RenameNonExistingFile(_))
		));
	}

	#[tokio::test]
	async fn sync_for_a_missing_file_requests_content() {
		let (_dir, receiver, _ignore) = receiver_in_tempdir().await;

		let remote_dir = tempfile::tempdir().unwrap();
		let remote_path = remote_dir.path().join("doc.txt");
		tokio::fs::write(&remote_path, b"remote").await.unwrap();
		let metadata = digest::read_metadata(&remote_path).await.unwrap();

		let outcome = receiver
			.apply(&ChangeEvent::sync("doc.txt"), None, Some(&metadata))
			.await
			.unwrap();
		assert_eq!(outcome, ApplyOutcome::NeedsContent);
	}

	#[tokio::test]
	async fn sync_tie_with_diverged_content_preserves_local_before_requesting() {
		let (dir, receiver, _ignore) = receiver_in_tempdir().await;

		tokio::fs::write(dir.path().join("doc.txt"), b"left")
			.await
			.unwrap();

		let mut metadata = digest::read_metadata(dir.path().join("doc.txt"))
			.await
			.unwrap();
		metadata.sha512 = "f".repeat(128);

		let outcome = receiver
			.apply(&ChangeEvent::sync("doc.txt"), None, Some(&metadata))
			.await
			.unwrap();

		assert_eq!(outcome, ApplyOutcome::NeedsContent);
		assert_eq!(
			tokio::fs::read(dir.path().join(".backup/doc.txt"))
				.await
				.unwrap(),
			b"left"
		);

		// Content follow-up lands as the announced copy.
		receiver
			.apply(
				&ChangeEvent::sync("doc.txt"),
				Some(Bytes::from_static(b"right")),
				None,
			)
			.await
			.unwrap();
		assert_eq!(
			tokio::fs::read(dir.path().join("doc.txt")).await.unwrap(),
			b"right"
		);
	}

	#[tokio::test]
	async fn missing_payload_is_rejected() {
		let (_dir, receiver, _ignore) = receiver_in_tempdir().await;

		assert!(matches!(
			receiver.apply(&ChangeEvent::created("doc.txt"), None, None).await,
			Err(ReceiverError::MissingPayload(ChangeKind::Created))
		));
		assert!(matches!(
			receiver.apply(&ChangeEvent::sync("doc.txt"), None, None).await,
			Err(ReceiverError::MissingPayload(ChangeKind::Sync))
		));
	}
}
