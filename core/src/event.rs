use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The five logical things that can happen to a file in a watched folder.
///
/// `Sync` is not a raw filesystem notification: it is emitted once per
/// pre-existing file when a folder starts sharing, so peers can reconcile
/// content that diverged while nobody was watching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
	Created,
	Changed,
	Deleted,
	Renamed,
	Sync,
}

/// A single logical change to a single file.
///
/// Change events are immutable values; "updating" one means constructing a
/// replacement with [`ChangeEvent::refreshed`] or [`ChangeEvent::renamed_to`]
/// and swapping it into the change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
	pub kind: ChangeKind,
	/// Identity key for the file, relative to the watched folder root.
	/// For `Renamed` events this is the NEW name.
	pub file_name: String,
	/// Only present on `Renamed` events.
	pub old_file_name: Option<String>,
	/// Wall-clock time the event was recorded. Used for suppression and
	/// coalescing recency, never for conflict resolution of content.
	pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
	pub fn created(file_name: impl Into<String>) -> Self {
		Self::new(ChangeKind::Created, file_name)
	}

	pub fn changed(file_name: impl Into<String>) -> Self {
		Self::new(ChangeKind::Changed, file_name)
	}

	pub fn deleted(file_name: impl Into<String>) -> Self {
		Self::new(ChangeKind::Deleted, file_name)
	}

	pub fn renamed(old_file_name: impl Into<String>, new_file_name: impl Into<String>) -> Self {
		Self {
			kind: ChangeKind::Renamed,
			file_name: new_file_name.into(),
			old_file_name: Some(old_file_name.into()),
			timestamp: Utc::now(),
		}
	}

	pub fn sync(file_name: impl Into<String>) -> Self {
		Self::new(ChangeKind::Sync, file_name)
	}

	fn new(kind: ChangeKind, file_name: impl Into<String>) -> Self {
		Self {
			kind,
			file_name: file_name.into(),
			old_file_name: None,
			timestamp: Utc::now(),
		}
	}

	/// A copy of this event carrying a fresh timestamp.
	#[must_use]
	pub fn refreshed(&self) -> Self {
		Self {
			timestamp: Utc::now(),
			..self.clone()
		}
	}

	/// A copy of this event pointing at a new file name, for rewriting
	/// pending events when the file they refer to gets renamed.
	#[must_use]
	pub fn renamed_to(&self, new_file_name: impl Into<String>) -> Self {
		Self {
			file_name: new_file_name.into(),
			..self.clone()
		}
	}
}

/// Metadata accompanying a `Sync` event, computed fresh at dispatch time by
/// the content oracle, never at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
	pub created_at: DateTime<Utc>,
	pub modified_at: DateTime<Utc>,
	pub len: u64,
	/// Lowercase hex SHA-512 digest of the file contents, 128 characters.
	pub sha512: String,
}
