use crate::{digest, event::SyncMetadata};

use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::io;
use tracing::debug;

/// Tie-break policy for the case metadata cannot settle: same mtime, same
/// size, different hash. The remote side just announced a Sync, so deferring
/// to it is the default, but the choice is provisional and therefore
/// pluggable rather than hard-coded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TieBreak {
	#[default]
	PreferRemote,
	PreferLocal,
}

/// Outcome of comparing a local file against the metadata a peer announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
	/// The remote copy wins; request its contents. When `preserve_local` is
	/// set, an existing local copy must be moved to the holding area before
	/// being overwritten.
	FetchRemote { preserve_local: bool },
	/// The local copy is authoritative; do nothing. The remote side converges
	/// when it receives this side's own Sync/Changed events.
	KeepLocal,
	/// Same mtime, size and hash: the files are already identical.
	Identical,
}

/// Decides which side of a same-named, possibly diverged file wins.
///
/// The ladder is mtime, then size, then content hash, so large files are
/// only read and hashed when metadata genuinely cannot tell the copies
/// apart. Every branch has a defined outcome; the only errors are I/O
/// failures reading local state, which the dispatcher captures per event.
pub async fn resolve(
	local_path: impl AsRef<Path>,
	remote: &SyncMetadata,
	tie: TieBreak,
) -> Result<Resolution, io::Error> {
	let local_path = local_path.as_ref();

	let local_metadata = match tokio::fs::metadata(local_path).await {
		Ok(metadata) => metadata,
		Err(e) if e.kind() == io::ErrorKind::NotFound => {
			// No local counterpart at all; take the remote copy outright.
			return Ok(Resolution::FetchRemote {
				preserve_local: false,
			});
		}
		Err(e) => return Err(e),
	};

	let local_modified_at: DateTime<Utc> = local_metadata.modified()?.into();

	if local_modified_at > remote.modified_at {
		return Ok(Resolution::KeepLocal);
	}
	if local_modified_at < remote.modified_at {
		return Ok(Resolution::FetchRemote {
			preserve_local: false,
		});
	}

	if local_metadata.len() == remote.len {
		let local_sha512 = digest::file_sha512(local_path).await?;
		if local_sha512 == remote.sha512 {
			return Ok(Resolution::Identical);
		}
	}

	// Equal mtime but diverged content: unresolvable by metadata alone.
	debug!(
		local_path = %local_path.display(),
		?tie,
		"Metadata tie with diverged content, applying tie-break policy;"
	);

	Ok(match tie {
		TieBreak::PreferRemote => Resolution::FetchRemote {
			preserve_local: true,
		},
		TieBreak::PreferLocal => Resolution::KeepLocal,
	})
}
