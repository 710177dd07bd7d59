use crate::event::SyncMetadata;

use std::path::Path;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha512};
use tokio::{
	fs::File,
	io::{self, AsyncReadExt},
};

const BLOCK_LEN: usize = 1048576;

/// Streams a file through SHA-512, returning the lowercase hex digest
/// (128 characters).
pub async fn file_sha512(path: impl AsRef<Path>) -> Result<String, io::Error> {
	let mut reader = File::open(path).await?;
	let mut hasher = Sha512::new();
	let mut buffer = vec![0; BLOCK_LEN].into_boxed_slice();
	loop {
		// A short read mid-file is legal, so only zero means EOF.
		let read_count = reader.read(&mut buffer).await?;
		if read_count == 0 {
			break;
		}
		hasher.update(&buffer[..read_count]);
	}

	Ok(hex::encode(hasher.finalize()))
}

/// Stats a file and hashes its contents, producing the metadata payload a
/// Sync event carries. Always reads fresh state; sync metadata is computed
/// at dispatch time, never at capture time.
pub async fn read_metadata(path: impl AsRef<Path>) -> Result<SyncMetadata, io::Error> {
	let path = path.as_ref();
	let metadata = tokio::fs::metadata(path).await?;

	// Some filesystems don't record a creation time; fall back to mtime.
	let modified_at: DateTime<Utc> = metadata.modified()?.into();
	let created_at = metadata
		.created()
		.map(DateTime::<Utc>::from)
		.unwrap_or(modified_at);

	Ok(SyncMetadata {
		created_at,
		modified_at,
		len: metadata.len(),
		sha512: file_sha512(path).await?,
	})
}
