use crate::event::ChangeKind;

use std::{
	sync::Mutex,
	time::{Duration, Instant},
};

use tracing::trace;

/// How long a registered suppression stays valid before expiring naturally.
/// Generous on purpose: a slow disk can delay the echoed notification by a
/// couple of seconds without the entry timing out.
pub const DEFAULT_SUPPRESSION_TTL: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct IgnoreEntry {
	kind: ChangeKind,
	file_name: String,
	expires_at: Instant,
}

/// Breaks the feedback loop between applying a remote change and re-capturing
/// it as a new local edit.
///
/// A receiver registers the notifications it is about to cause right before
/// mutating the local filesystem; the notification handler consumes matching
/// entries and drops the raw notification instead of recording it. This is a
/// heuristic: a genuine local edit of the same file racing the remote apply
/// in the same instant will be swallowed too. Accepted and documented, not
/// silently worked around.
#[derive(Debug, Default)]
pub struct IgnoreList {
	entries: Mutex<Vec<IgnoreEntry>>,
}

impl IgnoreList {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers an expected self-inflicted notification.
	pub fn register(&self, kind: ChangeKind, file_name: impl Into<String>, ttl: Duration) {
		let file_name = file_name.into();
		trace!(?kind, file_name, "Expecting self-inflicted notification;");

		self.entries
			.lock()
			.expect("ignore list lock poisoned")
			.push(IgnoreEntry {
				kind,
				file_name,
				expires_at: Instant::now() + ttl,
			});
	}

	/// Returns true when the notification matches at least one live entry.
	/// All matching live entries are consumed, and expired entries for any
	/// file are pruned along the way.
	pub fn check_and_consume(&self, kind: ChangeKind, file_name: &str) -> bool {
		let now = Instant::now();
		let mut entries = self.entries.lock().expect("ignore list lock poisoned");

		entries.retain(|entry| entry.expires_at > now);

		let before = entries.len();
		entries.retain(|entry| !(entry.kind == kind && entry.file_name == file_name));
		let matched = entries.len() < before;

		if matched {
			trace!(?kind, file_name, "Suppressed self-inflicted notification;");
		}

		matched
	}

	pub fn clear(&self) {
		self.entries.lock().expect("ignore list lock poisoned").clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registered_notification_is_suppressed_once() {
		let ignore = IgnoreList::new();

		ignore.register(ChangeKind::Changed, "x.txt", DEFAULT_SUPPRESSION_TTL);

		assert!(ignore.check_and_consume(ChangeKind::Changed, "x.txt"));
		// The entry was consumed, so a second notification is genuine.
		assert!(!ignore.check_and_consume(ChangeKind::Changed, "x.txt"));
	}

	#[test]
	fn kind_and_name_must_both_match() {
		let ignore = IgnoreList::new();

		ignore.register(ChangeKind::Changed, "x.txt", DEFAULT_SUPPRESSION_TTL);

		assert!(!ignore.check_and_consume(ChangeKind::Deleted, "x.txt"));
		assert!(!ignore.check_and_consume(ChangeKind::Changed, "y.txt"));
		assert!(ignore.check_and_consume(ChangeKind::Changed, "x.txt"));
	}

	#[test]
	fn expired_entries_do_not_suppress() {
		let ignore = IgnoreList::new();

		ignore.register(ChangeKind::Created, "x.txt", Duration::ZERO);
		std::thread::sleep(Duration::from_millis(5));

		assert!(!ignore.check_and_consume(ChangeKind::Created, "x.txt"));
	}

	#[test]
	fn created_and_changed_pair_suppresses_both_notifications() {
		let ignore = IgnoreList::new();

		ignore.register(ChangeKind::Created, "x.txt", DEFAULT_SUPPRESSION_TTL);
		ignore.register(ChangeKind::Changed, "x.txt", DEFAULT_SUPPRESSION_TTL);

		assert!(ignore.check_and_consume(ChangeKind::Created, "x.txt"));
		assert!(ignore.check_and_consume(ChangeKind::Changed, "x.txt"));
		assert!(!ignore.check_and_consume(ChangeKind::Changed, "x.txt"));
	}
}
