use crate::event::{ChangeEvent, ChangeKind};

use std::sync::Mutex;

use tracing::trace;

/// Ordered collection of pending change events for one watched folder.
///
/// Raw notifications arrive on watcher threads while the debounce scheduler
/// drains on its own task, so the list sits behind a single lock. Every
/// critical section is list mutation only; file I/O never happens under
/// this lock.
#[derive(Debug, Default)]
pub struct ChangeLog {
	events: Mutex<Vec<ChangeEvent>>,
}

impl ChangeLog {
	pub fn new() -> Self {
		Self::default()
	}

	/// Records a deletion, dropping every pending event for the same file
	/// first; they are moot once the file is gone. Returns how many pending
	/// events were discarded, for diagnostics.
	pub fn record_deleted(&self, file_name: &str) -> usize {
		let mut events = self.events.lock().expect("change log lock poisoned");

		let before = events.len();
		events.retain(|event| event.file_name != file_name);
		let removed = before - events.len();

		events.push(ChangeEvent::deleted(file_name));

		if removed > 0 {
			trace!(file_name, removed, "Deletion superseded pending events;");
		}

		removed
	}

	/// Records a creation unconditionally. A Created immediately followed by
	/// a Changed is expected and both are kept: receivers must be able to
	/// distinguish "new file" from "rewrite".
	pub fn record_created(&self, file_name: &str) {
		self.events
			.lock()
			.expect("change log lock poisoned")
			.push(ChangeEvent::created(file_name));
	}

	/// Records a content change. OS write notifications fire several times
	/// per save, so a pending Changed for the same file is replaced in place
	/// by a fresh copy: repeated notifications collapse into one event that
	/// still carries the latest timestamp.
	pub fn record_changed(&self, file_name: &str) {
		let mut events = self.events.lock().expect("change log lock poisoned");

		if let Some(pending) = events
			.iter_mut()
			.find(|event| event.kind == ChangeKind::Changed && event.file_name == file_name)
		{
			*pending = pending.refreshed();
		} else {
			events.push(ChangeEvent::changed(file_name));
		}
	}

	/// Records a rename, then rewrites every other pending event for the old
	/// name so it can still locate the file afterwards. Rewritten events are
	/// re-inserted after the rename, preserving their relative order, so a
	/// receiver always applies the rename before anything referring to the
	/// new name.
	///
	/// A pending rename ending at the old name chains into this one: the
	/// intermediate name was never dispatched, so receivers never saw it and
	/// both renames collapse into a single origin-to-latest one. A chain
	/// ending back at its origin collapses into no rename at all.
	pub fn record_renamed(&self, old_file_name: &str, new_file_name: &str) {
		let mut events = self.events.lock().expect("change log lock poisoned");

		let mut origin = old_file_name.to_string();
		if let Some(index) = events.iter().position(|event| {
			event.kind == ChangeKind::Renamed && event.file_name == old_file_name
		}) {
			if let Some(previous_old) = events.remove(index).old_file_name {
				origin = previous_old;
			}
		}

		let mut rewritten = Vec::new();
		let mut index = 0;
		while index < events.len() {
			if events[index].file_name == old_file_name {
				rewritten.push(events.remove(index).renamed_to(new_file_name));
			} else {
				index += 1;
			}
		}

		if origin != new_file_name {
			events.push(ChangeEvent::renamed(origin, new_file_name));
		}
		events.extend(rewritten);
	}

	/// Records a Sync event for a file that already existed when the folder
	/// transitioned to sharing.
	pub fn record_shared(&self, file_name: &str) {
		self.events
			.lock()
			.expect("change log lock poisoned")
			.push(ChangeEvent::sync(file_name));
	}

	/// Atomically returns and clears all pending events in insertion order.
	pub fn pop_all(&self) -> Vec<ChangeEvent> {
		std::mem::take(&mut *self.events.lock().expect("change log lock poisoned"))
	}

	/// Discards all pending events, e.g. when the folder stops sharing.
	pub fn clear(&self) {
		self.events.lock().expect("change log lock poisoned").clear();
	}

	pub fn len(&self) -> usize {
		self.events.lock().expect("change log lock poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
