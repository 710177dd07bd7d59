use crate::receiver::Receiver;

use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

/// The set of receivers currently participating in replication.
///
/// Constructor-injected into every folder listener rather than living as
/// process-wide state, so tests can run isolated registries side by side.
/// Holds weak references only: each listener owns its receiver, and a
/// dropped listener disappears from the registry on the next prune.
#[derive(Default)]
pub struct ReceiverRegistry {
	receivers: Mutex<Vec<Weak<dyn Receiver>>>,
}

impl ReceiverRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&self, receiver: &Arc<dyn Receiver>) {
		let mut receivers = self.receivers.lock().expect("receiver registry lock poisoned");

		if !receivers
			.iter()
			.any(|candidate| candidate.ptr_eq(&Arc::downgrade(receiver)))
		{
			receivers.push(Arc::downgrade(receiver));
			trace!(total = receivers.len(), "Receiver registered;");
		}
	}

	pub fn remove(&self, receiver: &Arc<dyn Receiver>) {
		let target = Arc::downgrade(receiver);
		self.receivers
			.lock()
			.expect("receiver registry lock poisoned")
			.retain(|candidate| !candidate.ptr_eq(&target));
	}

	/// All live receivers except the caller's own, so a folder never
	/// replicates to itself. Dead entries are pruned along the way. No
	/// ordering across receivers is promised.
	pub fn others(&self, own: &Arc<dyn Receiver>) -> Vec<Arc<dyn Receiver>> {
		let mut receivers = self.receivers.lock().expect("receiver registry lock poisoned");

		receivers.retain(|candidate| candidate.strong_count() > 0);

		receivers
			.iter()
			.filter_map(Weak::upgrade)
			.filter(|candidate| !Arc::ptr_eq(candidate, own))
			.collect()
	}
}
