use crate::{
	change_log::ChangeLog,
	conflict::TieBreak,
	dispatch::SyncDispatcher,
	event::ChangeKind,
	receiver::{LocalFolderReceiver, Receiver, HOLDING_AREAS},
	registry::ReceiverRegistry,
	suppress::IgnoreList,
};

use std::{
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use async_channel as chan;
use notify::{
	event::{ModifyKind, RenameMode},
	Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use rand::Rng;
use thiserror::Error;
use tokio::{
	io, pin, select, spawn,
	task::JoinHandle,
	time::{sleep, Instant},
};
use tracing::{debug, error, info, instrument, trace, warn};

/// Debounce interval bounds. The interval is re-drawn after every fire; the
/// jitter keeps many folders from firing in lockstep.
const DEBOUNCE_MIN_MS: u64 = 2000;
const DEBOUNCE_MAX_MS: u64 = 2500;

#[derive(Error, Debug)]
pub enum ListenerError {
	#[error("Could not set up folder listener for <path='{path}'>: {source}")]
	Setup {
		path: PathBuf,
		source: notify::Error,
	},
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
}

/// The aggregate root for one watched folder: owns its change log, its
/// ignore list, its debounce scheduler and the local receiver representing
/// this folder to its peers.
///
/// Lifecycle: Idle (not sharing) -> Sharing (watcher active, receiver
/// registered) -> Idle again on `unshare` or drop.
pub struct FolderListener {
	folder_path: PathBuf,
	registry: Arc<ReceiverRegistry>,
	change_log: Arc<ChangeLog>,
	ignore: Arc<IgnoreList>,
	receiver: Arc<dyn Receiver>,
	dispatcher: Arc<SyncDispatcher>,
	sharing: Option<Sharing>,
}

struct Sharing {
	stop_tx: chan::Sender<()>,
	handle: JoinHandle<()>,
}

impl FolderListener {
	pub fn new(folder_path: impl Into<PathBuf>, registry: Arc<ReceiverRegistry>) -> Self {
		Self::with_tie_break(folder_path, registry, TieBreak::default())
	}

	pub fn with_tie_break(
		folder_path: impl Into<PathBuf>,
		registry: Arc<ReceiverRegistry>,
		tie: TieBreak,
	) -> Self {
		let folder_path = folder_path.into();
		let ignore = Arc::new(IgnoreList::new());

		let receiver: Arc<dyn Receiver> = Arc::new(
			LocalFolderReceiver::new(&folder_path, Arc::clone(&ignore)).with_tie_break(tie),
		);

		Self {
			folder_path,
			registry,
			change_log: Arc::new(ChangeLog::new()),
			ignore,
			receiver,
			dispatcher: Arc::new(SyncDispatcher::new()),
			sharing: None,
		}
	}

	pub fn folder_path(&self) -> &Path {
		&self.folder_path
	}

	/// Whether a live watcher subscription exists for this folder.
	pub fn is_shared(&self) -> bool {
		self.sharing.is_some()
	}

	/// Returns and clears the most recent per-event dispatch failure.
	pub fn take_last_dispatch_error(&self) -> Option<crate::dispatch::DispatchError> {
		self.dispatcher.take_last_error()
	}

	/// Starts sharing this folder: watches it for changes, announces every
	/// pre-existing file to peers via Sync events, and registers this
	/// folder's receiver so peers replicate into it. No-op when already
	/// sharing.
	#[instrument(skip(self), fields(folder_path = %self.folder_path.display()))]
	pub async fn share(&mut self) -> Result<(), ListenerError> {
		if self.sharing.is_some() {
			return Ok(());
		}

		let (events_tx, events_rx) = chan::unbounded();
		let (stop_tx, stop_rx) = chan::bounded(1);

		let watcher = build_watcher(&self.folder_path, events_tx.clone())?;

		self.seed_sync_events().await?;

		self.registry.add(&self.receiver);

		let handle = spawn(listen(
			self.folder_path.clone(),
			watcher,
			events_tx,
			events_rx,
			stop_rx,
			Arc::clone(&self.change_log),
			Arc::clone(&self.ignore),
			Arc::clone(&self.registry),
			Arc::clone(&self.receiver),
			Arc::clone(&self.dispatcher),
		));

		self.sharing = Some(Sharing { stop_tx, handle });

		info!("Now sharing folder");

		Ok(())
	}

	/// Stops sharing: the watcher is torn down, registry membership dropped
	/// and pending events discarded. An in-flight dispatch tick is not
	/// cancelled; the next tick simply finds no events.
	#[instrument(skip(self), fields(folder_path = %self.folder_path.display()))]
	pub async fn unshare(&mut self) {
		let Some(Sharing { stop_tx, handle }) = self.sharing.take() else {
			return;
		};

		if stop_tx.send(()).await.is_err() {
			warn!("Folder listener task already gone on unshare;");
		}
		if let Err(e) = handle.await {
			error!(?e, "Failed to join folder listener task;");
		}

		self.registry.remove(&self.receiver);
		self.change_log.clear();
		self.ignore.clear();

		info!("Folder is no longer shared");
	}

	/// Queues one Sync event per pre-existing regular file so peers can
	/// reconcile content that diverged while nobody was sharing.
	async fn seed_sync_events(&self) -> Result<(), io::Error> {
		let mut entries = tokio::fs::read_dir(&self.folder_path).await?;

		while let Some(entry) = entries.next_entry().await? {
			if !entry.file_type().await?.is_file() {
				continue;
			}

			match entry.file_name().into_string() {
				Ok(file_name) => self.change_log.record_shared(&file_name),
				Err(file_name) => {
					warn!(?file_name, "Skipping non-UTF-8 file name on share;");
				}
			}
		}

		Ok(())
	}
}

impl Drop for FolderListener {
	fn drop(&mut self) {
		if let Some(Sharing { stop_tx, .. }) = self.sharing.take() {
			if stop_tx.try_send(()).is_err() {
				error!("Failed to send stop signal to folder listener task");
			}
			self.registry.remove(&self.receiver);
		}
	}
}

fn build_watcher(
	folder_path: &Path,
	events_tx: chan::Sender<notify::Result<Event>>,
) -> Result<RecommendedWatcher, ListenerError> {
	let setup = |source| ListenerError::Setup {
		path: folder_path.to_path_buf(),
		source,
	};

	let mut watcher = RecommendedWatcher::new(
		move |result| {
			// Not blocking the watcher thread: the channel is unbounded.
			if events_tx.send_blocking(result).is_err() {
				error!("Tried to send file system events to a closed channel;");
			}
		},
		Config::default(),
	)
	.map_err(setup)?;

	// File names are the identity keys of this system, so each folder is a
	// flat namespace and the watch is non-recursive.
	watcher
		.watch(folder_path, RecursiveMode::NonRecursive)
		.map_err(setup)?;

	Ok(watcher)
}

/// The per-folder listener task: captures raw notifications into the change
/// log and drains it on a jittered debounce schedule.
#[allow(clippy::too_many_arguments)]
async fn listen(
	folder_path: PathBuf,
	mut watcher: RecommendedWatcher,
	events_tx: chan::Sender<notify::Result<Event>>,
	events_rx: chan::Receiver<notify::Result<Event>>,
	stop_rx: chan::Receiver<()>,
	change_log: Arc<ChangeLog>,
	ignore: Arc<IgnoreList>,
	registry: Arc<ReceiverRegistry>,
	receiver: Arc<dyn Receiver>,
	dispatcher: Arc<SyncDispatcher>,
) {
	// Single-shot deadline, re-armed only after a fire. It lives outside the
	// loop so incoming notifications cannot postpone it: under sustained
	// writes the batch still goes out every window.
	let debounce = sleep(debounce_interval());
	pin!(debounce);

	loop {
		select! {
			result = events_rx.recv() => match result {
				Ok(Ok(event)) => {
					capture_notification(&folder_path, &event, &change_log, &ignore);
				}
				Ok(Err(e)) => {
					// The notification source signalled an internal failure;
					// tear the subscription down and recreate it once,
					// transparently to the caller.
					error!(?e, "Notification source error, rebuilding watcher;");

					if let Err(e) = watcher.unwatch(&folder_path) {
						trace!(?e, "Unwatch on broken subscription failed;");
					}

					match build_watcher(&folder_path, events_tx.clone()) {
						Ok(rebuilt) => {
							watcher = rebuilt;
							info!("Watcher subscription rebuilt");
						}
						Err(e) => {
							error!(
								?e,
								"Could not rebuild watcher, folder changes will no \
								 longer be captured until the next share;"
							);
						}
					}
				}
				Err(_) => break,
			},

			() = debounce.as_mut() => {
				tick(&folder_path, &change_log, &registry, &receiver, &dispatcher).await;
				debounce.as_mut().reset(Instant::now() + debounce_interval());
			}

			_ = stop_rx.recv() => {
				debug!("Stopping folder listener task");
				break;
			}
		}
	}
}

/// One scheduler fire: drain the change log and dispatch, unless this folder
/// is alone. Without an audience the pop is skipped entirely, so queued
/// events are retained rather than silently discarded.
async fn tick(
	folder_path: &Path,
	change_log: &ChangeLog,
	registry: &ReceiverRegistry,
	receiver: &Arc<dyn Receiver>,
	dispatcher: &SyncDispatcher,
) {
	let others = registry.others(receiver);
	if others.is_empty() {
		trace!("No other receivers, retaining pending events;");
		return;
	}

	let batch = change_log.pop_all();
	if batch.is_empty() {
		return;
	}

	dispatcher.dispatch_batch(folder_path, &batch, &others).await;
}

fn debounce_interval() -> Duration {
	Duration::from_millis(rand::thread_rng().gen_range(DEBOUNCE_MIN_MS..DEBOUNCE_MAX_MS))
}

/// One raw notification, normalized to the logical change-log operations.
#[derive(Debug, PartialEq, Eq)]
enum Normalized {
	Created(String),
	Changed(String),
	Deleted(String),
	Renamed { old: String, new: String },
}

/// Runs a raw notification through normalization and the feedback
/// suppressor, recording whatever survives into the change log.
fn capture_notification(
	folder_path: &Path,
	event: &Event,
	change_log: &ChangeLog,
	ignore: &IgnoreList,
) {
	for op in normalize_event(folder_path, event) {
		let (kind, file_name) = match &op {
			Normalized::Created(name) => (ChangeKind::Created, name.as_str()),
			Normalized::Changed(name) => (ChangeKind::Changed, name.as_str()),
			Normalized::Deleted(name) => (ChangeKind::Deleted, name.as_str()),
			Normalized::Renamed { new, .. } => (ChangeKind::Renamed, new.as_str()),
		};

		if ignore.check_and_consume(kind, file_name) {
			continue;
		}

		trace!(?op, "Recording folder change;");

		match op {
			Normalized::Created(name) => change_log.record_created(&name),
			Normalized::Changed(name) => change_log.record_changed(&name),
			Normalized::Deleted(name) => {
				change_log.record_deleted(&name);
			}
			Normalized::Renamed { old, new } => change_log.record_renamed(&old, &new),
		}
	}
}

/// The one raw kind that means "this file's content is now settled".
///
/// Linux raises `Modify(Data)` on every write and `Access(Close(Write))`
/// once the writer is done; reacting to the former would double-count each
/// save against the suppression window, so only the close counts. The other
/// platforms have no close-write signal and report content changes as
/// `Modify` variants.
fn is_content_change(kind: &EventKind) -> bool {
	#[cfg(target_os = "linux")]
	{
		use notify::event::{AccessKind, AccessMode};
		matches!(
			kind,
			EventKind::Access(AccessKind::Close(AccessMode::Write))
		)
	}

	#[cfg(not(target_os = "linux"))]
	{
		matches!(
			kind,
			EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other)
		)
	}
}

/// Maps raw notify event kinds onto the four logical kinds.
///
/// Per-OS quirks this flattens:
///  - In-folder renames arrive as `Modify(Name(Both))` with two paths;
///    one-sided `Name(From)`/`Name(To)` renames (moves across the watch
///    boundary) degrade to Deleted/Created.
///  - A rename whose target sits in a holding area is this folder's own
///    receiver relocating a file, and is seen as a plain deletion of the
///    original name.
fn normalize_event(folder_path: &Path, event: &Event) -> Vec<Normalized> {
	let name_of = |index: usize| relative_file_name(folder_path, event.paths.get(index)?);

	match event.kind {
		_ if is_content_change(&event.kind) => name_of(0).map(Normalized::Changed),
		EventKind::Create(_) => name_of(0).map(Normalized::Created),
		EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
			match (name_of(0), name_of(1)) {
				(Some(old), Some(new)) => Some(Normalized::Renamed { old, new }),
				// Target fell outside the watched namespace (holding area or
				// another directory): the file is gone from our perspective.
				(Some(old), None) => Some(Normalized::Deleted(old)),
				// Source was outside: the file just appeared.
				(None, Some(new)) => Some(Normalized::Created(new)),
				(None, None) => None,
			}
		}
		EventKind::Modify(ModifyKind::Name(RenameMode::From)) => name_of(0).map(Normalized::Deleted),
		EventKind::Modify(ModifyKind::Name(RenameMode::To)) => name_of(0).map(Normalized::Created),
		EventKind::Remove(_) => name_of(0).map(Normalized::Deleted),
		ref other => {
			trace!(kind = ?other, "Ignoring raw notification kind;");
			None
		}
	}
	.into_iter()
	.collect()
}

/// Resolves a notification path to a plain file name within the folder.
/// Paths outside the root, inside a holding area, nested in a subdirectory
/// or not valid UTF-8 are rejected.
fn relative_file_name(folder_path: &Path, path: &Path) -> Option<String> {
	let relative = path.strip_prefix(folder_path).ok()?;

	let mut components = relative.iter();
	let first = components.next()?.to_str()?;

	if components.next().is_some() || HOLDING_AREAS.contains(&first) {
		return None;
	}

	Some(first.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::suppress::DEFAULT_SUPPRESSION_TTL;

	use notify::event::{CreateKind, MetadataKind, RemoveKind};

	fn event(kind: EventKind, paths: &[&str]) -> Event {
		let mut event = Event::new(kind);
		for path in paths {
			event = event.add_path(PathBuf::from(path));
		}
		event
	}

	/// The raw kind this platform reports once a file's content settled.
	fn content_change_kind() -> EventKind {
		#[cfg(target_os = "linux")]
		{
			use notify::event::{AccessKind, AccessMode};
			EventKind::Access(AccessKind::Close(AccessMode::Write))
		}

		#[cfg(not(target_os = "linux"))]
		{
			use notify::event::DataChange;
			EventKind::Modify(ModifyKind::Data(DataChange::Any))
		}
	}

	fn root() -> PathBuf {
		PathBuf::from("/watched")
	}

	#[test]
	fn create_and_content_change_normalize_to_created_and_changed() {
		assert_eq!(
			normalize_event(
				&root(),
				&event(EventKind::Create(CreateKind::File), &["/watched/a.txt"])
			),
			vec![Normalized::Created("a.txt".into())]
		);
		assert_eq!(
			normalize_event(&root(), &event(content_change_kind(), &["/watched/a.txt"])),
			vec![Normalized::Changed("a.txt".into())]
		);
	}

	#[test]
	fn two_path_rename_normalizes_to_renamed() {
		assert_eq!(
			normalize_event(
				&root(),
				&event(
					EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
					&["/watched/a.txt", "/watched/b.txt"]
				)
			),
			vec![Normalized::Renamed {
				old: "a.txt".into(),
				new: "b.txt".into()
			}]
		);
	}

	#[test]
	fn rename_into_a_holding_area_is_a_deletion() {
		assert_eq!(
			normalize_event(
				&root(),
				&event(
					EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
					&["/watched/a.txt", "/watched/.deleted/a.txt"]
				)
			),
			vec![Normalized::Deleted("a.txt".into())]
		);
	}

	#[test]
	fn holding_area_and_metadata_noise_is_rejected() {
		assert!(normalize_event(
			&root(),
			&event(
				EventKind::Create(CreateKind::File),
				&["/watched/.backup/log.txt"]
			)
		)
		.is_empty());

		assert!(normalize_event(
			&root(),
			&event(
				EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)),
				&["/watched/a.txt"]
			)
		)
		.is_empty());

		// Nested paths are outside the flat namespace.
		assert!(normalize_event(
			&root(),
			&event(
				EventKind::Create(CreateKind::File),
				&["/watched/sub/a.txt"]
			)
		)
		.is_empty());
	}

	#[test]
	fn suppressed_notification_is_dropped_then_recorded_again() {
		let change_log = ChangeLog::new();
		let ignore = IgnoreList::new();

		ignore.register(ChangeKind::Changed, "x.txt", DEFAULT_SUPPRESSION_TTL);

		let changed = event(content_change_kind(), &["/watched/x.txt"]);

		capture_notification(&root(), &changed, &change_log, &ignore);
		assert!(change_log.is_empty());

		// The entry was consumed; the next notification is genuine.
		capture_notification(&root(), &changed, &change_log, &ignore);
		assert_eq!(change_log.len(), 1);
	}

	#[test]
	fn remove_notification_supersedes_pending_events() {
		let change_log = ChangeLog::new();
		let ignore = IgnoreList::new();

		capture_notification(
			&root(),
			&event(EventKind::Create(CreateKind::File), &["/watched/a.txt"]),
			&change_log,
			&ignore,
		);
		capture_notification(
			&root(),
			&event(EventKind::Remove(RemoveKind::File), &["/watched/a.txt"]),
			&change_log,
			&ignore,
		);

		let batch = change_log.pop_all();
		assert_eq!(batch.len(), 1);
		assert_eq!(batch[0].kind, ChangeKind::Deleted);
	}

	#[test]
	fn debounce_interval_stays_within_bounds() {
		for _ in 0..100 {
			let interval = debounce_interval();
			assert!(interval >= Duration::from_millis(DEBOUNCE_MIN_MS));
			assert!(interval < Duration::from_millis(DEBOUNCE_MAX_MS));
		}
	}
}
