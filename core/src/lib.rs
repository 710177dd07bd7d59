//! Replication core for mirroring a set of independently watched folders.
//!
//! A file created, modified, renamed or deleted in one shared folder is
//! eventually reproduced in all others. Raw filesystem notifications are
//! coalesced into a minimal ordered change log per folder, drained on a
//! jittered debounce schedule, and dispatched to every other registered
//! receiver. Applying a remote change registers the notifications it will
//! echo back, so self-inflicted edits are not re-broadcast; when the same
//! file diverged on two sides, a metadata-then-hash conflict ladder decides
//! which copy wins, and the losing copy is moved to a recoverable holding
//! area instead of being destroyed.

pub mod change_log;
pub mod conflict;
pub mod digest;
pub mod dispatch;
pub mod event;
pub mod listener;
pub mod receiver;
pub mod registry;
pub mod suppress;

pub use change_log::ChangeLog;
pub use conflict::{Resolution, TieBreak};
pub use dispatch::{DispatchError, SyncDispatcher};
pub use event::{ChangeEvent, ChangeKind, SyncMetadata};
pub use listener::{FolderListener, ListenerError};
pub use receiver::{
	ApplyOutcome, LocalFolderReceiver, Receiver, ReceiverError, RemoteServerReceiver,
};
pub use registry::ReceiverRegistry;
pub use suppress::IgnoreList;
