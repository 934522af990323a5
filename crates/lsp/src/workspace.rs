//! Workspaces and session scopes.
//!
//! A [`SessionScope`] is the place a session is rooted in: either a
//! [`Workspace`] with a live set of folders, or a bare filesystem path for
//! single-file hosts. Scopes form part of the identity of a session in the
//! registry, and workspaces broadcast folder changes so that interested
//! sessions can forward them as `didChangeWorkspaceFolders`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lsp_types::{Url, WorkspaceFolder};
use parking_lot::RwLock;
use tokio::sync::broadcast;

static NEXT_WORKSPACE_ID: AtomicU64 = AtomicU64::new(1);

const FOLDER_CHANNEL_CAPACITY: usize = 16;

/// Identifier of a [`Workspace`], unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkspaceId(pub u64);

impl fmt::Display for WorkspaceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ws#{}", self.0)
	}
}

/// One batch of workspace folder additions and removals.
#[derive(Debug, Clone)]
pub struct FolderChange {
	pub added: Vec<WorkspaceFolder>,
	pub removed: Vec<WorkspaceFolder>,
}

/// A named collection of root folders that can change over time.
#[derive(Debug)]
pub struct Workspace {
	id: WorkspaceId,
	name: String,
	folders: RwLock<Vec<WorkspaceFolder>>,
	changes: broadcast::Sender<FolderChange>,
}

impl Workspace {
	pub fn new(name: impl Into<String>) -> Arc<Self> {
		let (changes, _) = broadcast::channel(FOLDER_CHANNEL_CAPACITY);
		Arc::new(Self {
			id: WorkspaceId(NEXT_WORKSPACE_ID.fetch_add(1, Ordering::Relaxed)),
			name: name.into(),
			folders: RwLock::new(Vec::new()),
			changes,
		})
	}

	pub fn id(&self) -> WorkspaceId {
		self.id
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn folders(&self) -> Vec<WorkspaceFolder> {
		self.folders.read().clone()
	}

	/// Add a folder and broadcast the change. Folders already present (by
	/// uri) are ignored.
	pub fn add_folder(&self, folder: WorkspaceFolder) {
		{
			let mut folders = self.folders.write();
			if folders.iter().any(|f| f.uri == folder.uri) {
				return;
			}
			folders.push(folder.clone());
		}
		let _ = self.changes.send(FolderChange {
			added: vec![folder],
			removed: Vec::new(),
		});
	}

	/// Add a folder by filesystem path. Returns `false` when the path cannot
	/// be expressed as a file uri.
	pub fn add_folder_path(&self, path: &Path) -> bool {
		match Url::from_file_path(path) {
			Ok(uri) => {
				self.add_folder(workspace_folder_from_uri(uri));
				true
			}
			Err(()) => false,
		}
	}

	pub fn remove_folder(&self, uri: &Url) {
		let removed = {
			let mut folders = self.folders.write();
			let Some(pos) = folders.iter().position(|f| &f.uri == uri) else {
				return;
			};
			folders.remove(pos)
		};
		let _ = self.changes.send(FolderChange {
			added: Vec::new(),
			removed: vec![removed],
		});
	}

	/// Subscribe to folder additions and removals. Only changes made after
	/// the call are delivered.
	pub fn subscribe(&self) -> broadcast::Receiver<FolderChange> {
		self.changes.subscribe()
	}
}

/// Derive a [`WorkspaceFolder`] from a uri, naming it after the last
/// non-empty path segment.
pub(crate) fn workspace_folder_from_uri(uri: Url) -> WorkspaceFolder {
	let name = uri
		.path_segments()
		.and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
		.unwrap_or_default()
		.to_owned();
	WorkspaceFolder { uri, name }
}

/// Where a session is rooted.
#[derive(Debug, Clone)]
pub enum SessionScope {
	/// Rooted in a workspace; follows its folder set.
	Workspace(Arc<Workspace>),
	/// Rooted at a single filesystem path, for hosts without a workspace
	/// concept or for loose files.
	Path(PathBuf),
}

/// Hashable identity of a scope, used as part of registry keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ScopeKey {
	Workspace(u64),
	Path(PathBuf),
}

impl SessionScope {
	pub fn workspace(workspace: &Arc<Workspace>) -> Self {
		SessionScope::Workspace(Arc::clone(workspace))
	}

	pub fn path(path: impl Into<PathBuf>) -> Self {
		SessionScope::Path(path.into())
	}

	/// Whether two scopes denote the same root. Workspaces compare by id,
	/// paths by equality.
	pub fn matches(&self, other: &SessionScope) -> bool {
		match (self, other) {
			(SessionScope::Workspace(a), SessionScope::Workspace(b)) => a.id() == b.id(),
			(SessionScope::Path(a), SessionScope::Path(b)) => a == b,
			_ => false,
		}
	}

	pub(crate) fn key(&self) -> ScopeKey {
		match self {
			SessionScope::Workspace(ws) => ScopeKey::Workspace(ws.id().0),
			SessionScope::Path(path) => ScopeKey::Path(path.clone()),
		}
	}

	/// Folders announced to servers for this scope. A path scope is exposed
	/// as a single synthetic folder when the path converts to a file uri.
	pub fn folders(&self) -> Vec<WorkspaceFolder> {
		match self {
			SessionScope::Workspace(ws) => ws.folders(),
			SessionScope::Path(path) => Url::from_file_path(path)
				.ok()
				.map(workspace_folder_from_uri)
				.into_iter()
				.collect(),
		}
	}

	pub fn root_uri(&self) -> Option<Url> {
		match self {
			SessionScope::Workspace(ws) => ws.folders().first().map(|f| f.uri.clone()),
			SessionScope::Path(path) => Url::from_file_path(path).ok(),
		}
	}

	/// Filesystem root used as the default working directory for spawned
	/// servers.
	pub fn root_path(&self) -> Option<PathBuf> {
		match self {
			SessionScope::Workspace(ws) => ws
				.folders()
				.first()
				.and_then(|f| f.uri.to_file_path().ok()),
			SessionScope::Path(path) => Some(path.clone()),
		}
	}

	pub fn name(&self) -> String {
		match self {
			SessionScope::Workspace(ws) => ws.name().to_owned(),
			SessionScope::Path(path) => path.display().to_string(),
		}
	}

	/// Folder change feed, present for workspace scopes only.
	pub fn subscribe_folders(&self) -> Option<broadcast::Receiver<FolderChange>> {
		match self {
			SessionScope::Workspace(ws) => Some(ws.subscribe()),
			SessionScope::Path(_) => None,
		}
	}
}
