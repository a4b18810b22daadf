use std::{
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicU8, Ordering},
		Arc, Mutex, PoisonError, RwLock,
	},
};

use chrono::{DateTime, Utc};

use crate::thumbnail::LazyThumbnail;

/// What a discovered filesystem record is, as far as thumbnailing cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
	Directory,
	Image,
	Other,
}

/// A file or directory record, owned by external storage.
///
/// The path is interior mutable because rename and move notifications patch
/// it in place while views keep holding the same `Arc<Entity>`. The embedded
/// slot caches the preview bytes stored in the file's own metadata and is
/// also the write-through target for generated native thumbnails.
#[derive(Debug)]
pub struct Entity {
	path: RwLock<PathBuf>,
	kind: EntityKind,
	size_in_bytes: u64,
	date_created: DateTime<Utc>,
	date_modified: DateTime<Utc>,
	embedded: Mutex<Option<Arc<[u8]>>>,
}

impl Entity {
	#[must_use]
	pub fn new(
		path: impl Into<PathBuf>,
		kind: EntityKind,
		size_in_bytes: u64,
		date_created: DateTime<Utc>,
		date_modified: DateTime<Utc>,
	) -> Self {
		Self {
			path: RwLock::new(path.into()),
			kind,
			size_in_bytes,
			date_created,
			date_modified,
			embedded: Mutex::new(None),
		}
	}

	/// Attaches preview bytes already extracted from the file's metadata.
	#[must_use]
	pub fn with_embedded(self, bytes: impl Into<Arc<[u8]>>) -> Self {
		*self
			.embedded
			.lock()
			.unwrap_or_else(PoisonError::into_inner) = Some(bytes.into());

		self
	}

	#[must_use]
	pub fn path(&self) -> PathBuf {
		self.path
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	#[must_use]
	pub fn path_matches(&self, other: &Path) -> bool {
		self.path
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.as_path()
			== other
	}

	pub fn set_path(&self, path: impl Into<PathBuf>) {
		*self.path.write().unwrap_or_else(PoisonError::into_inner) = path.into();
	}

	#[must_use]
	pub const fn kind(&self) -> EntityKind {
		self.kind
	}

	#[must_use]
	pub const fn size_in_bytes(&self) -> u64 {
		self.size_in_bytes
	}

	#[must_use]
	pub const fn date_created(&self) -> DateTime<Utc> {
		self.date_created
	}

	#[must_use]
	pub const fn date_modified(&self) -> DateTime<Utc> {
		self.date_modified
	}

	#[must_use]
	pub fn embedded(&self) -> Option<Arc<[u8]>> {
		self.embedded
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	pub fn set_embedded(&self, bytes: impl Into<Arc<[u8]>>) {
		*self
			.embedded
			.lock()
			.unwrap_or_else(PoisonError::into_inner) = Some(bytes.into());
	}
}

/// Grid display state of a delivered view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ViewState {
	None = 0,
	Active = 1,
	Selected = 2,
}

/// UI-facing pairing of an entity with its lazy thumbnail and display state.
///
/// Created by the query evaluator for each discovered entity; the thumbnail
/// is disposed when the view leaves the delivered index or when the owner
/// releases the whole list.
#[derive(Debug)]
pub struct EntityView {
	entity: Arc<Entity>,
	thumbnail: LazyThumbnail,
	state: AtomicU8,
}

impl EntityView {
	#[must_use]
	pub fn new(entity: Arc<Entity>, thumbnail: LazyThumbnail) -> Self {
		Self {
			entity,
			thumbnail,
			state: AtomicU8::new(ViewState::None as u8),
		}
	}

	#[must_use]
	pub fn entity(&self) -> &Arc<Entity> {
		&self.entity
	}

	#[must_use]
	pub fn thumbnail(&self) -> &LazyThumbnail {
		&self.thumbnail
	}

	#[must_use]
	pub fn view_state(&self) -> ViewState {
		match self.state.load(Ordering::Relaxed) {
			1 => ViewState::Active,
			2 => ViewState::Selected,
			_ => ViewState::None,
		}
	}

	pub fn set_view_state(&self, state: ViewState) {
		self.state.store(state as u8, Ordering::Relaxed);
	}
}
