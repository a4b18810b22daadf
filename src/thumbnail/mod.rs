use crate::{entity::Entity, error::FileIOError};

use std::{
	future::Future,
	io,
	path::Path,
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
	time::Duration,
};

use async_trait::async_trait;
use image::RgbaImage;
use once_cell::sync::Lazy;
use pin_project_lite::pin_project;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

mod lazy;
mod pipeline;

pub use lazy::LazyThumbnail;
pub use pipeline::Thumbnailer;

/// Windows raw os error for a sharing violation, the classic failure when
/// another process still holds the file open.
const SHARING_VIOLATION: i32 = 32;

#[derive(Error, Debug)]
pub enum ThumbnailError {
	#[error("file is temporarily locked: {0}")]
	Busy(FileIOError),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("error while decoding the image: {0}")]
	Image(#[from] image::ImageError),
	#[error("failed to encode webp")]
	Encoding,
	#[error("request canceled before completion")]
	Canceled,
}

impl ThumbnailError {
	/// Transient failures are worth retrying after a short delay; everything
	/// else keeps whatever image is already displayed.
	#[must_use]
	pub const fn is_transient(&self) -> bool {
		matches!(self, Self::Busy(_))
	}

	pub(crate) fn from_read(path: impl AsRef<Path>, source: io::Error) -> Self {
		if matches!(
			source.kind(),
			io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
		) || source.raw_os_error() == Some(SHARING_VIOLATION)
		{
			Self::Busy(FileIOError::from((path, source)))
		} else {
			Self::FileIO(FileIOError::from((path, source)))
		}
	}
}

/// Pixel extent of a thumbnail, or of the source it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbSize {
	pub width: u32,
	pub height: u32,
}

impl ThumbSize {
	#[must_use]
	pub const fn new(width: u32, height: u32) -> Self {
		Self { width, height }
	}

	/// Whether this extent is at least as large as `other` in both dimensions.
	#[must_use]
	pub const fn covers(self, other: Self) -> bool {
		self.width >= other.width && self.height >= other.height
	}

	/// Whether this extent is strictly larger than `other` in either dimension.
	#[must_use]
	pub const fn exceeds(self, other: Self) -> bool {
		self.width > other.width || self.height > other.height
	}

	/// Smallest extent covering `requested` at this aspect ratio, never
	/// scaled beyond the source extent itself.
	#[allow(
		clippy::cast_precision_loss,
		clippy::cast_possible_truncation,
		clippy::cast_sign_loss
	)]
	#[must_use]
	pub fn scaled_to_cover(self, requested: Self) -> Self {
		if self.width == 0 || self.height == 0 {
			return self;
		}

		let width = self.width as f32;
		let height = self.height as f32;

		let sf = (requested.width as f32 / width)
			.max(requested.height as f32 / height)
			.min(1.0);

		Self {
			width: (width * sf).round().max(1.0) as u32,
			height: (height * sf).round().max(1.0) as u32,
		}
	}
}

/// A decoded thumbnail plus the pixel extent of the source it came from.
///
/// For the embedded tier `original` is the stored preview's own extent; for
/// the native tier it is the full source file's extent. The lazy state
/// machine compares it against requested areas to decide whether a sharper
/// tier could still improve the display.
#[derive(Debug)]
pub struct Thumbnail {
	pub image: RgbaImage,
	pub original: ThumbSize,
}

impl Thumbnail {
	#[must_use]
	pub fn extent(&self) -> ThumbSize {
		let (width, height) = self.image.dimensions();
		ThumbSize { width, height }
	}
}

static PLACEHOLDER: Lazy<Arc<Thumbnail>> = Lazy::new(|| {
	Arc::new(Thumbnail {
		image: RgbaImage::new(1, 1),
		original: ThumbSize::new(0, 0),
	})
});

/// Shared image returned while nothing real has resolved yet.
///
/// Compared by identity and never disposed, so adopters can tell "nothing
/// yet" apart from a real one-pixel image.
#[must_use]
pub fn placeholder() -> Arc<Thumbnail> {
	Arc::clone(&PLACEHOLDER)
}

#[must_use]
pub fn is_placeholder(thumbnail: &Arc<Thumbnail>) -> bool {
	Arc::ptr_eq(thumbnail, &PLACEHOLDER)
}

/// What a finished tier request resolves to. `Ok(None)` means the embedded
/// slot had nothing stored, which is not an error.
pub type LoadResult = Result<Option<Arc<Thumbnail>>, ThumbnailError>;

pin_project! {
	/// Single-assignment handle to an in-flight tier request.
	///
	/// Non-blocking consumers poll [`ThumbLoad::try_now`] on their tick;
	/// awaiting the handle works too. A dropped pipeline counts as
	/// cancellation.
	#[derive(Debug)]
	pub struct ThumbLoad {
		#[pin]
		done_rx: oneshot::Receiver<LoadResult>,
	}
}

impl ThumbLoad {
	/// An unresolved load and the sender completing it. The pipeline drives
	/// this internally; loader doubles in tests do the same.
	#[must_use]
	pub fn channel() -> (oneshot::Sender<LoadResult>, Self) {
		let (done_tx, done_rx) = oneshot::channel();

		(done_tx, Self { done_rx })
	}

	/// A load that already finished with `result`.
	#[must_use]
	pub fn resolved(result: LoadResult) -> Self {
		let (done_tx, load) = Self::channel();
		done_tx.send(result).ok();

		load
	}

	/// Returns the result if the request has finished, without blocking.
	pub fn try_now(&mut self) -> Option<LoadResult> {
		match self.done_rx.try_recv() {
			Ok(result) => Some(result),
			Err(oneshot::error::TryRecvError::Empty) => None,
			Err(oneshot::error::TryRecvError::Closed) => Some(Err(ThumbnailError::Canceled)),
		}
	}
}

impl Future for ThumbLoad {
	type Output = LoadResult;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		self.project()
			.done_rx
			.poll(cx)
			.map(|received| received.unwrap_or(Err(ThumbnailError::Canceled)))
	}
}

/// Storage collaborator owning the entities.
///
/// `read_all_bytes` is the sole disk-read primitive the native tier uses,
/// isolated here so tests can substitute in-memory files; `store_thumbnail`
/// persists the freshly written embedded slot of `entity`.
#[async_trait]
pub trait EntityStore: Send + Sync + 'static {
	async fn read_all_bytes(&self, path: &Path) -> io::Result<Vec<u8>>;

	async fn store_thumbnail(&self, entity: &Entity) -> io::Result<()>;
}

/// Notified whenever a native thumbnail lands, so the embedder can repaint
/// the affected grid cell.
pub trait NewThumbnailReporter: Send + Sync + 'static {
	fn new_thumbnail(&self, path: &Path);
}

/// The pipeline seam lazy thumbnails talk to. [`Thumbnailer`] is the real
/// implementation.
pub trait ThumbnailLoader: Send + Sync + 'static {
	/// Decodes the preview stored in the entity's own metadata, entirely
	/// in-process. Resolves with `Ok(None)` right away when the slot is
	/// empty; never queues.
	fn load_embedded(&self, entity: &Arc<Entity>) -> ThumbLoad;

	/// Queues a full decode of the original file, regenerating a thumbnail
	/// covering `requested`. The request carries `cancel` for its whole life.
	fn load_native(
		&self,
		entity: &Arc<Entity>,
		requested: ThumbSize,
		cancel: CancellationToken,
	) -> ThumbLoad;

	/// Moves the queued request matching `path` to the front of the queue.
	/// A no-op when no request for `path` is queued.
	fn prioritize(&self, path: &Path);
}

/// Creates the lazy thumbnail attached to each delivered view.
#[derive(Clone)]
pub struct ThumbnailFactory {
	loader: Arc<dyn ThumbnailLoader>,
	retry_delay: Duration,
}

impl ThumbnailFactory {
	#[must_use]
	pub fn new(loader: Arc<dyn ThumbnailLoader>, retry_delay: Duration) -> Self {
		Self {
			loader,
			retry_delay,
		}
	}

	#[must_use]
	pub fn create(&self, entity: Arc<Entity>) -> LazyThumbnail {
		LazyThumbnail::new(entity, Arc::clone(&self.loader), self.retry_delay)
	}
}
