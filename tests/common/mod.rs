#![allow(dead_code)]

use lightbox_engine::{
	entity_order, ChangeWatcher, Entity, EntityChange, EntityKind, EntityStore, EntityStream,
	EntityView, EvaluatorState, LoadResult, NewThumbnailReporter, Query, QueryError, QueryFault,
	QueryFaultReporter, SortOrder, ThumbLoad, ThumbSize, Thumbnail, ThumbnailLoader,
};

use std::{
	collections::HashMap,
	ffi::OsString,
	io,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use async_channel as chan;
use async_trait::async_trait;
use chrono::Utc;
use futures::{stream, StreamExt};
use image::{DynamicImage, Rgba, RgbaImage};
use tokio::{
	fs,
	sync::{oneshot, watch, Semaphore},
	time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

const READ_LATENCY: Duration = Duration::from_millis(10);

pub fn image_entity(path: impl Into<PathBuf>) -> Arc<Entity> {
	Arc::new(Entity::new(
		path,
		EntityKind::Image,
		1024,
		Utc::now(),
		Utc::now(),
	))
}

pub fn directory_entity(path: impl Into<PathBuf>) -> Arc<Entity> {
	Arc::new(Entity::new(
		path,
		EntityKind::Directory,
		0,
		Utc::now(),
		Utc::now(),
	))
}

pub fn name_order() -> Arc<dyn SortOrder<Arc<EntityView>>> {
	entity_order(|a, b| a.path().cmp(&b.path()))
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
	let mut bytes = Vec::new();

	DynamicImage::ImageRgba8(RgbaImage::from_pixel(
		width,
		height,
		Rgba([120, 130, 140, 255]),
	))
	.write_to(
		&mut io::Cursor::new(&mut bytes),
		image::ImageOutputFormat::Png,
	)
	.expect("failed to encode test png");

	bytes
}

pub fn thumb(width: u32, height: u32) -> Arc<Thumbnail> {
	thumb_with_original(width, height, width, height)
}

pub fn thumb_with_original(
	width: u32,
	height: u32,
	original_width: u32,
	original_height: u32,
) -> Arc<Thumbnail> {
	Arc::new(Thumbnail {
		image: RgbaImage::new(width, height),
		original: ThumbSize::new(original_width, original_height),
	})
}

/// In-memory [`EntityStore`] that records every interaction, with optional
/// gating and failure injection.
pub struct MemoryStore {
	files: Mutex<HashMap<PathBuf, Vec<u8>>>,
	read_order: Mutex<Vec<PathBuf>>,
	reads_in_flight: AtomicUsize,
	max_reads_in_flight: AtomicUsize,
	gated: AtomicBool,
	gate: Semaphore,
	stored: Mutex<Vec<PathBuf>>,
	fail_store: AtomicBool,
	busy_reads: AtomicUsize,
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self {
			files: Mutex::default(),
			read_order: Mutex::default(),
			reads_in_flight: AtomicUsize::new(0),
			max_reads_in_flight: AtomicUsize::new(0),
			gated: AtomicBool::new(false),
			gate: Semaphore::new(0),
			stored: Mutex::default(),
			fail_store: AtomicBool::new(false),
			busy_reads: AtomicUsize::new(0),
		}
	}
}

impl MemoryStore {
	pub fn arc() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn insert_file(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
		self.files.lock().unwrap().insert(path.into(), bytes);
	}

	/// Makes every following read block until [`MemoryStore::release_reads`]
	/// hands out permits.
	pub fn hold_reads(&self) {
		self.gated.store(true, Ordering::SeqCst);
	}

	pub fn release_reads(&self, count: usize) {
		self.gate.add_permits(count);
	}

	/// The next `count` reads fail with `WouldBlock`, as a locked file would.
	pub fn make_busy(&self, count: usize) {
		self.busy_reads.store(count, Ordering::SeqCst);
	}

	pub fn fail_store(&self) {
		self.fail_store.store(true, Ordering::SeqCst);
	}

	pub fn read_order(&self) -> Vec<PathBuf> {
		self.read_order.lock().unwrap().clone()
	}

	pub fn max_reads_in_flight(&self) -> usize {
		self.max_reads_in_flight.load(Ordering::SeqCst)
	}

	pub fn stored(&self) -> Vec<PathBuf> {
		self.stored.lock().unwrap().clone()
	}
}

#[async_trait]
impl EntityStore for MemoryStore {
	async fn read_all_bytes(&self, path: &Path) -> io::Result<Vec<u8>> {
		self.read_order.lock().unwrap().push(path.to_path_buf());

		let concurrent = self.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
		self.max_reads_in_flight
			.fetch_max(concurrent, Ordering::SeqCst);

		if self.gated.load(Ordering::SeqCst) {
			if let Ok(permit) = self.gate.acquire().await {
				permit.forget();
			}
		} else {
			sleep(READ_LATENCY).await;
		}

		self.reads_in_flight.fetch_sub(1, Ordering::SeqCst);

		if self.busy_reads.load(Ordering::SeqCst) > 0 {
			self.busy_reads.fetch_sub(1, Ordering::SeqCst);
			return Err(io::Error::new(io::ErrorKind::WouldBlock, "file is busy"));
		}

		self.files
			.lock()
			.unwrap()
			.get(path)
			.cloned()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such test file"))
	}

	async fn store_thumbnail(&self, entity: &Entity) -> io::Result<()> {
		if self.fail_store.load(Ordering::SeqCst) {
			return Err(io::Error::new(
				io::ErrorKind::PermissionDenied,
				"store disabled for this test",
			));
		}

		self.stored.lock().unwrap().push(entity.path());

		Ok(())
	}
}

/// [`EntityStore`] over a real directory, reading with [`tokio::fs`] and
/// persisting generated previews as flat `.webp` files.
pub struct DiskStore {
	previews: PathBuf,
}

impl DiskStore {
	pub fn arc(previews: impl Into<PathBuf>) -> Arc<Self> {
		Arc::new(Self {
			previews: previews.into(),
		})
	}

	pub fn preview_path(&self, path: &Path) -> PathBuf {
		let mut name = path
			.file_stem()
			.map_or_else(OsString::new, ToOwned::to_owned);
		name.push(".webp");

		self.previews.join(name)
	}
}

#[async_trait]
impl EntityStore for DiskStore {
	async fn read_all_bytes(&self, path: &Path) -> io::Result<Vec<u8>> {
		fs::read(path).await
	}

	async fn store_thumbnail(&self, entity: &Entity) -> io::Result<()> {
		let Some(webp) = entity.embedded() else {
			return Ok(());
		};

		fs::write(self.preview_path(&entity.path()), webp.as_ref()).await
	}
}

/// [`ThumbnailLoader`] double that records calls and lets tests resolve each
/// load by hand, oldest first.
#[derive(Default)]
pub struct TestLoader {
	embedded_calls: AtomicUsize,
	native_calls: AtomicUsize,
	native_sizes: Mutex<Vec<ThumbSize>>,
	prioritized: Mutex<Vec<PathBuf>>,
	pending_embedded: Mutex<Vec<oneshot::Sender<LoadResult>>>,
	pending_native: Mutex<Vec<oneshot::Sender<LoadResult>>>,
}

impl TestLoader {
	pub fn arc() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn embedded_calls(&self) -> usize {
		self.embedded_calls.load(Ordering::SeqCst)
	}

	pub fn native_calls(&self) -> usize {
		self.native_calls.load(Ordering::SeqCst)
	}

	pub fn native_sizes(&self) -> Vec<ThumbSize> {
		self.native_sizes.lock().unwrap().clone()
	}

	pub fn prioritized(&self) -> Vec<PathBuf> {
		self.prioritized.lock().unwrap().clone()
	}

	/// Resolves the oldest outstanding embedded load. Returns whether the
	/// result was actually received; a dropped receiver swallows it.
	pub fn resolve_embedded(&self, result: LoadResult) -> bool {
		let Some(done_tx) = Self::pop_oldest(&self.pending_embedded) else {
			return false;
		};

		done_tx.send(result).is_ok()
	}

	/// Resolves the oldest outstanding native load, same contract as
	/// [`TestLoader::resolve_embedded`].
	pub fn resolve_native(&self, result: LoadResult) -> bool {
		let Some(done_tx) = Self::pop_oldest(&self.pending_native) else {
			return false;
		};

		done_tx.send(result).is_ok()
	}

	fn pop_oldest(
		pending: &Mutex<Vec<oneshot::Sender<LoadResult>>>,
	) -> Option<oneshot::Sender<LoadResult>> {
		let mut pending = pending.lock().unwrap();

		if pending.is_empty() {
			None
		} else {
			Some(pending.remove(0))
		}
	}
}

impl ThumbnailLoader for TestLoader {
	fn load_embedded(&self, _entity: &Arc<Entity>) -> ThumbLoad {
		self.embedded_calls.fetch_add(1, Ordering::SeqCst);

		let (done_tx, load) = ThumbLoad::channel();
		self.pending_embedded.lock().unwrap().push(done_tx);

		load
	}

	fn load_native(
		&self,
		_entity: &Arc<Entity>,
		requested: ThumbSize,
		_cancel: CancellationToken,
	) -> ThumbLoad {
		self.native_calls.fetch_add(1, Ordering::SeqCst);
		self.native_sizes.lock().unwrap().push(requested);

		let (done_tx, load) = ThumbLoad::channel();
		self.pending_native.lock().unwrap().push(done_tx);

		load
	}

	fn prioritize(&self, path: &Path) {
		self.prioritized.lock().unwrap().push(path.to_path_buf());
	}
}

/// Query over a fixed list of results, enumerated in the given order.
pub struct StaticQuery {
	items: Vec<Result<Arc<Entity>, QueryFault>>,
}

impl StaticQuery {
	pub fn new(items: Vec<Result<Arc<Entity>, QueryFault>>) -> Arc<Self> {
		Arc::new(Self { items })
	}

	pub fn of_entities(entities: Vec<Arc<Entity>>) -> Arc<Self> {
		Self::new(entities.into_iter().map(Ok).collect())
	}
}

impl Query for StaticQuery {
	fn order(&self) -> Arc<dyn SortOrder<Arc<EntityView>>> {
		name_order()
	}

	fn evaluate(&self, _cancel: CancellationToken) -> Result<EntityStream, QueryError> {
		Ok(stream::iter(self.items.clone()).boxed())
	}
}

/// Query that yields `head` and then never finishes.
pub struct PendingQuery {
	head: Vec<Arc<Entity>>,
}

impl PendingQuery {
	pub fn with_head(head: Vec<Arc<Entity>>) -> Arc<Self> {
		Arc::new(Self { head })
	}
}

impl Query for PendingQuery {
	fn order(&self) -> Arc<dyn SortOrder<Arc<EntityView>>> {
		name_order()
	}

	fn evaluate(&self, _cancel: CancellationToken) -> Result<EntityStream, QueryError> {
		Ok(stream::iter(self.head.clone().into_iter().map(Ok))
			.chain(stream::pending())
			.boxed())
	}
}

/// Query that refuses to start.
pub struct FailingQuery;

impl Query for FailingQuery {
	fn order(&self) -> Arc<dyn SortOrder<Arc<EntityView>>> {
		name_order()
	}

	fn evaluate(&self, _cancel: CancellationToken) -> Result<EntityStream, QueryError> {
		Err(QueryError::Start(QueryFault {
			line: 1,
			column: 7,
			message: "unknown field 'albmu'".into(),
		}))
	}
}

#[derive(Default)]
pub struct CollectingReporter {
	faults: Mutex<Vec<QueryFault>>,
}

impl CollectingReporter {
	pub fn arc() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn faults(&self) -> Vec<QueryFault> {
		self.faults.lock().unwrap().clone()
	}
}

impl QueryFaultReporter for CollectingReporter {
	fn report(&self, fault: &QueryFault) {
		self.faults.lock().unwrap().push(fault.clone());
	}
}

#[derive(Default)]
pub struct ThumbnailLog {
	paths: Mutex<Vec<PathBuf>>,
}

impl ThumbnailLog {
	pub fn arc() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn reported(&self) -> Vec<PathBuf> {
		self.paths.lock().unwrap().clone()
	}
}

impl NewThumbnailReporter for ThumbnailLog {
	fn new_thumbnail(&self, path: &Path) {
		self.paths.lock().unwrap().push(path.to_path_buf());
	}
}

/// Hand-driven [`ChangeWatcher`] for tests.
pub struct TestWatcher {
	changes_tx: chan::Sender<EntityChange>,
	changes_rx: chan::Receiver<EntityChange>,
}

impl Default for TestWatcher {
	fn default() -> Self {
		let (changes_tx, changes_rx) = chan::unbounded();

		Self {
			changes_tx,
			changes_rx,
		}
	}
}

impl TestWatcher {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn emit(&self, change: EntityChange) {
		self.changes_tx.try_send(change).ok();
	}
}

impl ChangeWatcher for TestWatcher {
	fn subscribe(&self) -> chan::Receiver<EntityChange> {
		self.changes_rx.clone()
	}
}

pub async fn wait_for_state(rx: &mut watch::Receiver<EvaluatorState>, target: EvaluatorState) {
	timeout(Duration::from_secs(5), async {
		while *rx.borrow_and_update() != target {
			rx.changed().await.expect("state channel closed");
		}
	})
	.await
	.unwrap_or_else(|_| panic!("timed out waiting for evaluator state {target:?}"));
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
	timeout(Duration::from_secs(5), async {
		while !condition() {
			sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("timed out waiting for condition");
}
