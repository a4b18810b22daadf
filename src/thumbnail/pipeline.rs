use crate::{config::ThumbnailerConfig, entity::Entity, error::FileIOError};

use std::{
	collections::VecDeque,
	ops::Deref,
	path::{Path, PathBuf},
	sync::{Arc, Mutex, PoisonError},
};

use futures_concurrency::future::Race;
use image::{imageops, GenericImageView};
use tokio::{
	runtime::Handle,
	spawn,
	sync::{oneshot, AcquireError, Notify, OwnedSemaphorePermit, Semaphore},
	task::spawn_blocking,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, trace};
use webp::Encoder;

use super::{
	EntityStore, LoadResult, NewThumbnailReporter, ThumbLoad, ThumbSize, Thumbnail, ThumbnailError,
	ThumbnailLoader,
};

/// A queued native tier request.
struct NativeRequest {
	entity: Arc<Entity>,
	requested: ThumbSize,
	cancel: CancellationToken,
	done_tx: oneshot::Sender<LoadResult>,
}

type RequestQueue = Arc<Mutex<VecDeque<NativeRequest>>>;

/// Two-tier thumbnail pipeline.
///
/// The embedded tier decodes the preview already sitting in an entity's
/// metadata, in-process and unqueued. The native tier queues a full decode of
/// the original file: one worker serializes the disk reads so exactly one is
/// ever in flight, while the decode/resize/encode step behind each read runs
/// through an admission gate sized to the number of processing units, keeping
/// reads ordered and decoding parallel.
///
/// Dropping the handle stops the worker and fails everything still queued
/// with [`ThumbnailError::Canceled`].
pub struct Thumbnailer {
	queue: RequestQueue,
	queue_wake: Arc<Notify>,
	handle: Handle,
	_cancel_loop: DropGuard,
}

impl Thumbnailer {
	/// Must be called from within the runtime; the handle is captured so UI
	/// threads can issue loads later.
	#[must_use]
	pub fn new(
		config: &ThumbnailerConfig,
		store: Arc<dyn EntityStore>,
		reporter: Arc<dyn NewThumbnailReporter>,
	) -> Self {
		let queue: RequestQueue = Arc::new(Mutex::new(VecDeque::with_capacity(32)));
		let queue_wake = Arc::new(Notify::new());
		let decode_gate = Arc::new(Semaphore::new(config.effective_parallelism()));
		let quality = config.quality;
		let cancel_token = CancellationToken::new();

		let inner_cancel_token = cancel_token.child_token();
		spawn({
			let queue = Arc::clone(&queue);
			let queue_wake = Arc::clone(&queue_wake);

			async move {
				loop {
					if let Err(e) = spawn(io_worker(
						Arc::clone(&queue),
						Arc::clone(&queue_wake),
						Arc::clone(&decode_gate),
						Arc::clone(&store),
						Arc::clone(&reporter),
						quality,
						inner_cancel_token.child_token(),
					))
					.await
					{
						error!("Error on thumbnail I/O worker; Error: {e}; Restarting the worker loop...");
					}

					if inner_cancel_token.is_cancelled() {
						break;
					}
				}
			}
		});

		Self {
			queue,
			queue_wake,
			handle: Handle::current(),
			_cancel_loop: cancel_token.drop_guard(),
		}
	}
}

impl ThumbnailLoader for Thumbnailer {
	fn load_embedded(&self, entity: &Arc<Entity>) -> ThumbLoad {
		let Some(bytes) = entity.embedded() else {
			// Nothing stored in the metadata slot; resolve right away instead
			// of making the caller wait on an inevitable miss
			return ThumbLoad::resolved(Ok(None));
		};

		let (done_tx, load) = ThumbLoad::channel();

		self.handle.spawn_blocking(move || {
			done_tx
				.send(decode_embedded_thumbnail(&bytes).map(|thumbnail| Some(Arc::new(thumbnail))))
				.ok();
		});

		load
	}

	fn load_native(
		&self,
		entity: &Arc<Entity>,
		requested: ThumbSize,
		cancel: CancellationToken,
	) -> ThumbLoad {
		let (done_tx, load) = ThumbLoad::channel();

		self.queue
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.push_back(NativeRequest {
				entity: Arc::clone(entity),
				requested,
				cancel,
				done_tx,
			});
		self.queue_wake.notify_one();

		load
	}

	fn prioritize(&self, path: &Path) {
		let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

		// At most one match moves; the relative order of the rest stays put
		if let Some(at) = queue
			.iter()
			.position(|request| request.entity.path_matches(path))
		{
			if at > 0 {
				if let Some(request) = queue.remove(at) {
					trace!("Promoted thumbnail request for {}", path.display());
					queue.push_front(request);
				}
			}
		}
	}
}

async fn io_worker(
	queue: RequestQueue,
	queue_wake: Arc<Notify>,
	decode_gate: Arc<Semaphore>,
	store: Arc<dyn EntityStore>,
	reporter: Arc<dyn NewThumbnailReporter>,
	quality: f32,
	cancel_token: CancellationToken,
) {
	enum RaceOutputs {
		Woken,
		Stop,
	}

	loop {
		if cancel_token.is_cancelled() {
			break;
		}

		let next = queue
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.pop_front();

		let Some(request) = next else {
			let outcome = (
				async {
					queue_wake.notified().await;
					RaceOutputs::Woken
				},
				async {
					cancel_token.cancelled().await;
					RaceOutputs::Stop
				},
			)
				.race()
				.await;

			if matches!(outcome, RaceOutputs::Stop) {
				break;
			}

			continue;
		};

		// A request canceled while it sat in the queue must not touch the disk
		if request.cancel.is_cancelled() {
			request.done_tx.send(Err(ThumbnailError::Canceled)).ok();
			continue;
		}

		let path = request.entity.path();

		// The single in-flight disk read; keeping this await serialized is
		// the whole point of this worker
		match store.read_all_bytes(&path).await {
			Ok(bytes) => {
				// Decoding parallelizes from here on, the worker is free for
				// the next read immediately
				spawn(decode_and_store(
					request,
					path,
					bytes,
					Arc::clone(&decode_gate),
					Arc::clone(&store),
					Arc::clone(&reporter),
					quality,
				));
			}
			Err(e) => {
				request
					.done_tx
					.send(Err(ThumbnailError::from_read(&path, e)))
					.ok();
			}
		}
	}

	// Whatever is still queued at shutdown resolves as canceled
	for request in queue
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.drain(..)
	{
		request.done_tx.send(Err(ThumbnailError::Canceled)).ok();
	}

	debug!("Thumbnail I/O worker stopping");
}

async fn decode_and_store(
	request: NativeRequest,
	path: PathBuf,
	bytes: Vec<u8>,
	decode_gate: Arc<Semaphore>,
	store: Arc<dyn EntityStore>,
	reporter: Arc<dyn NewThumbnailReporter>,
	quality: f32,
) {
	let NativeRequest {
		entity,
		requested,
		cancel,
		done_tx,
	} = request;

	enum RaceOutputs {
		Admitted(Result<OwnedSemaphorePermit, AcquireError>),
		Canceled,
	}

	let outcome = (
		async { RaceOutputs::Admitted(decode_gate.acquire_owned().await) },
		async {
			cancel.cancelled().await;
			RaceOutputs::Canceled
		},
	)
		.race()
		.await;

	let _permit = match outcome {
		RaceOutputs::Admitted(Ok(permit)) => permit,
		RaceOutputs::Admitted(Err(_)) | RaceOutputs::Canceled => {
			done_tx.send(Err(ThumbnailError::Canceled)).ok();
			return;
		}
	};

	// The race may have admitted us in the same instant the token fired, so
	// re-check before committing a processing unit to the decode
	if cancel.is_cancelled() {
		done_tx.send(Err(ThumbnailError::Canceled)).ok();
		return;
	}

	let decode_res =
		spawn_blocking(move || generate_native_thumbnail(&bytes, requested, quality)).await;

	let (thumbnail, webp) = match decode_res {
		Ok(Ok(generated)) => generated,
		Ok(Err(e)) => {
			done_tx.send(Err(e)).ok();
			return;
		}
		Err(e) => {
			error!("Failed to join thumbnail decode task: {e:#?}");
			done_tx.send(Err(ThumbnailError::Canceled)).ok();
			return;
		}
	};

	// Write-through: the entity's embedded slot now serves future requests
	// without another full decode. Persistence trouble is logged, not
	// surfaced; the caller still gets its image.
	entity.set_embedded(webp);
	if let Err(e) = store.store_thumbnail(&entity).await {
		error!(
			"Failed to persist generated thumbnail: {:#?}",
			FileIOError::from((&path, e))
		);
	}

	reporter.new_thumbnail(&path);

	done_tx.send(Ok(Some(Arc::new(thumbnail)))).ok();
}

fn generate_native_thumbnail(
	bytes: &[u8],
	requested: ThumbSize,
	quality: f32,
) -> Result<(Thumbnail, Vec<u8>), ThumbnailError> {
	let img = image::load_from_memory(bytes)?;

	let (width, height) = img.dimensions();
	let original = ThumbSize::new(width, height);
	let target = original.scaled_to_cover(requested);

	let resized = imageops::resize(
		&img,
		target.width,
		target.height,
		imageops::FilterType::Triangle,
	);

	// WebPMemory is !Send, so deref to a plain byte vec before this value
	// crosses back out of the blocking closure
	let webp = Encoder::from_rgba(resized.as_raw(), target.width, target.height)
		.encode(quality)
		.deref()
		.to_owned();

	Ok((
		Thumbnail {
			image: resized,
			original,
		},
		webp,
	))
}

fn decode_embedded_thumbnail(bytes: &[u8]) -> Result<Thumbnail, ThumbnailError> {
	// Generated thumbnails are webp; camera-produced previews are usually
	// jpeg, so fall back to format sniffing when the webp header doesn't match
	let img = webp::Decoder::new(bytes)
		.decode()
		.map_or_else(|| image::load_from_memory(bytes), |webp| Ok(webp.to_image()))?;

	let image = img.to_rgba8();
	let (width, height) = image.dimensions();

	Ok(Thumbnail {
		image,
		original: ThumbSize::new(width, height),
	})
}
