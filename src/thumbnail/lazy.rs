use crate::entity::{Entity, EntityKind};

use std::{
	fmt,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc, Mutex, PoisonError,
	},
	time::Duration,
};

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

use super::{placeholder, ThumbLoad, ThumbSize, Thumbnail, ThumbnailLoader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
	Embedded,
	Native,
}

struct PendingLoad {
	tier: Tier,
	generation: u64,
	load: ThumbLoad,
	// Cancels the pipeline request when this load is replaced or dropped
	_cancel: Option<DropGuard>,
}

struct Resolved {
	tier: Tier,
	extent: ThumbSize,
	original: ThumbSize,
}

impl Resolved {
	/// Whether a native request could still yield a sharper image for
	/// `requested` than this resolution did.
	fn could_improve(&self, requested: ThumbSize) -> bool {
		match self.tier {
			// Source dimensions are unknown until the file is read, so an
			// undersized preview is always worth escalating
			Tier::Embedded => !self.original.covers(requested),
			Tier::Native => !self.extent.covers(requested) && self.original.exceeds(self.extent),
		}
	}
}

struct ThumbState {
	current: Arc<Thumbnail>,
	requested: Option<ThumbSize>,
	pending: Option<PendingLoad>,
	resolved: Option<Resolved>,
	retry_at: Option<Instant>,
}

/// Per-entity adaptive thumbnail state machine.
///
/// [`LazyThumbnail::get_current`] never blocks: it returns the best image
/// obtained so far (the shared placeholder until anything resolves) and, as a
/// side effect, walks the state machine. The embedded tier is tried first;
/// if the stored preview can't cover the requested area, is absent, or fails
/// to decode, a native tier request regenerates from the original file. The
/// embedded image stays displayed until the sharper one lands.
///
/// Every load carries the generation current when it was issued; a resolved
/// load whose generation no longer matches is discarded instead of adopted,
/// which is what makes disposal safe while work is outstanding.
pub struct LazyThumbnail {
	entity: Arc<Entity>,
	loader: Arc<dyn ThumbnailLoader>,
	retry_delay: Duration,
	generation: AtomicU64,
	disposed: AtomicBool,
	state: Mutex<ThumbState>,
}

impl LazyThumbnail {
	pub(crate) fn new(
		entity: Arc<Entity>,
		loader: Arc<dyn ThumbnailLoader>,
		retry_delay: Duration,
	) -> Self {
		Self {
			entity,
			loader,
			retry_delay,
			generation: AtomicU64::new(0),
			disposed: AtomicBool::new(false),
			state: Mutex::new(ThumbState {
				current: placeholder(),
				requested: None,
				pending: None,
				resolved: None,
				retry_at: None,
			}),
		}
	}

	/// Returns the best image available right now for an area of `requested`.
	///
	/// Side effects, all non-blocking: adopts a finished load, issues the
	/// next tier request when one is warranted (first poll, a grown requested
	/// area, a fallthrough from a broken or missing preview, or an elapsed
	/// retry delay), and nudges the pipeline to serve this entity's queued
	/// request next. After `dispose` the image is returned untouched and no
	/// further requests are issued.
	pub fn get_current(&self, requested: ThumbSize) -> Arc<Thumbnail> {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

		if self.disposed.load(Ordering::Acquire) {
			return Arc::clone(&state.current);
		}

		// Only images have anything to decode; everything else keeps the
		// placeholder forever
		if self.entity.kind() != EntityKind::Image {
			return Arc::clone(&state.current);
		}

		self.adopt_finished(&mut state);
		self.refresh_request(&mut state, requested);
		// A load that resolved instantly (an absent preview slot) advances
		// the state machine within the same poll
		self.adopt_finished(&mut state);

		if state
			.pending
			.as_ref()
			.is_some_and(|pending| matches!(pending.tier, Tier::Native))
		{
			self.loader.prioritize(&self.entity.path());
		}

		// A dispose on another thread may have raced this poll
		if self.disposed.load(Ordering::Acquire) {
			state.pending = None;
		}

		Arc::clone(&state.current)
	}

	/// Resets to the uninitialized state while keeping the displayed image,
	/// so the next poll starts over from the embedded tier.
	pub fn invalidate(&self) {
		if self.disposed.load(Ordering::Acquire) {
			return;
		}

		self.generation.fetch_add(1, Ordering::AcqRel);

		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		state.pending = None;
		state.requested = None;
		state.resolved = None;
		state.retry_at = None;
	}

	/// Stops all thumbnail work for this entity. Idempotent; also runs on
	/// drop. The outstanding request (if any) is canceled, no in-flight or
	/// future load is ever adopted afterwards, and the displayed image stays
	/// readable through [`LazyThumbnail::get_current`].
	pub fn dispose(&self) {
		if self.disposed.swap(true, Ordering::AcqRel) {
			return;
		}

		self.generation.fetch_add(1, Ordering::AcqRel);

		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		state.pending = None;
		state.retry_at = None;

		trace!(
			"Disposed lazy thumbnail for {}",
			self.entity.path().display()
		);
	}

	#[must_use]
	pub fn is_disposed(&self) -> bool {
		self.disposed.load(Ordering::Acquire)
	}

	fn adopt_finished(&self, state: &mut ThumbState) {
		let Some(pending) = state.pending.as_mut() else {
			return;
		};

		let Some(result) = pending.load.try_now() else {
			return;
		};

		let tier = pending.tier;
		let load_generation = pending.generation;
		state.pending = None;

		if load_generation != self.generation.load(Ordering::Acquire) {
			// Disposed or invalidated since this load was issued; the result
			// must never be adopted
			trace!("Discarding stale {tier:?} thumbnail load");
			return;
		}

		match result {
			Ok(Some(thumbnail)) => self.adopt(state, tier, thumbnail),
			Ok(None) => {
				// Empty embedded slot; only the original file can supply an
				// image
				self.issue_native(state);
			}
			Err(e) if matches!(tier, Tier::Embedded) => {
				// A broken stored preview is no reason to give up, the
				// original file may still decode fine
				debug!("Embedded preview failed to decode, escalating: {e:#?}");
				self.issue_native(state);
			}
			Err(e) if e.is_transient() => {
				trace!("Thumbnail load hit a locked file, scheduling retry: {e:#?}");
				state.retry_at = Some(Instant::now() + self.retry_delay);
			}
			Err(e) => {
				warn!(
					"Thumbnail load failed for {}, keeping last good image: {e:#?}",
					self.entity.path().display()
				);
			}
		}
	}

	fn adopt(&self, state: &mut ThumbState, tier: Tier, thumbnail: Arc<Thumbnail>) {
		let extent = thumbnail.extent();
		let original = thumbnail.original;

		// The superseded image is released by ownership as its last
		// reference drops; the shared placeholder is exempt by identity
		state.current = thumbnail;
		state.resolved = Some(Resolved {
			tier,
			extent,
			original,
		});
		state.retry_at = None;

		if matches!(tier, Tier::Embedded) {
			if let Some(requested) = state.requested {
				// The preview stays displayed, but it may be too coarse for
				// the area the view asked for
				if !original.covers(requested) {
					self.issue_native(state);
				}
			}
		}
	}

	fn refresh_request(&self, state: &mut ThumbState, requested: ThumbSize) {
		match state.requested {
			None => {
				state.requested = Some(requested);
				self.issue_embedded(state);
			}
			Some(previous) if requested.exceeds(previous) => {
				state.requested = Some(requested);
				self.regrade(state, requested);
			}
			Some(_) => {}
		}

		if state.pending.is_none() {
			if let Some(retry_at) = state.retry_at {
				if Instant::now() >= retry_at {
					state.retry_at = None;
					self.issue_native(state);
				}
			}
		}
	}

	/// Re-runs the tier decision after the requested area grew.
	fn regrade(&self, state: &mut ThumbState, requested: ThumbSize) {
		if let Some(pending) = &state.pending {
			// An in-flight native load is sized for the smaller area, so
			// replace it; an embedded load re-checks coverage on arrival
			if matches!(pending.tier, Tier::Native) {
				self.issue_native(state);
			}

			return;
		}

		if let Some(resolved) = &state.resolved {
			if resolved.could_improve(requested) {
				self.issue_native(state);
			}
		}
	}

	fn issue_embedded(&self, state: &mut ThumbState) {
		let generation = self.generation.load(Ordering::Acquire);
		let load = self.loader.load_embedded(&self.entity);

		state.pending = Some(PendingLoad {
			tier: Tier::Embedded,
			generation,
			load,
			_cancel: None,
		});
	}

	fn issue_native(&self, state: &mut ThumbState) {
		let Some(requested) = state.requested else {
			return;
		};

		let generation = self.generation.load(Ordering::Acquire);
		let cancel = CancellationToken::new();
		let load = self
			.loader
			.load_native(&self.entity, requested, cancel.child_token());

		state.pending = Some(PendingLoad {
			tier: Tier::Native,
			generation,
			load,
			_cancel: Some(cancel.drop_guard()),
		});
		state.retry_at = None;
	}
}

impl fmt::Debug for LazyThumbnail {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LazyThumbnail")
			.field("entity", &self.entity.path())
			.field("generation", &self.generation)
			.field("disposed", &self.disposed)
			.finish_non_exhaustive()
	}
}

impl Drop for LazyThumbnail {
	fn drop(&mut self) {
		self.dispose();
	}
}
