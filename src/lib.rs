//!
//! # Lightbox Engine
//!
//! Concurrent query evaluation and adaptive thumbnail loading for the
//! Lightbox photo grid.
//!
//! A [`QueryEvaluator`] streams query matches into a lock-free
//! [`ResultAccumulator`] while the grid keeps painting; every delivered
//! [`EntityView`] carries a [`LazyThumbnail`] that hands the paint pass the
//! best image available right now, never blocking it. Behind the views, the
//! [`Thumbnailer`] pipeline does the heavy lifting. Together the pieces
//! guarantee:
//! - Results surface incrementally in sorted order no matter how many
//!   threads add them concurrently, and none is ever lost to a race;
//! - Thumbnails resolve in two tiers: the preview embedded in the file's
//!   metadata first, then a regeneration from the original file whenever
//!   that preview can't cover the painted area;
//! - Disk reads stay strictly serialized while decoding fans out across
//!   processing units, and the request for the entity under the user's
//!   viewport jumps the queue;
//! - Deleting, renaming or disposing anything mid-flight is safe: stale
//!   results are discarded instead of adopted, and superseded images are
//!   released by ownership, exactly once.
//!

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod accumulator;
mod config;
mod entity;
mod error;
mod evaluator;
mod thumbnail;

pub use accumulator::{ResultAccumulator, SortOrder};
pub use config::ThumbnailerConfig;
pub use entity::{Entity, EntityKind, EntityView, ViewState};
pub use error::FileIOError;
pub use evaluator::{
	entity_order, ChangeWatcher, EntityChange, EntityStream, EvaluatorState, Query, QueryError,
	QueryEvaluator, QueryFault, QueryFaultReporter,
};
pub use thumbnail::{
	is_placeholder, placeholder, EntityStore, LazyThumbnail, LoadResult, NewThumbnailReporter,
	ThumbLoad, ThumbSize, Thumbnail, ThumbnailError, ThumbnailFactory, ThumbnailLoader,
	Thumbnailer,
};
