//! Thumbnail pipeline configuration

use std::{num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::error;

/// Fallback when the number of processing units can't be queried.
const FALLBACK_PARALLELISM: usize = 4;

pub(crate) const HALF_SEC: Duration = Duration::from_millis(500);

/// Tuning knobs for the thumbnail pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailerConfig {
	/// Upper bound on simultaneously running decode tasks. `None` sizes the
	/// admission gate to the number of processing units.
	pub decode_parallelism: Option<NonZeroUsize>,
	/// WebP quality for generated thumbnails (0-100)
	pub quality: f32,
	/// Delay before a request that failed on a temporarily locked file is
	/// retried by its caller
	pub retry_delay: Duration,
}

impl Default for ThumbnailerConfig {
	fn default() -> Self {
		Self {
			decode_parallelism: None,
			quality: 60.0,
			retry_delay: HALF_SEC,
		}
	}
}

impl ThumbnailerConfig {
	/// Number of decode permits the pipeline will hand out.
	#[must_use]
	pub fn effective_parallelism(&self) -> usize {
		self.decode_parallelism.map_or_else(
			|| {
				std::thread::available_parallelism().map_or_else(
					|e| {
						error!("Failed to get available parallelism: {e:#?}");
						FALLBACK_PARALLELISM
					},
					NonZeroUsize::get,
				)
			},
			NonZeroUsize::get,
		)
	}
}
