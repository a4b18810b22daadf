use std::{cmp::Ordering, sync::Arc};

use arc_swap::ArcSwap;

/// Total order shared between the accumulator's snapshots and the delivered
/// index, fixed when the query is constructed.
pub trait SortOrder<T>: Send + Sync {
	fn cmp(&self, a: &T, b: &T) -> Ordering;
}

impl<T, F> SortOrder<T> for F
where
	F: Fn(&T, &T) -> Ordering + Send + Sync,
{
	fn cmp(&self, a: &T, b: &T) -> Ordering {
		self(a, b)
	}
}

/// Lock-free sorted buffer between the query worker and the UI poll.
///
/// The whole sorted snapshot lives behind a single atomically swappable slot.
/// `add` runs a read-insert-compare-and-swap retry loop; `drain` swaps the
/// slot for a fresh empty snapshot and hands back the previous one. An `add`
/// racing a `drain` either lands in the snapshot the drain takes or retries
/// into the empty one it leaves behind, so no insertion is ever lost.
pub struct ResultAccumulator<T> {
	snapshot: ArcSwap<Vec<T>>,
	order: Arc<dyn SortOrder<T>>,
}

impl<T: Clone> ResultAccumulator<T> {
	#[must_use]
	pub fn new(order: Arc<dyn SortOrder<T>>) -> Self {
		Self {
			snapshot: ArcSwap::from_pointee(Vec::new()),
			order,
		}
	}

	/// Inserts `item` at its sorted position in the current snapshot.
	///
	/// Concurrent callers race on the slot; the loser recomputes against the
	/// winner's snapshot, so the closure may run more than once.
	pub fn add(&self, item: T) {
		self.snapshot.rcu(|current| {
			let mut next = Vec::with_capacity(current.len() + 1);
			next.extend_from_slice(current);

			let at = next
				.partition_point(|existing| self.order.cmp(existing, &item) != Ordering::Greater);
			next.insert(at, item.clone());

			next
		});
	}

	/// Swaps the slot for an empty snapshot and returns the previous contents
	/// as a stable ordered sequence.
	pub fn drain(&self) -> Vec<T> {
		let previous = self.snapshot.swap(Arc::new(Vec::new()));

		// Usually the last reference by now; a concurrent reader still holding
		// the old snapshot forces a copy
		Arc::try_unwrap(previous).unwrap_or_else(|shared| shared.as_ref().clone())
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.snapshot.load().len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.snapshot.load().is_empty()
	}
}
