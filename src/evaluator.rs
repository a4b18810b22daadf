use crate::{
	accumulator::{ResultAccumulator, SortOrder},
	entity::{Entity, EntityView},
	error::FileIOError,
	thumbnail::ThumbnailFactory,
};

use std::{cmp::Ordering, path::PathBuf, pin::pin, sync::Arc};

use async_channel as chan;
use futures::{stream::BoxStream, FutureExt};
use futures_concurrency::stream::Merge;
use thiserror::Error;
use tokio::{spawn, sync::watch};
use tokio_stream::{once, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// A recoverable fault raised during enumeration, pinpointing the query
/// source position that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("query fault at {line}:{column}: {message}")]
pub struct QueryFault {
	pub line: u32,
	pub column: u32,
	pub message: String,
}

#[derive(Error, Debug)]
pub enum QueryError {
	#[error("query failed to start: {0}")]
	Start(#[from] QueryFault),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

pub type EntityStream = BoxStream<'static, Result<Arc<Entity>, QueryFault>>;

/// A compiled query over the entity storage.
pub trait Query: Send + Sync {
	/// Total order matches are presented in. Shared by the accumulator and
	/// the delivered index, so it must stay consistent for the query's life.
	fn order(&self) -> Arc<dyn SortOrder<Arc<EntityView>>>;

	/// Starts enumerating matches. Mid-stream faults come through the stream
	/// as items; enumeration is expected to keep going past them.
	fn evaluate(&self, cancel: CancellationToken) -> Result<EntityStream, QueryError>;
}

/// Receives the first fault of an enumeration, for surfacing in the UI.
pub trait QueryFaultReporter: Send + Sync + 'static {
	fn report(&self, fault: &QueryFault);
}

/// Filesystem change notification affecting delivered entities.
#[derive(Debug, Clone)]
pub enum EntityChange {
	Deleted(PathBuf),
	Renamed { from: PathBuf, to: PathBuf },
	Moved { from: PathBuf, to: PathBuf },
}

/// Source of [`EntityChange`] notifications, subscribed once per evaluator.
pub trait ChangeWatcher: Send + Sync {
	fn subscribe(&self) -> chan::Receiver<EntityChange>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorState {
	Idle,
	Running,
	Completed,
	Canceled,
	Faulted,
}

/// Builds a view ordering from a comparison over the underlying entities.
pub fn entity_order<F>(cmp: F) -> Arc<dyn SortOrder<Arc<EntityView>>>
where
	F: Fn(&Entity, &Entity) -> Ordering + Send + Sync + 'static,
{
	Arc::new(move |a: &Arc<EntityView>, b: &Arc<EntityView>| cmp(a.entity(), b.entity()))
}

/// Drives one query from evaluation to display.
///
/// [`QueryEvaluator::run`] spawns a worker that streams matches into a shared
/// [`ResultAccumulator`]; the owner calls [`QueryEvaluator::update`] on its
/// tick to fold new arrivals and filesystem changes into the delivered,
/// sorted index. Dropping the evaluator (or calling `dispose`) cancels the
/// worker; views already delivered stay usable.
pub struct QueryEvaluator {
	accumulator: Arc<ResultAccumulator<Arc<EntityView>>>,
	order: Arc<dyn SortOrder<Arc<EntityView>>>,
	delivered: Vec<Arc<EntityView>>,
	// Present from run() until dispose(); dropping it is the unsubscribe
	changes_rx: Option<chan::Receiver<EntityChange>>,
	state_rx: watch::Receiver<EvaluatorState>,
	cancel_token: CancellationToken,
}

impl QueryEvaluator {
	/// Starts evaluating `query` on the current runtime.
	pub fn run(
		query: Arc<dyn Query>,
		factory: ThumbnailFactory,
		fault_reporter: Arc<dyn QueryFaultReporter>,
		watcher: &dyn ChangeWatcher,
	) -> Self {
		let order = query.order();
		let accumulator = Arc::new(ResultAccumulator::new(Arc::clone(&order)));
		let (state_tx, state_rx) = watch::channel(EvaluatorState::Idle);
		let cancel_token = CancellationToken::new();

		spawn(worker(
			query,
			factory,
			fault_reporter,
			Arc::clone(&accumulator),
			state_tx,
			cancel_token.child_token(),
		));

		Self {
			accumulator,
			order,
			delivered: Vec::new(),
			changes_rx: Some(watcher.subscribe()),
			state_rx,
			cancel_token,
		}
	}

	/// Folds everything that arrived since the last call into the delivered
	/// index and returns the whole sorted slice.
	pub fn update(&mut self) -> &[Arc<EntityView>] {
		for view in self.accumulator.drain() {
			let at = self
				.delivered
				.partition_point(|existing| self.order.cmp(existing, &view) != Ordering::Greater);
			self.delivered.insert(at, view);
		}

		while let Some(change) = self.changes_rx.as_ref().and_then(|rx| rx.try_recv().ok()) {
			self.apply_change(change);
		}

		&self.delivered
	}

	/// The delivered index as of the last [`QueryEvaluator::update`] call.
	#[must_use]
	pub fn delivered(&self) -> &[Arc<EntityView>] {
		&self.delivered
	}

	#[must_use]
	pub fn state(&self) -> EvaluatorState {
		*self.state_rx.borrow()
	}

	/// Watch receiver that wakes on every worker state transition.
	#[must_use]
	pub fn subscribe_state(&self) -> watch::Receiver<EvaluatorState> {
		self.state_rx.clone()
	}

	/// Stops the worker and unsubscribes from change notifications. Views
	/// already delivered stay usable; their thumbnails resolve independently
	/// of the query that produced them.
	pub fn dispose(&mut self) {
		self.cancel_token.cancel();
		self.changes_rx = None;
	}

	fn apply_change(&mut self, change: EntityChange) {
		match change {
			EntityChange::Deleted(path) => {
				// Unknown paths are fine, the watcher sees the whole
				// filesystem while the index holds one query's matches
				if let Some(at) = self
					.delivered
					.iter()
					.position(|view| view.entity().path_matches(&path))
				{
					let view = self.delivered.remove(at);
					view.thumbnail().dispose();

					trace!("Dropped deleted entity from the index: {}", path.display());
				}
			}
			EntityChange::Renamed { from, to } | EntityChange::Moved { from, to } => {
				if let Some(at) = self
					.delivered
					.iter()
					.position(|view| view.entity().path_matches(&from))
				{
					let view = self.delivered.remove(at);
					view.entity().set_path(to);

					// Sort keys may depend on the path, so the view gets
					// re-inserted at its new position
					let dest = self.delivered.partition_point(|existing| {
						self.order.cmp(existing, &view) != Ordering::Greater
					});
					self.delivered.insert(dest, view);
				}
			}
		}
	}
}

impl Drop for QueryEvaluator {
	fn drop(&mut self) {
		self.cancel_token.cancel();
	}
}

async fn worker(
	query: Arc<dyn Query>,
	factory: ThumbnailFactory,
	fault_reporter: Arc<dyn QueryFaultReporter>,
	accumulator: Arc<ResultAccumulator<Arc<EntityView>>>,
	state_tx: watch::Sender<EvaluatorState>,
	cancel_token: CancellationToken,
) {
	enum StreamMessage {
		Discovered(Result<Arc<Entity>, QueryFault>),
		Exhausted,
		Stop,
	}

	let stream = match query.evaluate(cancel_token.child_token()) {
		Ok(stream) => stream,
		Err(e) => {
			if let QueryError::Start(fault) = &e {
				fault_reporter.report(fault);
			}

			error!("Query failed to start: {e:#?}");
			state_tx.send(EvaluatorState::Faulted).ok();

			return;
		}
	};

	state_tx.send(EvaluatorState::Running).ok();

	let cancel = pin!(cancel_token.cancelled());

	// The cancel arm never completes on its own, so the query stream is
	// chained with a sentinel to end the merged stream when it runs dry
	let mut msg_stream = (
		stream
			.map(StreamMessage::Discovered)
			.chain(once(StreamMessage::Exhausted)),
		cancel.into_stream().map(|()| StreamMessage::Stop),
	)
		.merge();

	let mut reported_fault = false;
	let mut canceled = false;

	while let Some(msg) = msg_stream.next().await {
		match msg {
			StreamMessage::Discovered(Ok(entity)) => {
				let thumbnail = factory.create(Arc::clone(&entity));
				accumulator.add(Arc::new(EntityView::new(entity, thumbnail)));
			}

			StreamMessage::Discovered(Err(fault)) => {
				// Enumeration keeps going past faults; only the first one
				// reaches the reporter
				if reported_fault {
					debug!("Suppressed repeat query fault: {fault}");
				} else {
					fault_reporter.report(&fault);
					reported_fault = true;
				}
			}

			StreamMessage::Exhausted => break,

			StreamMessage::Stop => {
				canceled = true;
				break;
			}
		}
	}

	let final_state = if canceled {
		EvaluatorState::Canceled
	} else if reported_fault {
		EvaluatorState::Faulted
	} else {
		EvaluatorState::Completed
	};

	trace!("Query worker finished as {final_state:?}");
	state_tx.send(final_state).ok();
}
