//! Counter of in-flight sync requests for one account.
//!
//! Every piece of sync work takes a [`SyncGuard`] from [`Synchronizer::inc_requests_counter`] and
//! releases it when finished. The 0→1 transition fires the `on_sync_started` callback and the
//! →0 transition fires `on_sync_done`; intermediate transitions fire nothing. Callbacks run while
//! the counter lock is held, so a started/done pair is always observed in order. Callbacks must not
//! call back into the synchronizer.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::error;

type Callback = Box<dyn Fn() + Send + Sync>;

struct Inner {
	counter: Mutex<usize>,
	idle_tx: watch::Sender<usize>,
	on_sync_started: Callback,
	on_sync_done: Callback,
}

/// Cheap to clone; clones share the counter.
#[derive(Clone)]
pub struct Synchronizer {
	inner: Arc<Inner>,
}

impl Synchronizer {
	pub fn new(
		on_sync_started: impl Fn() + Send + Sync + 'static,
		on_sync_done: impl Fn() + Send + Sync + 'static,
	) -> Self {
		let (idle_tx, _) = watch::channel(0);
		Self {
			inner: Arc::new(Inner {
				counter: Mutex::new(0),
				idle_tx,
				on_sync_started: Box::new(on_sync_started),
				on_sync_done: Box::new(on_sync_done),
			}),
		}
	}

	/// Registers one more sync request. The returned guard must be released exactly once,
	/// either by [`SyncGuard::done`] or by dropping it.
	pub fn inc_requests_counter(&self) -> SyncGuard {
		let mut counter = self.inner.counter.lock();
		*counter += 1;
		if *counter == 1 {
			(self.inner.on_sync_started)();
		}
		self.inner.idle_tx.send_replace(*counter);
		SyncGuard {
			inner: Some(self.inner.clone()),
		}
	}

	pub fn pending_requests(&self) -> usize {
		*self.inner.counter.lock()
	}

	pub fn is_idle(&self) -> bool {
		self.pending_requests() == 0
	}

	/// Resolves once no sync request is in flight.
	pub async fn wait_synchronized(&self) {
		let mut rx = self.inner.idle_tx.subscribe();
		// The sender lives in `self.inner`, so it can't be dropped while we wait.
		let _ = rx.wait_for(|counter| *counter == 0).await;
	}
}

impl Inner {
	fn dec_requests_counter(&self) {
		let mut counter = self.counter.lock();
		if *counter == 0 {
			error!("Sync request counter would drop below zero, ignoring");
			return;
		}
		*counter -= 1;
		if *counter == 0 {
			(self.on_sync_done)();
		}
		self.idle_tx.send_replace(*counter);
	}
}

/// One in-flight sync request.
#[must_use = "dropping the guard immediately ends the sync request"]
pub struct SyncGuard {
	inner: Option<Arc<Inner>>,
}

impl SyncGuard {
	pub fn done(mut self) {
		self.release();
	}

	fn release(&mut self) {
		if let Some(inner) = self.inner.take() {
			inner.dec_requests_counter();
		}
	}
}

impl Drop for SyncGuard {
	fn drop(&mut self) {
		self.release();
	}
}
