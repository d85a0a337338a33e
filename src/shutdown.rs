use std::sync::Arc;

use tokio::sync::Semaphore;

/// Stop signal shared by a component and its background tasks. Clone to get another handle.
///
/// Sending closes a semaphore that never had permits, so every waiter (present or future)
/// completes. Sending more than once is fine.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
	inner: Arc<Semaphore>,
}

impl Default for ShutdownSignal {
	fn default() -> Self {
		Self::new()
	}
}

impl ShutdownSignal {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Semaphore::new(0)),
		}
	}

	pub fn send(&self) {
		self.inner.close();
	}

	pub fn is_sent(&self) -> bool {
		self.inner.is_closed()
	}

	/// Completes once [`ShutdownSignal::send`] was called on any handle.
	pub async fn recv(&self) {
		// Acquiring only fails once the semaphore is closed.
		let _ = self.inner.acquire().await;
	}
}
