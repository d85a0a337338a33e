//! Typed publish/subscribe hub for cross-component notifications.
//!
//! Producers (accounts, the rate updater) push [`Event`]s onto an [`EventsBus`]; consumers call
//! [`EventsBus::subscribe`] and receive every event sent afterwards. Sending with nobody listening
//! is a noop.

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

const DEFAULT_CHANNEL_SIZE: usize = 256;

/// Sync and status transitions of a single account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountEventKind {
	SyncStarted,
	SyncDone,
	/// Balance, transactions, notes or the offline flag changed.
	StatusChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountEvent {
	pub account_code: String,
	pub kind: AccountEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RatesEvent {
	/// The latest rates table was replaced.
	Updated,
	/// New history samples were merged for a pair, e.g. `btcUSD`.
	HistoryUpdated { pair: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
	Account(AccountEvent),
	Rates(RatesEvent),
}

/// Clone to get another handle to the same bus.
#[derive(Clone)]
pub struct EventsBus<T = Event> {
	event_tx: broadcast::Sender<T>,
}

impl<T: Clone> Default for EventsBus<T> {
	fn default() -> Self {
		Self::new_with_size(DEFAULT_CHANNEL_SIZE)
	}
}

impl<T: Clone> EventsBus<T> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn new_with_size(size: usize) -> Self {
		Self {
			event_tx: broadcast::channel(size).0,
		}
	}

	pub fn send(&self, event: T) {
		// Errors only when there are no receivers.
		let _ = self.event_tx.send(event);
	}

	/// Events sent before this call are not received.
	pub fn subscribe(&self) -> EventsRx<T> {
		EventsRx {
			_event_tx: self.event_tx.clone(),
			event_rx: self.event_tx.subscribe(),
		}
	}
}

impl EventsBus<Event> {
	pub fn notify_account(&self, account_code: &str, kind: AccountEventKind) {
		self.send(Event::Account(AccountEvent {
			account_code: account_code.to_string(),
			kind,
		}));
	}
}

pub struct EventsRx<T> {
	// Keeps the channel open while we wait.
	_event_tx: broadcast::Sender<T>,
	event_rx: broadcast::Receiver<T>,
}

impl<T: Clone> EventsRx<T> {
	/// Waits indefinitely; wrap in a timeout.
	pub async fn recv(&mut self) -> T {
		self.recv_filtered(|_| true).await
	}

	pub async fn recv_filtered(&mut self, filter: impl Fn(&T) -> bool) -> T {
		loop {
			match self.event_rx.recv().await {
				Ok(event) => {
					if filter(&event) {
						return event;
					}
				}
				// We hold a sender, so the channel can't close.
				Err(RecvError::Closed) => continue,
				// Too slow; keep going with what is left.
				Err(RecvError::Lagged(_)) => continue,
			}
		}
	}

	/// Everything received so far, without waiting.
	pub fn drain(&mut self) -> Vec<T> {
		let mut events = Vec::new();
		loop {
			match self.event_rx.try_recv() {
				Ok(event) => events.push(event),
				Err(TryRecvError::Lagged(_)) => continue,
				Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_subscriber_only_sees_later_events() {
		let bus = EventsBus::<Event>::new();
		bus.notify_account("btc-0", AccountEventKind::SyncStarted);

		let mut rx = bus.subscribe();
		bus.notify_account("btc-0", AccountEventKind::SyncDone);
		bus.send(Event::Rates(RatesEvent::Updated));

		let event = rx
			.recv_filtered(|event| matches!(event, Event::Rates(_)))
			.await;
		assert_eq!(event, Event::Rates(RatesEvent::Updated));
		assert!(rx.drain().is_empty());
	}

	#[test]
	fn test_send_without_subscribers() {
		let bus = EventsBus::<u32>::new();
		bus.send(1);
		let mut rx = bus.subscribe();
		bus.send(2);
		bus.send(3);
		assert_eq!(rx.drain(), vec![2, 3]);
	}
}
