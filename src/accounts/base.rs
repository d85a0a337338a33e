//! State and behaviour shared by every account kind.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::export::export_csv;
use super::notes::Notes;
use super::transaction::TransactionData;
use super::types::AccountError;
use crate::coin::Coin;
use crate::observable::{AccountEventKind, EventsBus};
use crate::synchronizer::Synchronizer;

/// Static description of an account.
#[derive(Debug, Clone)]
pub struct AccountConfig {
	/// Unique account code, used as event tag and file name stem.
	pub code: String,
	pub name: String,
	pub coin: Coin,
	/// Directory of the per-account notes files.
	pub notes_dir: PathBuf,
}

#[derive(Default)]
struct StatusFlags {
	initialized: AtomicBool,
	synced: AtomicBool,
	closed: AtomicBool,
	offline: RwLock<Option<String>>,
	fatal: RwLock<Option<String>>,
}

pub struct BaseAccount {
	config: AccountConfig,
	events: EventsBus,
	flags: Arc<StatusFlags>,
	synchronizer: Synchronizer,
	notes: OnceLock<Notes>,
	proposed_note: Mutex<String>,
}

impl BaseAccount {
	pub fn new(config: AccountConfig, events: EventsBus) -> Self {
		let flags = Arc::new(StatusFlags::default());
		let synchronizer = Synchronizer::new(
			{
				let events = events.clone();
				let code = config.code.clone();
				move || events.notify_account(&code, AccountEventKind::SyncStarted)
			},
			{
				let events = events.clone();
				let code = config.code.clone();
				let flags = flags.clone();
				move || {
					if flags
						.synced
						.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
						.is_ok()
					{
						info!(account = %code, "Initial sync done");
						events.notify_account(&code, AccountEventKind::StatusChanged);
					}
					events.notify_account(&code, AccountEventKind::SyncDone);
				}
			},
		);
		Self {
			config,
			events,
			flags,
			synchronizer,
			notes: OnceLock::new(),
			proposed_note: Mutex::new(String::new()),
		}
	}

	pub fn config(&self) -> &AccountConfig {
		&self.config
	}

	pub fn code(&self) -> &str {
		&self.config.code
	}

	pub fn coin(&self) -> &Coin {
		&self.config.coin
	}

	pub fn events(&self) -> &EventsBus {
		&self.events
	}

	pub fn synchronizer(&self) -> &Synchronizer {
		&self.synchronizer
	}

	pub fn notify(&self, kind: AccountEventKind) {
		self.events.notify_account(&self.config.code, kind);
	}

	/// Loads the notes and marks the account initialized. Returns `false` if it already was.
	/// Failures are latched as fatal.
	pub fn initialize(&self) -> Result<bool, AccountError> {
		if self.flags.closed.load(Ordering::SeqCst) {
			return Err(AccountError::Closed);
		}
		if self.flags.initialized.load(Ordering::SeqCst) {
			debug!(account = %self.code(), "Account already initialized");
			return Ok(false);
		}
		if self.notes.get().is_none() {
			let path = self.config.notes_dir.join(format!("{}.json", self.config.code));
			match Notes::load(path) {
				Ok(notes) => {
					let _ = self.notes.set(notes);
				}
				Err(e) => {
					self.set_fatal(e.to_string());
					return Err(e.into());
				}
			}
		}
		Ok(!self.flags.initialized.swap(true, Ordering::SeqCst))
	}

	pub fn initialized(&self) -> bool {
		self.flags.initialized.load(Ordering::SeqCst)
	}

	/// True once the first sync after initialization finished.
	pub fn synced(&self) -> bool {
		self.flags.synced.load(Ordering::SeqCst)
	}

	pub fn closed(&self) -> bool {
		self.flags.closed.load(Ordering::SeqCst)
	}

	/// The last connection error, if the account is offline.
	pub fn offline(&self) -> Option<String> {
		self.flags.offline.read().clone()
	}

	pub fn set_offline(&self, offline: Option<String>) {
		let changed = {
			let mut current = self.flags.offline.write();
			let changed = *current != offline;
			*current = offline;
			changed
		};
		if changed {
			match self.offline() {
				Some(reason) => warn!(account = %self.code(), "Account offline: {}", reason),
				None => info!(account = %self.code(), "Account back online"),
			}
			self.notify(AccountEventKind::StatusChanged);
		}
	}

	pub fn fatal_error(&self) -> Option<String> {
		self.flags.fatal.read().clone()
	}

	pub fn set_fatal(&self, reason: String) {
		warn!(account = %self.code(), "Fatal account error: {}", reason);
		*self.flags.fatal.write() = Some(reason);
		self.notify(AccountEventKind::StatusChanged);
	}

	/// Fails unless the account is initialized, open and not in a fatal state.
	pub fn ensure_usable(&self) -> Result<(), AccountError> {
		if self.closed() {
			return Err(AccountError::Closed);
		}
		if let Some(reason) = self.fatal_error() {
			return Err(AccountError::Fatal(reason));
		}
		if !self.initialized() {
			return Err(AccountError::SyncInProgress);
		}
		Ok(())
	}

	/// Like [`BaseAccount::ensure_usable`], and additionally requires the initial sync.
	pub fn ensure_synced(&self) -> Result<(), AccountError> {
		self.ensure_usable()?;
		if !self.synced() {
			return Err(AccountError::SyncInProgress);
		}
		Ok(())
	}

	/// Idempotent.
	pub fn close(&self) {
		if self.flags.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.flags.synced.store(false, Ordering::SeqCst);
		info!(account = %self.code(), "Closed account");
		self.notify(AccountEventKind::StatusChanged);
	}

	/// Remembers a note to attach to the next sent transaction.
	pub fn propose_tx_note(&self, note: &str) {
		*self.proposed_note.lock() = note.to_string();
	}

	pub fn take_proposed_tx_note(&self) -> String {
		std::mem::take(&mut *self.proposed_note.lock())
	}

	pub fn tx_note(&self, internal_id: &str) -> String {
		self.notes
			.get()
			.map(|notes| notes.tx_note(internal_id))
			.unwrap_or_default()
	}

	pub fn set_tx_note(&self, internal_id: &str, note: &str) -> Result<(), AccountError> {
		let notes = self.notes.get().ok_or(AccountError::SyncInProgress)?;
		if notes.set_tx_note(internal_id, note)? {
			self.notify(AccountEventKind::StatusChanged);
		}
		Ok(())
	}

	pub fn export_csv<'a, W: Write>(
		&self,
		writer: &mut W,
		transactions: impl IntoIterator<Item = &'a TransactionData>,
	) -> Result<(), AccountError> {
		let notes = self.notes.get().ok_or(AccountError::SyncInProgress)?;
		export_csv(writer, self.coin(), notes, transactions)
			.map_err(|e| AccountError::Notes(e.into()))
	}
}
