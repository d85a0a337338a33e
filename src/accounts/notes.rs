//! Per-account transaction notes, persisted as a small JSON file.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a single note in bytes.
pub const MAX_NOTE_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum NotesError {
	#[error("note too long: {0} bytes, at most {MAX_NOTE_LEN} allowed")]
	TooLong(usize),

	#[error("I/O error: {0}")]
	Io(#[from] io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NotesData {
	/// Transaction internal id to note.
	#[serde(rename = "transactions", default)]
	transaction_notes: HashMap<String, String>,
}

pub struct Notes {
	path: PathBuf,
	data: RwLock<NotesData>,
}

impl Notes {
	/// Loads the notes file. A missing file yields empty notes.
	pub fn load(path: impl Into<PathBuf>) -> Result<Self, NotesError> {
		let path = path.into();
		let data = match fs::read(&path) {
			Ok(bytes) => serde_json::from_slice(&bytes)?,
			Err(e) if e.kind() == io::ErrorKind::NotFound => NotesData::default(),
			Err(e) => return Err(e.into()),
		};
		Ok(Self {
			path,
			data: RwLock::new(data),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// The note of a transaction, or the empty string.
	pub fn tx_note(&self, internal_id: &str) -> String {
		self.data
			.read()
			.transaction_notes
			.get(internal_id)
			.cloned()
			.unwrap_or_default()
	}

	/// Stores a note; an empty note removes the entry. Returns whether the note changed.
	pub fn set_tx_note(&self, internal_id: &str, note: &str) -> Result<bool, NotesError> {
		if note.len() > MAX_NOTE_LEN {
			return Err(NotesError::TooLong(note.len()));
		}
		let mut data = self.data.write();
		let previous = data
			.transaction_notes
			.get(internal_id)
			.map(String::as_str)
			.unwrap_or_default();
		if previous == note {
			return Ok(false);
		}
		if note.is_empty() {
			data.transaction_notes.remove(internal_id);
		} else {
			data.transaction_notes
				.insert(internal_id.to_string(), note.to_string());
		}
		write_atomic(&self.path, &serde_json::to_vec_pretty(&*data)?)?;
		Ok(true)
	}
}

/// Writes to a sibling temp file and renames it over `path`.
fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)?;
	}
	let mut tmp = path.as_os_str().to_owned();
	tmp.push(".tmp");
	let tmp = PathBuf::from(tmp);
	fs::write(&tmp, contents)?;
	fs::rename(&tmp, path)
}
