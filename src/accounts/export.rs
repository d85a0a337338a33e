//! CSV export of an account's transactions.
//!
//! Columns, in order: `Time, Type, Amount, Unit, Fee, Address, Transaction ID, Note`. A
//! transaction with several counterparties spans one row per address; the fee is only written on
//! the first of them. Amounts and fees are in the coin's smallest unit, times in RFC 3339.

use std::io::{self, Write};

use chrono::SecondsFormat;

use super::notes::Notes;
use super::transaction::{TransactionData, TxType};
use crate::coin::Coin;

const HEADER: [&str; 8] = [
	"Time",
	"Type",
	"Amount",
	"Unit",
	"Fee",
	"Address",
	"Transaction ID",
	"Note",
];

fn escape(field: &str) -> String {
	if field.contains([',', '"', '\n', '\r']) {
		format!("\"{}\"", field.replace('"', "\"\""))
	} else {
		field.to_string()
	}
}

fn write_row<W: Write>(writer: &mut W, fields: &[&str]) -> io::Result<()> {
	let line = fields
		.iter()
		.map(|field| escape(field))
		.collect::<Vec<_>>()
		.join(",");
	writer.write_all(line.as_bytes())?;
	writer.write_all(b"\n")
}

fn type_label(tx_type: TxType) -> &'static str {
	match tx_type {
		TxType::Receive => "received",
		TxType::Send => "sent",
		TxType::SendSelf => "sent_to_yourself",
	}
}

pub fn export_csv<'a, W: Write>(
	writer: &mut W,
	coin: &Coin,
	notes: &Notes,
	transactions: impl IntoIterator<Item = &'a TransactionData>,
) -> io::Result<()> {
	write_row(writer, &HEADER)?;
	let unit = coin.smallest_unit();
	for tx in transactions {
		let time = tx
			.timestamp
			.map(|timestamp| timestamp.to_rfc3339_opts(SecondsFormat::Secs, true))
			.unwrap_or_default();
		let note = notes.tx_note(&tx.internal_id);
		let mut fee = tx
			.fee
			.as_ref()
			.map(|fee| fee.to_string())
			.unwrap_or_default();
		for counterparty in &tx.addresses {
			let label = if tx.tx_type == TxType::Send && counterparty.ours {
				type_label(TxType::SendSelf)
			} else {
				type_label(tx.tx_type)
			};
			let amount = counterparty.amount.to_string();
			write_row(
				writer,
				&[
					time.as_str(),
					label,
					amount.as_str(),
					unit,
					fee.as_str(),
					counterparty.address.as_str(),
					tx.tx_id.as_str(),
					note.as_str(),
				],
			)?;
			fee.clear();
		}
	}
	writer.flush()
}
