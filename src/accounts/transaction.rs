//! Coin-independent view of wallet transactions.
//!
//! [`OrderedTransactions`] sorts a list of [`TransactionData`] newest first and annotates every
//! row with the cumulative account balance right after that transaction. The ordering is:
//!
//! 1. unconfirmed transactions with unconfirmed parents (`height < 0`),
//! 2. unconfirmed transactions with confirmed parents (`height == 0`),
//! 3. confirmed transactions by descending height.
//!
//! Unconfirmed tiers are ordered by descending creation time, rows without one sorting as oldest.
//! Balances accumulate from the oldest row upwards.

use std::cmp::Ordering;
use std::ops::Deref;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coin::Amount;

/// Upper bound on the number of points [`OrderedTransactions::timeseries`] produces.
pub const MAX_TIMESERIES_POINTS: i64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TxType {
	#[default]
	Receive,
	Send,
	SendSelf,
}

impl TxType {
	pub fn as_str(&self) -> &'static str {
		match self {
			TxType::Receive => "receive",
			TxType::Send => "send",
			TxType::SendSelf => "sendSelf",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
	#[default]
	Confirmed,
	Pending,
	/// Mined but reverted. Only the fee left the account.
	Failed,
}

/// A counterparty of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddressAndAmount {
	pub address: String,
	pub amount: Amount,
	/// The address belongs to this account.
	pub ours: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransactionData {
	/// Chain transaction id.
	pub tx_id: String,
	/// Unique id within the account. Equal to `tx_id` for UTXO coins.
	pub internal_id: String,
	pub tx_type: TxType,
	pub status: TxStatus,
	/// Always non-negative; the direction is carried by `tx_type`.
	pub amount: Amount,
	pub fee: Option<Amount>,
	/// The fee is paid in a different coin, e.g. ETH gas for an ERC-20 transfer.
	pub fee_is_different_unit: bool,
	/// Block time. `None` while unconfirmed or before headers are synced.
	pub timestamp: Option<DateTime<Utc>>,
	/// Local submission time of an outgoing transaction.
	pub created_timestamp: Option<DateTime<Utc>>,
	/// Positive when mined, 0 when unconfirmed with confirmed parents, negative when unconfirmed
	/// with unconfirmed parents.
	pub height: i64,
	pub num_confirmations: u32,
	/// Confirmations after which the transaction counts as final for this coin.
	pub num_confirmations_complete: u32,
	pub addresses: Vec<AddressAndAmount>,

	// UTXO coins only.
	pub size: Option<u64>,
	pub vsize: Option<u64>,
	pub weight: Option<u64>,

	// Account-based coins only.
	pub gas: Option<u64>,
	pub nonce: Option<u64>,
}

impl TransactionData {
	pub fn is_confirmed(&self) -> bool {
		self.height > 0
	}

	fn fee_in_this_unit(&self) -> Amount {
		match &self.fee {
			Some(fee) if !self.fee_is_different_unit => fee.clone(),
			_ => Amount::zero(),
		}
	}

	/// Change of this account's balance caused by the transaction.
	pub fn balance_delta(&self) -> Amount {
		let failed = self.status == TxStatus::Failed;
		match self.tx_type {
			TxType::Receive if failed => Amount::zero(),
			TxType::Receive => self.amount.clone(),
			TxType::Send if failed => -self.fee_in_this_unit(),
			TxType::Send => -(&self.amount + &self.fee_in_this_unit()),
			TxType::SendSelf => -self.fee_in_this_unit(),
		}
	}

	/// What leaves the account, regardless of success.
	pub fn deducted_amount(&self) -> Amount {
		match self.tx_type {
			TxType::Receive => Amount::zero(),
			TxType::Send => &self.amount + &self.fee_in_this_unit(),
			TxType::SendSelf => self.fee_in_this_unit(),
		}
	}
}

/// A transaction together with the account balance right after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedTransaction {
	#[serde(flatten)]
	pub tx: TransactionData,
	pub balance: Amount,
}

impl Deref for OrderedTransaction {
	type Target = TransactionData;

	fn deref(&self) -> &TransactionData {
		&self.tx
	}
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeseriesError {
	#[error("invalid timeseries range")]
	InvalidRange,

	#[error("timeseries would have more than {MAX_TIMESERIES_POINTS} points")]
	TooManyPoints,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeseriesEntry {
	pub time: DateTime<Utc>,
	pub value: Amount,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrderedTransactions(Vec<OrderedTransaction>);

fn tier(height: i64) -> u8 {
	match height.cmp(&0) {
		Ordering::Less => 0,
		Ordering::Equal => 1,
		Ordering::Greater => 2,
	}
}

fn newest_first(a: &TransactionData, b: &TransactionData) -> Ordering {
	tier(a.height).cmp(&tier(b.height)).then_with(|| {
		if a.is_confirmed() {
			b.height
				.cmp(&a.height)
				.then_with(|| b.timestamp.cmp(&a.timestamp))
		} else {
			b.created_timestamp.cmp(&a.created_timestamp)
		}
	})
}

impl OrderedTransactions {
	pub fn new(mut txs: Vec<TransactionData>) -> Self {
		txs.sort_by(newest_first);

		let mut balance = Amount::zero();
		let mut rows: Vec<OrderedTransaction> = Vec::with_capacity(txs.len());
		for tx in txs.into_iter().rev() {
			balance = balance + tx.balance_delta();
			rows.push(OrderedTransaction {
				tx,
				balance: balance.clone(),
			});
		}
		rows.reverse();
		Self(rows)
	}

	pub fn into_inner(self) -> Vec<OrderedTransaction> {
		self.0
	}

	/// Looks up a transaction by its internal id.
	pub fn find(&self, internal_id: &str) -> Option<&OrderedTransaction> {
		self.0.iter().find(|row| row.internal_id == internal_id)
	}

	/// Balance after the newest transaction.
	pub fn current_balance(&self) -> Amount {
		self.0
			.first()
			.map(|row| row.balance.clone())
			.unwrap_or_default()
	}

	/// Samples the confirmed balance at `start + k * interval` for every `k` up to `end`.
	///
	/// Each point holds the balance right after the newest confirmed transaction with a block time
	/// not after the point, or zero if there is none.
	pub fn timeseries(
		&self,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
		interval: TimeDelta,
	) -> Result<Vec<TimeseriesEntry>, TimeseriesError> {
		if start >= end || interval <= TimeDelta::zero() {
			return Err(TimeseriesError::InvalidRange);
		}
		let span = end - start;
		let steps = match (span.num_nanoseconds(), interval.num_nanoseconds()) {
			(Some(span), Some(interval)) => span / interval,
			// Spans of centuries: milliseconds are exact enough to hit the cap.
			_ => span.num_milliseconds() / interval.num_milliseconds().max(1),
		};
		if steps >= MAX_TIMESERIES_POINTS {
			return Err(TimeseriesError::TooManyPoints);
		}

		let confirmed: Vec<(DateTime<Utc>, &Amount)> = self
			.0
			.iter()
			.filter(|row| row.is_confirmed())
			.filter_map(|row| row.timestamp.map(|timestamp| (timestamp, &row.balance)))
			.collect();

		let mut result = Vec::with_capacity(steps as usize + 1);
		let mut time = start;
		while time <= end {
			let value = confirmed
				.iter()
				.find(|(timestamp, _)| *timestamp <= time)
				.map(|(_, balance)| (*balance).clone())
				.unwrap_or_default();
			result.push(TimeseriesEntry { time, value });
			time += interval;
		}
		Ok(result)
	}
}

impl Deref for OrderedTransactions {
	type Target = [OrderedTransaction];

	fn deref(&self) -> &[OrderedTransaction] {
		&self.0
	}
}

impl IntoIterator for OrderedTransactions {
	type Item = OrderedTransaction;
	type IntoIter = std::vec::IntoIter<OrderedTransaction>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.into_iter()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	fn at(day: u32, hour: u32) -> Option<DateTime<Utc>> {
		Some(Utc.with_ymd_and_hms(2020, 9, day, hour, 0, 0).unwrap())
	}

	fn tx(tx_type: TxType, amount: i64, height: i64, timestamp: Option<DateTime<Utc>>) -> TransactionData {
		TransactionData {
			tx_type,
			amount: Amount::from_i64(amount),
			height,
			timestamp,
			..Default::default()
		}
	}

	fn with_fee(mut tx: TransactionData, fee: i64) -> TransactionData {
		tx.fee = Some(Amount::from_i64(fee));
		tx
	}

	fn balances(ordered: &OrderedTransactions) -> Vec<i64> {
		ordered
			.iter()
			.map(|row| row.balance.to_i64().unwrap())
			.collect()
	}

	fn mixed_history() -> Vec<TransactionData> {
		let mut fee_in_eth = with_fee(tx(TxType::Send, 5, 220, at(22, 12)), 1);
		fee_in_eth.fee_is_different_unit = true;
		vec![
			tx(TxType::Receive, 100, 15, at(15, 12)),
			tx(TxType::Receive, 200, 10, at(10, 12)),
			tx(TxType::Receive, 300, 20, at(20, 12)),
			tx(TxType::Send, 20, 0, None),
			tx(TxType::Send, 20, -1, None),
			tx(TxType::Send, 10, 11, at(11, 12)),
			with_fee(tx(TxType::SendSelf, 50, 21, at(21, 12)), 1),
			fee_in_eth,
		]
	}

	#[test]
	fn test_ordering_and_balances() {
		let ordered = OrderedTransactions::new(mixed_history());
		assert_eq!(balances(&ordered), vec![544, 564, 584, 589, 590, 290, 190, 200]);
		let heights: Vec<i64> = ordered.iter().map(|row| row.height).collect();
		assert_eq!(heights, vec![-1, 0, 220, 21, 20, 15, 11, 10]);
		assert_eq!(ordered.current_balance(), Amount::from_i64(544));
	}

	#[test]
	fn test_failed_transactions() {
		let mut failed_send = with_fee(tx(TxType::Send, 50, 22, at(22, 12)), 1);
		failed_send.status = TxStatus::Failed;
		let mut failed_receive = with_fee(tx(TxType::Receive, 1000, 23, at(23, 12)), 1);
		failed_receive.status = TxStatus::Failed;

		let ordered = OrderedTransactions::new(vec![
			tx(TxType::Receive, 100, 15, at(15, 12)),
			tx(TxType::Receive, 200, 10, at(10, 12)),
			tx(TxType::Receive, 300, 20, at(20, 12)),
			with_fee(tx(TxType::SendSelf, 50, 21, at(21, 12)), 1),
			failed_send,
			failed_receive,
		]);
		assert_eq!(balances(&ordered), vec![598, 598, 599, 600, 300, 200]);
	}

	#[test]
	fn test_unconfirmed_ordered_by_creation_time() {
		let mut older = tx(TxType::Receive, 1, 0, None);
		older.internal_id = "older".to_string();
		older.created_timestamp = at(1, 0);
		let mut newer = tx(TxType::Receive, 2, 0, None);
		newer.internal_id = "newer".to_string();
		newer.created_timestamp = at(2, 0);
		let mut unknown = tx(TxType::Receive, 4, 0, None);
		unknown.internal_id = "unknown".to_string();

		let ordered = OrderedTransactions::new(vec![older, unknown, newer]);
		let ids: Vec<&str> = ordered.iter().map(|row| row.internal_id.as_str()).collect();
		assert_eq!(ids, vec!["newer", "older", "unknown"]);
		assert!(ordered.find("older").is_some());
	}

	#[test]
	fn test_deducted_amount() {
		let send = with_fee(tx(TxType::Send, 100, 1, at(1, 0)), 10);
		assert_eq!(send.deducted_amount(), Amount::from_i64(110));

		let send_self = with_fee(tx(TxType::SendSelf, 100, 1, at(1, 0)), 10);
		assert_eq!(send_self.deducted_amount(), Amount::from_i64(10));

		let receive = with_fee(tx(TxType::Receive, 100, 1, at(1, 0)), 10);
		assert_eq!(receive.deducted_amount(), Amount::zero());

		let mut erc20 = send.clone();
		erc20.fee_is_different_unit = true;
		assert_eq!(erc20.deducted_amount(), Amount::from_i64(100));

		let mut unconfirmed = send.clone();
		unconfirmed.timestamp = None;
		assert_eq!(unconfirmed.deducted_amount(), Amount::from_i64(110));
	}

	#[test]
	fn test_timeseries() {
		let ordered = OrderedTransactions::new(mixed_history());
		let timeseries = ordered
			.timeseries(
				at(9, 13).unwrap(),
				at(21, 13).unwrap(),
				TimeDelta::hours(24),
			)
			.unwrap();
		let values: Vec<i64> = timeseries
			.iter()
			.map(|entry| entry.value.to_i64().unwrap())
			.collect();
		assert_eq!(
			values,
			vec![0, 200, 190, 190, 190, 190, 290, 290, 290, 290, 290, 590, 589]
		);
		assert_eq!(timeseries[0].time, at(9, 13).unwrap());
		assert_eq!(timeseries[12].time, at(21, 13).unwrap());
	}

	#[test]
	fn test_timeseries_rejects_bad_ranges() {
		let ordered = OrderedTransactions::new(mixed_history());
		let start = at(9, 13).unwrap();
		assert_eq!(
			ordered.timeseries(start, start, TimeDelta::hours(1)),
			Err(TimeseriesError::InvalidRange)
		);
		assert_eq!(
			ordered.timeseries(start, at(10, 13).unwrap(), TimeDelta::zero()),
			Err(TimeseriesError::InvalidRange)
		);
		assert_eq!(
			ordered.timeseries(start, at(30, 13).unwrap(), TimeDelta::seconds(1)),
			Err(TimeseriesError::TooManyPoints)
		);
		assert_eq!(
			ordered.timeseries(start, start + TimeDelta::seconds(4), TimeDelta::microseconds(500)),
			Err(TimeseriesError::TooManyPoints)
		);
		assert_eq!(
			ordered.timeseries(start, start + TimeDelta::days(365_000), TimeDelta::nanoseconds(1)),
			Err(TimeseriesError::TooManyPoints)
		);

		// The cap counts points, both ends included.
		let step = TimeDelta::microseconds(500);
		let points = ordered
			.timeseries(start, start + TimeDelta::microseconds(2_499_500), step)
			.unwrap();
		assert_eq!(points.len(), 5000);
		assert_eq!(
			ordered.timeseries(start, start + TimeDelta::milliseconds(2500), step),
			Err(TimeseriesError::TooManyPoints)
		);
	}
}
