//!
//! Pure operations on a pair's ascending series of rates: lookup with linear interpolation,
//! merging fetched samples, and planning the next forward and backfill ranges.

use chrono::{DateTime, TimeDelta, Utc};

use super::types::{ExchangeRate, PriceLookup};

/// Offset added to the latest known sample before asking for newer ones, so the last sample
/// is not fetched again. Upstream samples are at least 5 minutes apart.
pub fn forward_offset() -> TimeDelta {
	TimeDelta::minutes(10)
}

/// Widest range the upstream answers with hourly samples, minus one hour of slack.
pub fn hourly_span() -> TimeDelta {
	TimeDelta::days(90) - TimeDelta::hours(1)
}

/// Span of one backfill request past the hourly window. Answered with daily samples.
pub fn daily_span() -> TimeDelta {
	TimeDelta::days(365)
}

/// Price at `at` in an ascending series.
pub fn price_at(rates: &[ExchangeRate], at: DateTime<Utc>) -> PriceLookup {
	let (Some(first), Some(last)) = (rates.first(), rates.last()) else {
		return PriceLookup::Empty;
	};
	if at < first.timestamp {
		return PriceLookup::BeforeRange;
	}
	if at > last.timestamp {
		return PriceLookup::AfterRange;
	}
	// First sample at or after `at`. Exists because `at <= last.timestamp`.
	let index = rates.partition_point(|rate| rate.timestamp < at);
	let after = &rates[index];
	if after.timestamp == at || index == 0 {
		return PriceLookup::Found(after.value);
	}
	let before = &rates[index - 1];
	let span = (after.timestamp - before.timestamp).num_milliseconds() as f64;
	let offset = (at - before.timestamp).num_milliseconds() as f64;
	PriceLookup::Found(before.value + (after.value - before.value) * offset / span)
}

/// Appends `fetched` and restores the ascending order. Equal timestamps keep their order.
pub fn merge(history: &mut Vec<ExchangeRate>, fetched: Vec<ExchangeRate>) {
	history.extend(fetched);
	history.sort_by_key(|rate| rate.timestamp);
}

/// Range of the next forward request, or `None` while there is no history to extend.
pub fn forward_range(
	latest: Option<DateTime<Utc>>,
	now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
	latest.map(|latest| (latest + forward_offset(), now))
}

/// Range of the next backfill request, walking backwards from the earliest sample.
pub fn backfill_range(
	earliest: Option<DateTime<Utc>>,
	now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
	match earliest {
		None => (now - hourly_span(), now),
		Some(earliest) => {
			let end = earliest - TimeDelta::days(1);
			(end - daily_span(), end)
		}
	}
}

/// An empty answer ends the backfill only when the range is old enough for the upstream to
/// really have no data. A recent empty range is treated as a glitch.
pub fn backfill_exhausted(fetched: usize, end: DateTime<Utc>, now: DateTime<Utc>) -> bool {
	fetched == 0 && now - end > daily_span()
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	fn at(day: u32, hour: u32) -> DateTime<Utc> {
		Utc.with_ymd_and_hms(2020, 9, day, hour, 0, 0).unwrap()
	}

	fn samples() -> Vec<ExchangeRate> {
		vec![
			ExchangeRate::new(2.0, at(1, 0)),
			ExchangeRate::new(3.0, at(2, 0)),
			ExchangeRate::new(5.0, at(3, 0)),
			ExchangeRate::new(8.0, at(4, 0)),
		]
	}

	#[test]
	fn test_price_at() {
		let rates = samples();
		let before = Utc.with_ymd_and_hms(2020, 8, 31, 0, 0, 0).unwrap();
		assert_eq!(price_at(&rates, before), PriceLookup::BeforeRange);
		assert_eq!(price_at(&rates, at(10, 0)), PriceLookup::AfterRange);
		assert_eq!(price_at(&[], at(2, 0)), PriceLookup::Empty);

		assert_eq!(price_at(&rates, at(1, 0)), PriceLookup::Found(2.0));
		assert_eq!(price_at(&rates, at(3, 0)), PriceLookup::Found(5.0));
		assert_eq!(price_at(&rates, at(4, 0)), PriceLookup::Found(8.0));
		assert_eq!(price_at(&rates, at(1, 12)), PriceLookup::Found(2.5));
		assert_eq!(price_at(&rates, at(2, 12)), PriceLookup::Found(4.0));
		assert_eq!(price_at(&rates, at(3, 12)), PriceLookup::Found(6.5));
		assert_eq!(price_at(&rates, at(3, 18)), PriceLookup::Found(7.25));
		assert_eq!(price_at(&rates, before).value_or_zero(), 0.0);
	}

	#[test]
	fn test_merge_keeps_ascending_order() {
		let mut history = vec![
			ExchangeRate::new(1.0, at(1, 0)),
			ExchangeRate::new(2.0, at(4, 0)),
		];
		merge(
			&mut history,
			vec![ExchangeRate::new(10.0, at(2, 0)), ExchangeRate::new(11.0, at(3, 0))],
		);
		let values: Vec<f64> = history.iter().map(|rate| rate.value).collect();
		assert_eq!(values, vec![1.0, 10.0, 11.0, 2.0]);
	}

	#[test]
	fn test_ranges() {
		let now = at(20, 0);
		assert_eq!(forward_range(None, now), None);
		assert_eq!(
			forward_range(Some(at(19, 0)), now),
			Some((at(19, 0) + TimeDelta::minutes(10), now))
		);

		let (start, end) = backfill_range(None, now);
		assert_eq!(end, now);
		assert_eq!(end - start, TimeDelta::hours(90 * 24 - 1));

		let (start, end) = backfill_range(Some(at(10, 0)), now);
		assert_eq!(end, at(9, 0));
		assert_eq!(end - start, TimeDelta::days(365));

		assert!(!backfill_exhausted(0, at(9, 0), now));
		assert!(!backfill_exhausted(3, at(9, 0) - TimeDelta::days(800), now));
		assert!(backfill_exhausted(0, at(9, 0) - TimeDelta::days(400), now));
	}
}
