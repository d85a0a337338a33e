//! Integer amounts in the smallest unit of a coin.
//!
//! Amounts are backed by an arbitrary precision integer so that the same type can hold satoshis,
//! wei and ERC-20 token units. Decimal strings entered by the user are parsed against the number
//! of decimals of the coin, and formatted back the same way.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Neg, Sub};

use num_bigint::{BigInt, Sign};
use num_traits::{ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
	#[error("invalid amount: {0}")]
	Invalid(String),

	#[error("amount must not be negative")]
	Negative,

	#[error("amount must be positive")]
	Zero,
}

/// An amount in the smallest unit of a coin (satoshi, wei, token base unit).
///
/// `Clone` produces an independent copy of the underlying integer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Amount(BigInt);

impl Amount {
	pub fn new(value: BigInt) -> Self {
		Self(value)
	}

	pub fn from_i64(value: i64) -> Self {
		Self(BigInt::from(value))
	}

	pub fn from_u64(value: u64) -> Self {
		Self(BigInt::from(value))
	}

	pub fn zero() -> Self {
		Self(BigInt::zero())
	}

	pub fn as_bigint(&self) -> &BigInt {
		&self.0
	}

	pub fn into_bigint(self) -> BigInt {
		self.0
	}

	pub fn is_zero(&self) -> bool {
		self.0.is_zero()
	}

	pub fn is_negative(&self) -> bool {
		self.0.sign() == Sign::Minus
	}

	/// Returns the value as i64, if it fits.
	pub fn to_i64(&self) -> Option<i64> {
		self.0.to_i64()
	}

	pub fn to_u64(&self) -> Option<u64> {
		self.0.to_u64()
	}

	/// Parses a decimal string expressed in the coin unit, e.g. "0.5" BTC with 8 decimals
	/// becomes 50_000_000.
	///
	/// Fractions (`1/2`), exponents and more fractional digits than `decimals` are rejected.
	pub fn parse(input: &str, decimals: u32) -> Result<Self, AmountError> {
		let trimmed = input.trim();
		if trimmed.is_empty() {
			return Err(AmountError::Invalid(input.to_string()));
		}
		let (negative, unsigned) = match trimmed.strip_prefix('-') {
			Some(rest) => (true, rest),
			None => (false, trimmed),
		};
		let (integer_part, fraction_part) = match unsigned.split_once('.') {
			Some((integer, fraction)) => (integer, fraction),
			None => (unsigned, ""),
		};
		if integer_part.is_empty() && fraction_part.is_empty() {
			return Err(AmountError::Invalid(input.to_string()));
		}
		let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
		if !all_digits(integer_part) || !all_digits(fraction_part) {
			return Err(AmountError::Invalid(input.to_string()));
		}
		if fraction_part.len() > decimals as usize {
			return Err(AmountError::Invalid(format!(
				"{} has more than {} decimals",
				input, decimals
			)));
		}

		let padded = format!(
			"{}{:0<width$}",
			integer_part,
			fraction_part,
			width = decimals as usize
		);
		let mut value = if padded.is_empty() {
			BigInt::zero()
		} else {
			padded
				.parse::<BigInt>()
				.map_err(|_| AmountError::Invalid(input.to_string()))?
		};
		if negative {
			value = -value;
		}
		Ok(Self(value))
	}

	/// Formats the amount in the coin unit, trimming trailing zeros of the fractional part.
	pub fn format(&self, decimals: u32) -> String {
		let digits = self.0.magnitude().to_string();
		let sign = if self.is_negative() { "-" } else { "" };
		let decimals = decimals as usize;
		if decimals == 0 {
			return format!("{}{}", sign, digits);
		}
		let padded = format!("{:0>width$}", digits, width = decimals + 1);
		let (integer, fraction) = padded.split_at(padded.len() - decimals);
		let fraction = fraction.trim_end_matches('0');
		if fraction.is_empty() {
			format!("{}{}", sign, integer)
		} else {
			format!("{}{}.{}", sign, integer, fraction)
		}
	}

	/// Converts the amount to a fiat value using a per-unit exchange rate.
	pub fn fiat_value(&self, decimals: u32, rate: f64) -> f64 {
		let value = self.0.to_f64().unwrap_or(0.0);
		value / 10f64.powi(decimals as i32) * rate
	}
}

impl fmt::Display for Amount {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<i64> for Amount {
	fn from(value: i64) -> Self {
		Self::from_i64(value)
	}
}

impl From<BigInt> for Amount {
	fn from(value: BigInt) -> Self {
		Self(value)
	}
}

impl Add for Amount {
	type Output = Amount;

	fn add(self, rhs: Amount) -> Amount {
		Amount(self.0 + rhs.0)
	}
}

impl<'a> Add<&'a Amount> for &'a Amount {
	type Output = Amount;

	fn add(self, rhs: &'a Amount) -> Amount {
		Amount(&self.0 + &rhs.0)
	}
}

impl Sub for Amount {
	type Output = Amount;

	fn sub(self, rhs: Amount) -> Amount {
		Amount(self.0 - rhs.0)
	}
}

impl<'a> Sub<&'a Amount> for &'a Amount {
	type Output = Amount;

	fn sub(self, rhs: &'a Amount) -> Amount {
		Amount(&self.0 - &rhs.0)
	}
}

impl Neg for Amount {
	type Output = Amount;

	fn neg(self) -> Amount {
		Amount(-self.0)
	}
}

impl Sum for Amount {
	fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
		iter.fold(Amount::zero(), |acc, amount| acc + amount)
	}
}

/// The amount a user asked to send: either a decimal string or "everything".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendAmount {
	Amount(String),
	All,
}

impl Default for SendAmount {
	fn default() -> Self {
		SendAmount::Amount(String::new())
	}
}

impl SendAmount {
	pub fn new(amount: impl Into<String>) -> Self {
		SendAmount::Amount(amount.into())
	}

	pub fn send_all(&self) -> bool {
		matches!(self, SendAmount::All)
	}

	/// Parses the user amount. Negative amounts are rejected, as is zero unless `allow_zero`.
	///
	/// # Panics
	///
	/// Panics when called on [`SendAmount::All`]; the caller must compute the send-all amount
	/// from the balance.
	pub fn amount(&self, decimals: u32, allow_zero: bool) -> Result<Amount, AmountError> {
		let SendAmount::Amount(input) = self else {
			panic!("can't get the amount of a send-all proposal");
		};
		let amount = Amount::parse(input, decimals)?;
		if amount.is_negative() {
			return Err(AmountError::Negative);
		}
		if !allow_zero && amount.is_zero() {
			return Err(AmountError::Zero);
		}
		Ok(amount)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse() {
		assert_eq!(Amount::parse("1", 8).unwrap(), Amount::from_i64(100_000_000));
		assert_eq!(Amount::parse("0.00000001", 8).unwrap(), Amount::from_i64(1));
		assert_eq!(Amount::parse(".5", 8).unwrap(), Amount::from_i64(50_000_000));
		assert_eq!(Amount::parse("12.", 2).unwrap(), Amount::from_i64(1200));
		assert_eq!(Amount::parse("-1.5", 1).unwrap(), Amount::from_i64(-15));
		assert_eq!(
			Amount::parse("1", 18).unwrap().to_string(),
			"1000000000000000000"
		);
	}

	#[test]
	fn test_parse_rejects() {
		for input in ["", "1/2", "1e8", "abc", "0.000000001", "1.2.3", ".", "-", "+1"] {
			assert!(Amount::parse(input, 8).is_err(), "input {:?}", input);
		}
	}

	#[test]
	fn test_format() {
		assert_eq!(Amount::from_i64(100_000_000).format(8), "1");
		assert_eq!(Amount::from_i64(123_450_000).format(8), "1.2345");
		assert_eq!(Amount::from_i64(1).format(8), "0.00000001");
		assert_eq!(Amount::from_i64(-5).format(1), "-0.5");
		assert_eq!(Amount::from_i64(42).format(0), "42");
	}

	#[test]
	fn test_clone_does_not_alias() {
		let original = Amount::from_i64(10);
		let mut copy = original.clone();
		copy = copy + Amount::from_i64(5);
		assert_eq!(original, Amount::from_i64(10));
		assert_eq!(copy, Amount::from_i64(15));
	}

	#[test]
	fn test_send_amount() {
		assert_eq!(
			SendAmount::new("0.1").amount(8, false).unwrap(),
			Amount::from_i64(10_000_000)
		);
		assert_eq!(
			SendAmount::new("-1").amount(8, false),
			Err(AmountError::Negative)
		);
		assert_eq!(SendAmount::new("0").amount(8, false), Err(AmountError::Zero));
		assert_eq!(SendAmount::new("0").amount(8, true).unwrap(), Amount::zero());
		assert!(SendAmount::new("1/3").amount(8, true).is_err());
	}

	#[test]
	#[should_panic]
	fn test_send_all_amount_panics() {
		let _ = SendAmount::All.amount(8, true);
	}
}
