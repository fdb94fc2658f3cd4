//! Watermark validation and repair rules.

use super::types::{AuditReason, StoredBlock};

/// Bounds used when deciding whether a stored watermark can be trusted.
#[derive(Debug, Clone, Copy)]
pub struct WatermarkPolicy {
	/// Exclusive upper bound for any sane block number on the tracked chain.
	pub sanity_ceiling: u64,
	/// How far past the observed height a stored value may sit before it counts as corrupt.
	pub repair_tolerance: u64,
}

impl Default for WatermarkPolicy {
	fn default() -> Self {
		Self {
			sanity_ceiling: 100_000_000,
			repair_tolerance: 1_000,
		}
	}
}

impl WatermarkPolicy {
	/// Highest watermark accepted without repair when the chain is observed at `observed_height`.
	pub fn limit(&self, observed_height: u64) -> u64 {
		observed_height
			.saturating_add(self.repair_tolerance)
			.min(self.sanity_ceiling.saturating_sub(1))
	}

	/// Decide how to repair `stored`, or `None` when it can be used as is.
	///
	/// Corrections only ever lower the value: a single division by ten first (a digit glued
	/// onto the number), accepted only when the result lands within the tolerance of
	/// `observed_height`; then the highest block with a recorded transaction; then zero.
	pub fn plan_repair(
		&self,
		stored: &StoredBlock,
		observed_height: u64,
		ledger_max_block: Option<u64>,
	) -> Option<(u64, AuditReason)> {
		let limit = self.limit(observed_height);
		let numeric = stored.numeric();

		if let Some(value) = numeric {
			if value <= limit {
				return match stored {
					StoredBlock::Text(_) => Some((value, AuditReason::Retyped)),
					_ => None,
				};
			}
			// Only a value sitting about ten times the chain height has a glued digit.
			let corrected = value / 10;
			if corrected <= limit && corrected.saturating_add(self.repair_tolerance) >= observed_height {
				return Some((corrected, AuditReason::MagnitudeCorrection));
			}
		}

		match ledger_max_block.filter(|block| *block <= limit) {
			Some(block) => Some((block, AuditReason::LedgerFallback)),
			None => Some((0, AuditReason::ResetToZero)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn policy() -> WatermarkPolicy {
		WatermarkPolicy::default()
	}

	#[test]
	fn sane_integer_needs_no_repair() {
		assert_eq!(
			policy().plan_repair(&StoredBlock::Integer(31_522_000), 31_522_845, None),
			None
		);
		assert_eq!(policy().plan_repair(&StoredBlock::Missing, 10, None), None);
	}

	#[test]
	fn concatenated_digit_is_divided_away() {
		assert_eq!(
			policy().plan_repair(&StoredBlock::Integer(315_228_551), 31_522_845, Some(31_000_000)),
			Some((31_522_855, AuditReason::MagnitudeCorrection))
		);
	}

	#[test]
	fn falls_back_to_ledger_when_division_is_not_enough() {
		assert_eq!(
			policy().plan_repair(&StoredBlock::Integer(3_152_285_519), 31_522_845, Some(31_400_000)),
			Some((31_400_000, AuditReason::LedgerFallback))
		);
	}

	#[test]
	fn value_just_ahead_of_a_lagging_height_is_not_divided() {
		assert_eq!(
			policy().plan_repair(&StoredBlock::Integer(31_524_000), 31_522_000, Some(31_500_000)),
			Some((31_500_000, AuditReason::LedgerFallback))
		);
		assert_eq!(
			policy().plan_repair(&StoredBlock::Integer(31_524_000), 31_522_000, None),
			Some((0, AuditReason::ResetToZero))
		);
	}

	#[test]
	fn resets_to_zero_without_evidence() {
		assert_eq!(
			policy().plan_repair(&StoredBlock::Text("NaN".into()), 31_522_845, None),
			Some((0, AuditReason::ResetToZero))
		);
		assert_eq!(
			policy().plan_repair(&StoredBlock::Integer(-5), 1_000, None),
			Some((0, AuditReason::ResetToZero))
		);
	}

	#[test]
	fn ledger_fallback_beyond_limit_is_ignored() {
		assert_eq!(
			policy().plan_repair(&StoredBlock::Integer(99_999_999_999), 5_000, Some(90_000)),
			Some((0, AuditReason::ResetToZero))
		);
	}

	#[test]
	fn numeric_text_is_retyped() {
		assert_eq!(
			policy().plan_repair(&StoredBlock::Text("31522800".into()), 31_522_845, None),
			Some((31_522_800, AuditReason::Retyped))
		);
	}

	#[test]
	fn limit_never_reaches_ceiling() {
		let policy = WatermarkPolicy {
			sanity_ceiling: 1_000,
			repair_tolerance: 500,
		};
		assert_eq!(policy.limit(900), 999);
	}
}
