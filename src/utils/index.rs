/// Render a raw integer token amount with `decimals` fractional digits.
///
/// Integer arithmetic only, so large USDC totals keep every micro-unit.
pub fn format_token_amount(amount: u128, decimals: u32) -> String {
	if decimals == 0 {
		return amount.to_string();
	}
	let scale = 10u128.pow(decimals);
	format!(
		"{}.{:0width$}",
		amount / scale,
		amount % scale,
		width = decimals as usize
	)
}

/// Lower-case an account address and check it is `0x` followed by 20 hex-encoded bytes.
pub fn normalize_address(address: &str) -> Option<String> {
	let trimmed = address.trim();
	let body = trimmed
		.strip_prefix("0x")
		.or_else(|| trimmed.strip_prefix("0X"))?;
	let bytes = hex::decode(body).ok()?;
	if bytes.len() != 20 {
		return None;
	}
	Some(format!("0x{}", hex::encode(bytes)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn formats_six_decimal_amounts_exactly() {
		assert_eq!(format_token_amount(1_500_000, 6), "1.500000");
		assert_eq!(format_token_amount(42, 6), "0.000042");
		assert_eq!(
			format_token_amount(123_456_789_012_345_678, 6),
			"123456789012.345678"
		);
		assert_eq!(format_token_amount(7, 0), "7");
	}

	#[test]
	fn normalizes_mixed_case_addresses() {
		assert_eq!(
			normalize_address("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913").as_deref(),
			Some("0x833589fcd6edb6e08f4c7c32d4f71b54bda02913")
		);
		assert_eq!(normalize_address("0x1234"), None);
		assert_eq!(normalize_address("833589fcd6edb6e08f4c7c32d4f71b54bda02913"), None);
		assert_eq!(normalize_address("0xzz3589fcd6edb6e08f4c7c32d4f71b54bda02913"), None);
	}
}
