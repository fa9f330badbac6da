use bigdecimal::{BigDecimal, ToPrimitive};

/// Raw-unit decimals of the NYANTE BEP20 contract. All ledger amounts are
/// u128 multiples of `10^-18` tokens.
pub const TOKEN_DECIMALS: u32 = 18;
pub const TOKEN_SYMBOL: &str = "NYANTE";

pub const BNB_DECIMALS: u32 = 18;

pub const ONE_TOKEN: u128 = 10u128.pow(TOKEN_DECIMALS);

/// Parses a human-entered token amount ("1", "0.5", "1,000,000") into raw
/// units. Rejects negative amounts and more precision than the token has.
pub fn parse_token_amount(input: &str) -> Option<u128> {
    let input = input.replace(',', "");
    let amount: BigDecimal = input.parse().ok()?;
    if amount < BigDecimal::from(0) {
        return None;
    }
    let scaled = amount * BigDecimal::from(ONE_TOKEN);
    if !scaled.is_integer() {
        return None;
    }
    scaled.to_u128()
}

pub fn format_tokens(amount: u128) -> String {
    format_token_amount(amount, TOKEN_DECIMALS, TOKEN_SYMBOL)
}

pub fn format_bnb(amount: u128) -> String {
    format_token_amount(amount, BNB_DECIMALS, "BNB")
}

pub fn format_token_amount(amount: u128, decimals: u32, symbol: &str) -> String {
    if amount == 0 {
        return format!("0 {symbol}");
    }
    let whole = amount / 10u128.pow(decimals);
    let frac = amount % 10u128.pow(decimals);
    if frac == 0 {
        return format!("{} {symbol}", group_digits(whole));
    }
    let frac = format!("{frac:0width$}", width = decimals as usize);
    let frac = frac.trim_end_matches('0');
    // Cap the fractional part so dust doesn't produce 18-digit tails
    let precision = if whole >= 1 { 4 } else { 8 };
    let frac = if frac.len() > precision {
        &frac[..precision]
    } else {
        frac
    };
    if frac.is_empty() || frac.chars().all(|c| c == '0') {
        format!("~{} {symbol}", group_digits(whole))
    } else {
        format!("{}.{} {symbol}", group_digits(whole), frac)
    }
}

fn group_digits(value: u128) -> String {
    let digits = value.to_string();
    let mut result = String::new();
    for (count, digit) in digits.chars().rev().enumerate() {
        if count != 0 && count % 3 == 0 {
            result.insert(0, ',');
        }
        result.insert(0, digit);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_whole_and_fractional_amounts() {
        assert_eq!(parse_token_amount("1"), Some(ONE_TOKEN));
        assert_eq!(parse_token_amount("0.5"), Some(ONE_TOKEN / 2));
        assert_eq!(
            parse_token_amount("1,000,000"),
            Some(1_000_000 * ONE_TOKEN)
        );
        assert_eq!(parse_token_amount("0"), Some(0));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_token_amount("-1"), None);
        assert_eq!(parse_token_amount("abc"), None);
        assert_eq!(parse_token_amount(""), None);
        // 19 decimal places is more precision than the token has
        assert_eq!(parse_token_amount("0.0000000000000000001"), None);
    }

    #[test]
    fn formats_amounts() {
        assert_eq!(format_tokens(0), "0 NYANTE");
        assert_eq!(format_tokens(ONE_TOKEN), "1 NYANTE");
        assert_eq!(format_tokens(1_500_000 * ONE_TOKEN), "1,500,000 NYANTE");
        assert_eq!(format_tokens(ONE_TOKEN / 2), "0.5 NYANTE");
        assert_eq!(format_tokens(ONE_TOKEN + ONE_TOKEN / 4), "1.25 NYANTE");
    }
}
