// =============================================================================
// Test Symbol Namespace — the `T_` prefix convention
// =============================================================================
//
// Every symbol on the synthetic test path carries the `T_` prefix. The prefix
// is the single routing key that keeps test and production data apart: price
// lookups, outcome resolution, and the test fixture tables all branch on it.
// A symbol without the prefix must never touch a test-only table, and vice
// versa.
// =============================================================================

/// Prefix marking a symbol as belonging to the synthetic test namespace.
pub const TEST_PREFIX: &str = "T_";

/// Whether `symbol` lives in the test namespace.
pub fn is_test_symbol(symbol: &str) -> bool {
    symbol.starts_with(TEST_PREFIX)
}

/// Map a symbol into the test namespace. Idempotent: an already-prefixed
/// symbol is returned unchanged.
pub fn test_symbol(symbol: &str) -> String {
    if is_test_symbol(symbol) {
        symbol.to_string()
    } else {
        format!("{TEST_PREFIX}{symbol}")
    }
}

/// Strip the test prefix, recovering the production symbol. Idempotent on
/// unprefixed input.
pub fn real_symbol(symbol: &str) -> String {
    symbol
        .strip_prefix(TEST_PREFIX)
        .unwrap_or(symbol)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_detection() {
        assert!(is_test_symbol("T_AAPL"));
        assert!(!is_test_symbol("AAPL"));
        assert!(!is_test_symbol("AT_PL"));
    }

    #[test]
    fn real_symbol_strips_prefix() {
        assert_eq!(real_symbol("T_AAPL"), "AAPL");
        assert_eq!(real_symbol("AAPL"), "AAPL");
    }

    #[test]
    fn test_symbol_is_idempotent() {
        let once = test_symbol("AAPL");
        assert_eq!(once, "T_AAPL");
        assert_eq!(test_symbol(&once), once);
    }

    #[test]
    fn roundtrip() {
        assert_eq!(real_symbol(&test_symbol("BTCUSD")), "BTCUSD");
    }
}
