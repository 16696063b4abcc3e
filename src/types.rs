// =============================================================================
// Shared types — product specifications and symbol handling
// =============================================================================
//
// The four CFFEX stock-index futures products are a fixed table, not runtime
// configuration: contract multiplier, margin ratio, fee rates, and tick size
// are set by the exchange and change rarely enough to be compile-time data.

use serde::Serialize;

/// Static specification of one index-futures product.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProductSpec {
    /// Two-letter product code (IC, IM, IF, IH).
    pub product: &'static str,
    /// Underlying index name.
    pub name: &'static str,
    /// Yuan per index point.
    pub multiplier: f64,
    /// Exchange margin requirement as a fraction of notional.
    pub margin_ratio: f64,
    /// Fee rate for opening, as a fraction of notional.
    pub fee_open: f64,
    /// Fee rate for closing an overnight position.
    pub fee_close: f64,
    /// Fee rate for closing a position opened the same day.
    pub fee_close_today: f64,
    /// Minimum price increment.
    pub tick_size: f64,
}

/// The CFFEX product table.
pub const PRODUCTS: [ProductSpec; 4] = [
    ProductSpec {
        product: "IC",
        name: "CSI 500 index futures",
        multiplier: 200.0,
        margin_ratio: 0.12,
        fee_open: 0.000023,
        fee_close: 0.000023,
        fee_close_today: 0.000345,
        tick_size: 0.2,
    },
    ProductSpec {
        product: "IM",
        name: "CSI 1000 index futures",
        multiplier: 200.0,
        margin_ratio: 0.12,
        fee_open: 0.000023,
        fee_close: 0.000023,
        fee_close_today: 0.000345,
        tick_size: 0.2,
    },
    ProductSpec {
        product: "IF",
        name: "CSI 300 index futures",
        multiplier: 300.0,
        margin_ratio: 0.10,
        fee_open: 0.000023,
        fee_close: 0.000023,
        fee_close_today: 0.000345,
        tick_size: 0.2,
    },
    ProductSpec {
        product: "IH",
        name: "SSE 50 index futures",
        multiplier: 300.0,
        margin_ratio: 0.10,
        fee_open: 0.000023,
        fee_close: 0.000023,
        fee_close_today: 0.000345,
        tick_size: 0.2,
    },
];

/// Look up a product spec by its two-letter code (case-insensitive).
pub fn product_spec(product: &str) -> Option<&'static ProductSpec> {
    let upper = product.to_uppercase();
    PRODUCTS.iter().find(|p| p.product == upper)
}

/// Extract the product code from a contract symbol ("IM2503" -> "IM").
pub fn product_of(symbol: &str) -> String {
    symbol.chars().take(2).collect::<String>().to_uppercase()
}

/// Look up the product spec for a contract symbol ("IC0", "IM2503").
pub fn spec_for_symbol(symbol: &str) -> Option<&'static ProductSpec> {
    product_spec(&product_of(symbol))
}

/// True for main-contract shorthand: a 3-char code ending in '0' (e.g. "IM0").
pub fn is_main_contract(symbol: &str) -> bool {
    symbol.len() == 3 && symbol.ends_with('0')
}

/// Normalize a user-supplied symbol.
///
/// Bare product codes become main-contract shorthand ("im" -> "IM0");
/// everything else is uppercased and passed through ("ic2503" -> "IC2503").
pub fn normalize_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    if upper.len() == 2 && product_spec(&upper).is_some() {
        format!("{upper}0")
    } else {
        upper
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_table_lookup() {
        let ic = product_spec("ic").unwrap();
        assert_eq!(ic.multiplier, 200.0);
        assert_eq!(ic.margin_ratio, 0.12);
        let ih = product_spec("IH").unwrap();
        assert_eq!(ih.multiplier, 300.0);
        assert_eq!(ih.margin_ratio, 0.10);
        assert!(product_spec("ZZ").is_none());
    }

    #[test]
    fn symbol_parsing() {
        assert_eq!(product_of("IM2503"), "IM");
        assert_eq!(product_of("ic0"), "IC");
        assert!(is_main_contract("IM0"));
        assert!(!is_main_contract("IM2503"));
        assert!(!is_main_contract("IM"));
    }

    #[test]
    fn symbol_normalization() {
        assert_eq!(normalize_symbol("im"), "IM0");
        assert_eq!(normalize_symbol("IC"), "IC0");
        assert_eq!(normalize_symbol("ic2503"), "IC2503");
        assert_eq!(normalize_symbol(" IF0 "), "IF0");
    }

    #[test]
    fn fee_rates_match_exchange_schedule() {
        for spec in &PRODUCTS {
            assert_eq!(spec.fee_open, 0.000023);
            assert_eq!(spec.fee_close, 0.000023);
            assert_eq!(spec.fee_close_today, 0.000345);
            assert_eq!(spec.tick_size, 0.2);
        }
    }
}
