//! Client order id generation.
//!
//! Ids follow `{symbol}_{side}_{yyyymmddHHMMSS}_{rand}` and stay stable for
//! the lifetime of a logical trade: add, reduce and close messages all carry
//! the id minted at open time.

use chrono::Utc;
use uuid::Uuid;

use crate::{ClientOrderId, PosSide};

const RANDOM_SUFFIX_LEN: usize = 6;

/// Mint a fresh client order id for a trade being opened.
#[must_use]
pub fn new_client_order_id(symbol: &str, pos_side: PosSide) -> ClientOrderId {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{symbol}_{}_{stamp}_{}",
        pos_side.as_str(),
        &suffix[..RANDOM_SUFFIX_LEN]
    )
}

/// Check that an id has the shape this process generates.
#[must_use]
pub fn validate_client_order_id(cloid: &str) -> bool {
    if cloid.is_empty() || cloid.len() > 64 {
        return false;
    }
    let mut parts = cloid.rsplitn(3, '_');
    let Some(suffix) = parts.next() else {
        return false;
    };
    let Some(stamp) = parts.next() else {
        return false;
    };
    parts.next().is_some()
        && suffix.len() == RANDOM_SUFFIX_LEN
        && suffix.chars().all(|c| c.is_ascii_alphanumeric())
        && stamp.len() == 14
        && stamp.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_validate() {
        let id = new_client_order_id("ETH-USDT-SWAP", PosSide::Long);
        assert!(id.starts_with("ETH-USDT-SWAP_long_"));
        assert!(validate_client_order_id(&id));
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = new_client_order_id("BTC-USDT-SWAP", PosSide::Short);
        let b = new_client_order_id("BTC-USDT-SWAP", PosSide::Short);
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_ids_rejected() {
        assert!(!validate_client_order_id(""));
        assert!(!validate_client_order_id("nounderscores"));
        assert!(!validate_client_order_id("ETH_long_2024_abc"));
        assert!(!validate_client_order_id(
            "ETH-USDT-SWAP_long_20240101120000_zz!zzz"
        ));
    }
}
