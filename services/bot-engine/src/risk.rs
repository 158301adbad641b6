//! Auto-close guard
//!
//! A bot with `autoClose.dropPercent` is stopped once the ticker falls that far
//! below the reference price frozen when its run started.

use rust_decimal::Decimal;

use crate::strategy::GridConfig;

/// Price at or below which auto-close fires
pub fn auto_close_floor(reference: Decimal, drop_percent: Decimal) -> Decimal {
    reference * (Decimal::ONE - drop_percent / Decimal::ONE_HUNDRED)
}

/// Reason string if `ticker` breaches the auto-close floor, `None` otherwise.
/// Bots without auto-close or without a reference price never breach.
pub fn check_auto_close(
    config: &GridConfig,
    reference: Option<Decimal>,
    ticker: Decimal,
) -> Option<String> {
    let drop_percent = config.auto_close?.drop_percent;
    let reference = reference.filter(|r| *r > Decimal::ZERO)?;
    let floor = auto_close_floor(reference, drop_percent);
    if ticker > floor {
        return None;
    }
    Some(format!(
        "price {} is {}% or more below reference {} (floor {})",
        ticker,
        drop_percent,
        reference,
        floor.normalize()
    ))
}
