//! Grid strategy configuration and trigger evaluation
//!
//! Parsed from a bot's `config` JSON. Only the inputs and outputs of trigger
//! evaluation are modeled here; the processor owns what happens next.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::OrderSide;

/// How the grid anchor is chosen when a run starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasePriceType {
    /// `basePrice` from the config
    Fixed,
    /// Ticker price at start/resume
    Current,
}

/// Distance of a trigger threshold from its anchor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PriceDelta {
    /// Percent of the anchor, e.g. `5` for 5%
    Percent(Decimal),
    Absolute(Decimal),
}

impl PriceDelta {
    fn value(&self) -> Decimal {
        match self {
            PriceDelta::Percent(v) | PriceDelta::Absolute(v) => *v,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.value() > Decimal::ZERO
    }

    /// Threshold above `anchor`; `None` if it does not fit in a `Decimal`
    pub fn above(&self, anchor: Decimal) -> Option<Decimal> {
        match self {
            PriceDelta::Percent(p) => Decimal::ONE
                .checked_add(*p / Decimal::ONE_HUNDRED)
                .and_then(|factor| anchor.checked_mul(factor)),
            PriceDelta::Absolute(a) => anchor.checked_add(*a),
        }
    }

    pub fn below(&self, anchor: Decimal) -> Option<Decimal> {
        match self {
            PriceDelta::Percent(p) => anchor.checked_mul(Decimal::ONE - *p / Decimal::ONE_HUNDRED),
            PriceDelta::Absolute(a) => anchor.checked_sub(*a),
        }
    }
}

/// Size of every leg
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSize {
    /// Fixed amount of the base asset
    Base(Decimal),
    /// Fixed notional in the quote asset; amount = notional / price
    Quote(Decimal),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoCloseConfig {
    /// Stop the bot once the ticker falls this many percent below the
    /// reference price frozen at start/resume
    pub drop_percent: Decimal,
}

/// Strategy parameters stored in `bots.config`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridConfig {
    #[serde(default = "default_base_price_type")]
    pub base_price_type: String,
    #[serde(default)]
    pub base_price: Option<Decimal>,
    #[serde(default)]
    pub rise_sell: Option<PriceDelta>,
    #[serde(default)]
    pub fall_buy: Option<PriceDelta>,
    pub order_size: OrderSize,
    #[serde(default)]
    pub price_min: Option<Decimal>,
    #[serde(default)]
    pub price_max: Option<Decimal>,
    #[serde(default)]
    pub auto_close: Option<AutoCloseConfig>,
}

fn default_base_price_type() -> String {
    "fixed".to_string()
}

impl GridConfig {
    /// Parse and validate a bot's config JSON
    pub fn from_json(value: &serde_json::Value) -> Result<Self, EngineError> {
        let config: GridConfig = serde_json::from_value(value.clone())
            .map_err(|e| EngineError::ConfigValidation(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let base_type = self.base_price_type()?;
        if base_type == BasePriceType::Fixed {
            match self.base_price {
                Some(p) if p > Decimal::ZERO => {}
                _ => {
                    return Err(EngineError::ConfigValidation(
                        "basePrice must be positive for a fixed base price".to_string(),
                    ))
                }
            }
        }

        let size = match self.order_size {
            OrderSize::Base(v) | OrderSize::Quote(v) => v,
        };
        if size <= Decimal::ZERO {
            return Err(EngineError::ConfigValidation(
                "orderSize must be positive".to_string(),
            ));
        }

        for (name, delta) in [("riseSell", self.rise_sell), ("fallBuy", self.fall_buy)] {
            if let Some(delta) = delta {
                if delta.value() < Decimal::ZERO {
                    return Err(EngineError::ConfigValidation(format!(
                        "{} must not be negative",
                        name
                    )));
                }
            }
        }
        if let Some(PriceDelta::Percent(p)) = self.fall_buy {
            if p >= Decimal::ONE_HUNDRED {
                return Err(EngineError::ConfigValidation(
                    "fallBuy percent must be below 100".to_string(),
                ));
            }
        }

        if let (Some(min), Some(max)) = (self.price_min, self.price_max) {
            if min > max {
                return Err(EngineError::ConfigValidation(format!(
                    "priceMin {} is above priceMax {}",
                    min, max
                )));
            }
        }

        if let Some(auto_close) = self.auto_close {
            if auto_close.drop_percent <= Decimal::ZERO
                || auto_close.drop_percent >= Decimal::ONE_HUNDRED
            {
                return Err(EngineError::ConfigValidation(
                    "autoClose.dropPercent must be between 0 and 100".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn base_price_type(&self) -> Result<BasePriceType, EngineError> {
        match self.base_price_type.as_str() {
            "fixed" => Ok(BasePriceType::Fixed),
            "current" => Ok(BasePriceType::Current),
            other => Err(EngineError::UnsupportedBasePriceType(other.to_string())),
        }
    }

    /// True if either side of the grid can fire
    pub fn has_armed_trigger(&self) -> bool {
        self.rise_sell.map(|d| d.is_armed()).unwrap_or(false)
            || self.fall_buy.map(|d| d.is_armed()).unwrap_or(false)
    }

    pub fn within_bounds(&self, price: Decimal) -> bool {
        self.price_min.map(|min| price >= min).unwrap_or(true)
            && self.price_max.map(|max| price <= max).unwrap_or(true)
    }
}

/// Reference point for the next leg
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Anchor {
    /// No leg has filled yet in this bot's history
    Base(Decimal),
    /// Latest filled leg; the next leg is its opposite side
    Fill { side: OrderSide, avg_price: Decimal },
}

/// A triggered leg, before gating
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegPlan {
    pub side: OrderSide,
    /// Limit price: the crossed threshold
    pub price: Decimal,
}

/// Check whether `ticker` crosses the next leg's threshold.
///
/// Fails with CONFIG_VALIDATION_ERROR if a threshold overflows.
pub fn evaluate_trigger(
    config: &GridConfig,
    anchor: Anchor,
    ticker: Decimal,
) -> Result<Option<LegPlan>, EngineError> {
    let armed = |delta: Option<PriceDelta>| delta.filter(|d| d.is_armed());
    let overflow = |name: &str, from: Decimal| {
        EngineError::ConfigValidation(format!("{} threshold from {} overflows", name, from))
    };

    let plan = match anchor {
        Anchor::Base(base) => {
            if let Some(fall) = armed(config.fall_buy) {
                let threshold = fall.below(base).ok_or_else(|| overflow("fallBuy", base))?;
                if ticker <= threshold {
                    return Ok(Some(LegPlan {
                        side: OrderSide::Buy,
                        price: threshold,
                    }));
                }
            }
            if let Some(rise) = armed(config.rise_sell) {
                let threshold = rise.above(base).ok_or_else(|| overflow("riseSell", base))?;
                if ticker >= threshold {
                    return Ok(Some(LegPlan {
                        side: OrderSide::Sell,
                        price: threshold,
                    }));
                }
            }
            None
        }
        Anchor::Fill {
            side: OrderSide::Buy,
            avg_price,
        } => match armed(config.rise_sell) {
            Some(rise) => {
                let threshold = rise
                    .above(avg_price)
                    .ok_or_else(|| overflow("riseSell", avg_price))?;
                (ticker >= threshold).then_some(LegPlan {
                    side: OrderSide::Sell,
                    price: threshold,
                })
            }
            None => None,
        },
        Anchor::Fill {
            side: OrderSide::Sell,
            avg_price,
        } => match armed(config.fall_buy) {
            Some(fall) => {
                let threshold = fall
                    .below(avg_price)
                    .ok_or_else(|| overflow("fallBuy", avg_price))?;
                (ticker <= threshold).then_some(LegPlan {
                    side: OrderSide::Buy,
                    price: threshold,
                })
            }
            None => None,
        },
    };
    Ok(plan)
}

/// Round a limit price to the venue's precision
pub fn round_price(price: Decimal, precision: u32) -> Decimal {
    price.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero)
}

/// Leg amount in base units, rounded down to the venue's precision.
/// `None` if a quote size divided by `price` overflows.
pub fn order_amount(size: OrderSize, price: Decimal, amount_precision: u32) -> Option<Decimal> {
    let raw = match size {
        OrderSize::Base(amount) => amount,
        OrderSize::Quote(notional) => {
            if price <= Decimal::ZERO {
                return Some(Decimal::ZERO);
            }
            notional.checked_div(price)?
        }
    };
    Some(raw.round_dp_with_strategy(amount_precision, RoundingStrategy::ToZero))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn grid(rise: Decimal, fall: Decimal) -> GridConfig {
        GridConfig {
            base_price_type: "fixed".to_string(),
            base_price: Some(dec!(100)),
            rise_sell: Some(PriceDelta::Percent(rise)),
            fall_buy: Some(PriceDelta::Percent(fall)),
            order_size: OrderSize::Base(dec!(1)),
            price_min: None,
            price_max: None,
            auto_close: None,
        }
    }

    #[test]
    fn test_parse_from_json() {
        let json = serde_json::json!({
            "basePriceType": "fixed",
            "basePrice": "100",
            "riseSell": { "type": "percent", "value": "5" },
            "fallBuy": { "type": "absolute", "value": "3" },
            "orderSize": { "quote": "50" },
            "priceMin": "80",
            "autoClose": { "dropPercent": "20" }
        });
        let config = GridConfig::from_json(&json).unwrap();
        assert_eq!(config.base_price, Some(dec!(100)));
        assert_eq!(config.fall_buy, Some(PriceDelta::Absolute(dec!(3))));
        assert_eq!(config.order_size, OrderSize::Quote(dec!(50)));
        assert!(config.has_armed_trigger());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = grid(dec!(5), dec!(5));
        config.base_price = None;
        assert!(matches!(config.validate(), Err(EngineError::ConfigValidation(_))));

        let mut config = grid(dec!(5), dec!(5));
        config.price_min = Some(dec!(120));
        config.price_max = Some(dec!(90));
        assert!(matches!(config.validate(), Err(EngineError::ConfigValidation(_))));

        let mut config = grid(dec!(5), dec!(5));
        config.base_price_type = "average_cost".to_string();
        assert!(matches!(
            config.validate(),
            Err(EngineError::UnsupportedBasePriceType(_))
        ));

        let bad = serde_json::json!({ "basePrice": "100" });
        assert!(matches!(
            GridConfig::from_json(&bad),
            Err(EngineError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_base_anchor_buy_below_sell_above() {
        let config = grid(dec!(5), dec!(5));
        let buy = evaluate_trigger(&config, Anchor::Base(dec!(100)), dec!(94)).unwrap().unwrap();
        assert_eq!(buy.side, OrderSide::Buy);
        assert_eq!(buy.price, dec!(95));

        let sell = evaluate_trigger(&config, Anchor::Base(dec!(100)), dec!(106)).unwrap().unwrap();
        assert_eq!(sell.side, OrderSide::Sell);
        assert_eq!(sell.price, dec!(105));

        assert!(evaluate_trigger(&config, Anchor::Base(dec!(100)), dec!(97)).unwrap().is_none());
    }

    #[test]
    fn test_reverse_leg_anchors_on_fill() {
        let config = grid(dec!(5), dec!(5));
        let anchor = Anchor::Fill {
            side: OrderSide::Buy,
            avg_price: dec!(94),
        };
        assert!(evaluate_trigger(&config, anchor, dec!(98)).unwrap().is_none());
        let sell = evaluate_trigger(&config, anchor, dec!(99)).unwrap().unwrap();
        assert_eq!(sell.side, OrderSide::Sell);
        assert_eq!(sell.price, dec!(98.70));

        // Never a second buy on the same side while waiting for the reverse
        assert!(evaluate_trigger(&config, anchor, dec!(80)).unwrap().is_none());
    }

    #[test]
    fn test_asymmetric_and_one_sided() {
        let mut config = grid(dec!(10), dec!(2));
        config.rise_sell = None;
        let anchor = Anchor::Base(dec!(100));
        assert!(evaluate_trigger(&config, anchor, dec!(150)).unwrap().is_none());
        let buy = evaluate_trigger(&config, anchor, dec!(98)).unwrap().unwrap();
        assert_eq!(buy.price, dec!(98));
    }

    #[test]
    fn test_order_amount_rounds_down() {
        assert_eq!(order_amount(OrderSize::Base(dec!(0.123456)), dec!(10), 3), Some(dec!(0.123)));
        assert_eq!(order_amount(OrderSize::Quote(dec!(100)), dec!(30), 4), Some(dec!(3.3333)));
        assert_eq!(order_amount(OrderSize::Quote(dec!(100)), Decimal::ZERO, 4), Some(Decimal::ZERO));
        assert_eq!(order_amount(OrderSize::Quote(Decimal::MAX), dec!(0.0001), 4), None);
    }

    #[test]
    fn test_threshold_overflow_is_a_config_error() {
        assert_eq!(PriceDelta::Percent(dec!(50)).above(Decimal::MAX), None);
        assert_eq!(PriceDelta::Absolute(dec!(1)).above(Decimal::MAX), None);
        assert_eq!(PriceDelta::Absolute(dec!(1)).below(Decimal::MIN), None);

        let mut config = grid(dec!(5), dec!(5));
        config.rise_sell = Some(PriceDelta::Absolute(Decimal::MAX));
        let result = evaluate_trigger(&config, Anchor::Base(dec!(100)), dec!(101));
        assert!(matches!(result, Err(EngineError::ConfigValidation(_))));
    }

    #[test]
    fn test_bounds() {
        let mut config = grid(dec!(5), dec!(5));
        config.price_min = Some(dec!(90));
        config.price_max = Some(dec!(110));
        assert!(config.within_bounds(dec!(95)));
        assert!(!config.within_bounds(dec!(89.99)));
        assert!(!config.within_bounds(dec!(110.01)));
    }
}
