//! Symbol and lot translation from source to destination representation.
//!
//! Pure and stateless: identical inputs always give identical outputs, so a
//! retried event always targets the same destination symbol and volume.

use std::collections::{HashMap, HashSet};

use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

use crate::config::{LotConfig, LotMode, SymbolConfig};
use crate::models::{SourcePosition, TranslatedOrder};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslationError {
    #[error("unsupported symbol: {raw} (translated to {translated})")]
    UnsupportedSymbol { raw: String, translated: String },
}

/// Result of sizing a destination order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeTranslation {
    /// Volume that will be traded
    pub volume: Decimal,
    /// Volume before clamping to the lot bounds
    pub requested: Decimal,
    pub clamped: bool,
}

/// Translate a raw source symbol.
///
/// Override on the raw symbol first, then strip the first matching suffix
/// (ASCII case-insensitive) and look for an override on the stripped form.
pub fn translate_symbol(
    raw: &str,
    overrides: &HashMap<String, String>,
    suffixes: &[String],
    allowed: &HashSet<String>,
) -> Result<String, TranslationError> {
    let translated = match overrides.get(raw) {
        Some(mapped) => mapped.clone(),
        None => {
            let stripped = strip_suffix(raw, suffixes);
            overrides
                .get(stripped)
                .cloned()
                .unwrap_or_else(|| stripped.to_string())
        }
    };

    if !allowed.is_empty() && !allowed.contains(&translated) {
        return Err(TranslationError::UnsupportedSymbol {
            raw: raw.to_string(),
            translated,
        });
    }

    Ok(translated)
}

fn strip_suffix<'a>(raw: &'a str, suffixes: &[String]) -> &'a str {
    for suffix in suffixes {
        if suffix.is_empty() || raw.len() <= suffix.len() {
            continue;
        }
        let split = raw.len() - suffix.len();
        if !raw.is_char_boundary(split) {
            continue;
        }
        if raw[split..].eq_ignore_ascii_case(suffix) {
            return &raw[..split];
        }
    }
    raw
}

/// Size a destination order.
///
/// `proportional` scales the source volume by `multiplier`; `fixed` uses
/// `multiplier` as a constant. The result is rounded to `precision` places
/// and saturates into `[min, max]`; clamping never fails.
pub fn translate_volume(
    source_volume: Decimal,
    mode: LotMode,
    multiplier: Decimal,
    min: Decimal,
    max: Decimal,
    precision: u32,
) -> VolumeTranslation {
    let raw = match mode {
        LotMode::Proportional => source_volume * multiplier,
        LotMode::Fixed => multiplier,
    };
    let requested = raw.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero);
    let volume = requested.max(min).min(max);

    VolumeTranslation {
        volume,
        requested,
        clamped: volume != requested,
    }
}

/// Translator bound to the configured symbol and lot rules.
#[derive(Debug, Clone)]
pub struct Translator {
    symbols: SymbolConfig,
    lots: LotConfig,
    copy_stop_take_profit: bool,
}

/// Translated order plus the sizing details callers log.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub order: TranslatedOrder,
    pub volume: VolumeTranslation,
}

impl Translator {
    pub fn new(symbols: SymbolConfig, lots: LotConfig, copy_stop_take_profit: bool) -> Self {
        Self {
            symbols,
            lots,
            copy_stop_take_profit,
        }
    }

    pub fn copies_stop_take_profit(&self) -> bool {
        self.copy_stop_take_profit
    }

    pub fn symbol(&self, raw: &str) -> Result<String, TranslationError> {
        translate_symbol(
            raw,
            &self.symbols.overrides,
            &self.symbols.suffixes,
            &self.symbols.allowed,
        )
    }

    pub fn volume(&self, source_volume: Decimal) -> VolumeTranslation {
        translate_volume(
            source_volume,
            self.lots.mode,
            self.lots.multiplier,
            self.lots.min_lot,
            self.lots.max_lot,
            self.lots.precision,
        )
    }

    /// Stop/take-profit to put on a replica, if copying is enabled.
    pub fn protection(&self, position: &SourcePosition) -> (Option<Decimal>, Option<Decimal>) {
        if self.copy_stop_take_profit {
            (position.stop_loss, position.take_profit)
        } else {
            (None, None)
        }
    }

    pub fn translate(&self, position: &SourcePosition) -> Result<Translation, TranslationError> {
        let destination_symbol = self.symbol(&position.symbol)?;
        let volume = self.volume(position.volume);
        let (stop_loss, take_profit) = self.protection(position);

        Ok(Translation {
            order: TranslatedOrder {
                source_position_id: position.position_id.clone(),
                destination_symbol,
                destination_volume: volume.volume,
                direction: position.direction,
                stop_loss,
                take_profit,
            },
            volume,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn no_overrides() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn test_proportional_clamps_to_max() {
        let t = translate_volume(
            dec!(1.0),
            LotMode::Proportional,
            dec!(2.0),
            dec!(0.01),
            dec!(1.5),
            2,
        );
        assert_eq!(t.volume, dec!(1.5));
        assert_eq!(t.requested, dec!(2.0));
        assert!(t.clamped);
    }

    #[test]
    fn test_fixed_ignores_source_volume() {
        let t = translate_volume(
            dec!(0.01),
            LotMode::Fixed,
            dec!(0.5),
            dec!(0.01),
            dec!(10.0),
            2,
        );
        assert_eq!(t.volume, dec!(0.5));
        assert!(!t.clamped);
    }

    #[test]
    fn test_proportional_clamps_to_min_and_rounds() {
        let t = translate_volume(
            dec!(0.01),
            LotMode::Proportional,
            dec!(0.3),
            dec!(0.01),
            dec!(10),
            2,
        );
        // 0.003 rounds to 0.00, then saturates at the floor
        assert_eq!(t.volume, dec!(0.01));
        assert!(t.clamped);

        let t = translate_volume(
            dec!(1.0),
            LotMode::Proportional,
            dec!(0.333),
            dec!(0.01),
            dec!(10),
            2,
        );
        assert_eq!(t.volume, dec!(0.33));
        assert!(!t.clamped);
    }

    #[test]
    fn test_suffix_stripped() {
        let suffixes = vec![".z".to_string()];
        let symbol = translate_symbol("EURUSD.z", &no_overrides(), &suffixes, &HashSet::new());
        assert_eq!(symbol.unwrap(), "EURUSD");

        let symbol = translate_symbol("EURUSD.Z", &no_overrides(), &suffixes, &HashSet::new());
        assert_eq!(symbol.unwrap(), "EURUSD");

        let symbol = translate_symbol("GBPUSD", &no_overrides(), &suffixes, &HashSet::new());
        assert_eq!(symbol.unwrap(), "GBPUSD");
    }

    #[test]
    fn test_override_wins_over_suffix() {
        let overrides = HashMap::from([("XAUUSD".to_string(), "GOLD".to_string())]);
        let suffixes = vec!["USD".to_string()];

        let symbol = translate_symbol("XAUUSD", &overrides, &suffixes, &HashSet::new());
        assert_eq!(symbol.unwrap(), "GOLD");
    }

    #[test]
    fn test_override_on_stripped_symbol() {
        let overrides = HashMap::from([("XAUUSD".to_string(), "GOLD".to_string())]);
        let suffixes = vec![".z".to_string()];

        let symbol = translate_symbol("XAUUSD.z", &overrides, &suffixes, &HashSet::new());
        assert_eq!(symbol.unwrap(), "GOLD");
    }

    #[test]
    fn test_allowed_set_enforced() {
        let allowed = HashSet::from(["EURUSD".to_string()]);
        let suffixes = vec![".z".to_string()];

        assert!(translate_symbol("EURUSD.z", &no_overrides(), &suffixes, &allowed).is_ok());

        let err = translate_symbol("BTCUSD.z", &no_overrides(), &suffixes, &allowed).unwrap_err();
        assert_eq!(
            err,
            TranslationError::UnsupportedSymbol {
                raw: "BTCUSD.z".into(),
                translated: "BTCUSD".into()
            }
        );
    }

    #[test]
    fn test_translate_is_deterministic() {
        let translator = Translator::new(
            SymbolConfig {
                overrides: HashMap::new(),
                suffixes: vec![".z".to_string()],
                allowed: HashSet::new(),
            },
            LotConfig::default(),
            false,
        );
        let position = SourcePosition {
            position_id: "P1".into(),
            symbol: "EURUSD.z".into(),
            direction: Direction::Buy,
            volume: dec!(1.0),
            open_price: dec!(1.08),
            stop_loss: Some(dec!(1.07)),
            take_profit: Some(dec!(1.10)),
            open_time: Utc::now(),
        };

        let first = translator.translate(&position).unwrap();
        let second = translator.translate(&position).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.order.destination_symbol, "EURUSD");
        assert_eq!(first.order.destination_volume, dec!(1.0));
        // Protection not copied when disabled
        assert_eq!(first.order.stop_loss, None);
        assert_eq!(first.order.take_profit, None);
    }
}
