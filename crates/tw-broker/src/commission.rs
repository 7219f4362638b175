use rust_decimal::Decimal;
use tw_types::ConfigError;

/// Pluggable fee schedule applied at fill time.
pub trait Commission: Send {
    fn calculate(&self, quantity: Decimal, price: Decimal) -> Decimal;

    /// Rough per-share rate, used when sizing max-quantity estimates.
    fn per_share_rate(&self) -> Decimal {
        Decimal::ZERO
    }
}

/// The default: no fees.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroCommission;

impl Commission for ZeroCommission {
    fn calculate(&self, _quantity: Decimal, _price: Decimal) -> Decimal {
        Decimal::ZERO
    }
}

/// Flat per-share fee with a minimum charge per fill.
#[derive(Debug, Clone, Copy)]
pub struct PerShareCommission {
    pub rate: Decimal,
    pub minimum: Decimal,
}

impl Default for PerShareCommission {
    fn default() -> Self {
        Self {
            rate: Decimal::new(1, 3),    // $0.001 per share
            minimum: Decimal::new(1, 0), // $1.00 minimum
        }
    }
}

impl Commission for PerShareCommission {
    fn calculate(&self, quantity: Decimal, price: Decimal) -> Decimal {
        let _ = price;
        (quantity.abs() * self.rate).max(self.minimum)
    }

    fn per_share_rate(&self) -> Decimal {
        self.rate
    }
}

/// Resolve the engine config's `broker` string to a fee schedule.
pub fn commission_for(name: &str) -> Result<Box<dyn Commission>, ConfigError> {
    match name {
        "zero-commission" => Ok(Box::new(ZeroCommission)),
        "per-share" => Ok(Box::new(PerShareCommission::default())),
        other => Err(ConfigError::UnknownBroker {
            name: other.to_string(),
        }),
    }
}
