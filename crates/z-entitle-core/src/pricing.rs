//! Price terms and tier math.
//!
//! All amounts are exact decimals in the plan's currency. Usage tiers are
//! expressed in raw feature units; the `amount` of a tier is the price of one
//! *billing unit* (for example $1 per 1000 tokens with `billing_units = 1000`).

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::calendar::Cadence;
use crate::ids::FeatureId;

/// Decimal places kept on money amounts that leave the engine as line items.
pub const MONEY_DECIMAL_PLACES: u32 = 2;

/// Round a money amount to [`MONEY_DECIMAL_PLACES`], half away from zero.
#[must_use]
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero)
}

/// Errors produced by tier math.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PricingError {
    /// A usage price with no tiers.
    #[error("usage price has no tiers")]
    NoTiers,

    /// Billing units must be strictly positive.
    #[error("billing units must be positive, got {0}")]
    InvalidBillingUnits(Decimal),

    /// Tier upper bounds must increase and only the last may be unbounded.
    #[error("tier bounds must be strictly increasing with only the last tier unbounded")]
    UnorderedTiers,
}

// ============================================================================
// Tiers
// ============================================================================

/// One usage tier.
///
/// `up_to` is inclusive; `None` means the tier is unbounded. On input a bound
/// of `-1` is accepted as the unbounded marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTier {
    /// Inclusive upper bound in raw units, or `None` for the last tier.
    #[serde(default, deserialize_with = "de_tier_bound")]
    pub up_to: Option<Decimal>,
    /// Price of one billing unit inside this tier.
    pub amount: Decimal,
}

impl UsageTier {
    /// A bounded tier.
    #[must_use]
    pub const fn up_to(up_to: Decimal, amount: Decimal) -> Self {
        Self {
            up_to: Some(up_to),
            amount,
        }
    }

    /// The unbounded last tier.
    #[must_use]
    pub const fn unbounded(amount: Decimal) -> Self {
        Self { up_to: None, amount }
    }
}

fn de_tier_bound<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<Decimal>::deserialize(deserializer)?;
    Ok(raw.filter(|bound| !bound.is_sign_negative()))
}

/// How a quantity is spread across tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierBehavior {
    /// Each tier charges only the slice of quantity that falls inside it.
    Graduated,
    /// The whole quantity is charged at the rate of the tier it lands in.
    Volume,
}

/// Round a quantity up to a whole number of billing units.
///
/// Non-positive quantities round to zero.
#[must_use]
pub fn round_to_billing_units(quantity: Decimal, billing_units: Decimal) -> Decimal {
    if quantity <= Decimal::ZERO || billing_units <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (quantity / billing_units).ceil() * billing_units
}

fn validate(tiers: &[UsageTier], billing_units: Decimal) -> Result<(), PricingError> {
    if tiers.is_empty() {
        return Err(PricingError::NoTiers);
    }
    if billing_units <= Decimal::ZERO {
        return Err(PricingError::InvalidBillingUnits(billing_units));
    }
    let mut previous: Option<Decimal> = None;
    for (index, tier) in tiers.iter().enumerate() {
        match tier.up_to {
            None if index + 1 != tiers.len() => return Err(PricingError::UnorderedTiers),
            None => {}
            Some(bound) => {
                if previous.is_some_and(|prev| bound <= prev) {
                    return Err(PricingError::UnorderedTiers);
                }
                previous = Some(bound);
            }
        }
    }
    Ok(())
}

/// Graduated tier amount for a non-negative quantity.
///
/// # Errors
///
/// Returns a [`PricingError`] if the tier list is empty or malformed.
pub fn graduated_amount(
    tiers: &[UsageTier],
    quantity: Decimal,
    billing_units: Decimal,
) -> Result<Decimal, PricingError> {
    validate(tiers, billing_units)?;
    let rounded = round_to_billing_units(quantity, billing_units);

    let mut total = Decimal::ZERO;
    let mut floor = Decimal::ZERO;
    for tier in tiers {
        if rounded <= floor {
            break;
        }
        let ceiling = tier.up_to.map_or(rounded, |bound| bound.min(rounded));
        let slice = ceiling - floor;
        if slice > Decimal::ZERO {
            total += slice * tier.amount / billing_units;
        }
        match tier.up_to {
            Some(bound) => floor = bound,
            None => break,
        }
    }
    Ok(total)
}

/// Volume tier amount for a non-negative quantity.
///
/// # Errors
///
/// Returns a [`PricingError`] if the tier list is empty or malformed.
pub fn volume_amount(
    tiers: &[UsageTier],
    quantity: Decimal,
    billing_units: Decimal,
) -> Result<Decimal, PricingError> {
    validate(tiers, billing_units)?;
    let rounded = round_to_billing_units(quantity, billing_units);

    let tier = tiers
        .iter()
        .find(|tier| tier.up_to.map_or(true, |bound| rounded <= bound))
        .or_else(|| tiers.last())
        .ok_or(PricingError::NoTiers)?;
    Ok(rounded * tier.amount / billing_units)
}

/// Price `quantity` across `tiers`.
///
/// A negative quantity prices its absolute value and negates the result when
/// `allow_negative` is set (usage credited back); otherwise it prices to zero.
///
/// # Errors
///
/// Returns a [`PricingError`] if the tier list is empty or malformed.
pub fn tiers_amount(
    tiers: &[UsageTier],
    behavior: TierBehavior,
    quantity: Decimal,
    billing_units: Decimal,
    allow_negative: bool,
) -> Result<Decimal, PricingError> {
    let price = |q: Decimal| match behavior {
        TierBehavior::Graduated => graduated_amount(tiers, q, billing_units),
        TierBehavior::Volume => volume_amount(tiers, q, billing_units),
    };
    if quantity.is_sign_negative() && !quantity.is_zero() {
        if !allow_negative {
            validate(tiers, billing_units)?;
            return Ok(Decimal::ZERO);
        }
        return price(quantity.abs()).map(|amount| -amount);
    }
    price(quantity)
}

// ============================================================================
// Price terms
// ============================================================================

/// How a usage price is collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageModel {
    /// Bought up front in whole billing units; becomes `purchased` quantity.
    Prepaid,
    /// Billed at cycle end for usage beyond the included quantity.
    Arrear,
    /// Seat-style: billed for the allocated quantity, prorated on change.
    Allocated,
}

/// The pricing shape of a price term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriceKind {
    /// Recurring base price.
    Fixed {
        /// Price per cycle.
        amount: Decimal,
        /// Billing cadence.
        cadence: Cadence,
    },
    /// Charged once on attach.
    OneOff {
        /// Price.
        amount: Decimal,
    },
    /// Tiered usage price for one feature.
    Usage {
        /// The metered feature.
        feature: FeatureId,
        /// Tier table; must not be empty.
        tiers: Vec<UsageTier>,
        /// Graduated or volume.
        tier_behavior: TierBehavior,
        /// Raw units per billing unit.
        billing_units: Decimal,
        /// Collection model.
        model: UsageModel,
        /// Billing cadence for arrear and allocated usage.
        cadence: Option<Cadence>,
    },
}

/// One price line of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTerm {
    /// Human-readable label used in line-item descriptions.
    pub label: String,
    /// Pricing shape.
    #[serde(flatten)]
    pub kind: PriceKind,
}

impl PriceTerm {
    /// A recurring fixed price.
    #[must_use]
    pub fn fixed(label: impl Into<String>, amount: Decimal, cadence: Cadence) -> Self {
        Self {
            label: label.into(),
            kind: PriceKind::Fixed { amount, cadence },
        }
    }

    /// A one-off price.
    #[must_use]
    pub fn one_off(label: impl Into<String>, amount: Decimal) -> Self {
        Self {
            label: label.into(),
            kind: PriceKind::OneOff { amount },
        }
    }

    /// A tiered usage price.
    #[must_use]
    pub fn usage(
        label: impl Into<String>,
        feature: FeatureId,
        tiers: Vec<UsageTier>,
        tier_behavior: TierBehavior,
        billing_units: Decimal,
        model: UsageModel,
        cadence: Option<Cadence>,
    ) -> Self {
        Self {
            label: label.into(),
            kind: PriceKind::Usage {
                feature,
                tiers,
                tier_behavior,
                billing_units,
                model,
                cadence,
            },
        }
    }

    /// The feature a usage price meters, if any.
    #[must_use]
    pub fn feature(&self) -> Option<&FeatureId> {
        match &self.kind {
            PriceKind::Usage { feature, .. } => Some(feature),
            PriceKind::Fixed { .. } | PriceKind::OneOff { .. } => None,
        }
    }

    /// The recurring cadence of this price, if it recurs.
    #[must_use]
    pub const fn cadence(&self) -> Option<Cadence> {
        match &self.kind {
            PriceKind::Fixed { cadence, .. } => Some(*cadence),
            PriceKind::Usage { cadence, .. } => *cadence,
            PriceKind::OneOff { .. } => None,
        }
    }

    /// True for a price that recurs every cycle.
    #[must_use]
    pub const fn is_recurring(&self) -> bool {
        self.cadence().is_some()
    }

    /// True for a usage price billed in arrears.
    #[must_use]
    pub fn is_arrear(&self) -> bool {
        matches!(
            self.kind,
            PriceKind::Usage {
                model: UsageModel::Arrear,
                ..
            }
        )
    }

    /// Fixed recurring price normalised to one month; zero for other kinds.
    #[must_use]
    pub fn monthly_amount(&self) -> Decimal {
        match &self.kind {
            PriceKind::Fixed { amount, cadence } => {
                let months = cadence.approx_months();
                if months.is_zero() {
                    Decimal::ZERO
                } else {
                    *amount / months
                }
            }
            PriceKind::OneOff { .. } | PriceKind::Usage { .. } => Decimal::ZERO,
        }
    }

    /// Charge for `quantity` units of a usage price.
    ///
    /// Fixed and one-off prices ignore the quantity and return their amount.
    ///
    /// # Errors
    ///
    /// Returns a [`PricingError`] if the tier table is malformed.
    pub fn charge_for(&self, quantity: Decimal) -> Result<Decimal, PricingError> {
        match &self.kind {
            PriceKind::Fixed { amount, .. } | PriceKind::OneOff { amount } => Ok(*amount),
            PriceKind::Usage {
                tiers,
                tier_behavior,
                billing_units,
                ..
            } => tiers_amount(tiers, *tier_behavior, quantity, *billing_units, true),
        }
    }
}
