use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use thiserror::Error;

pub const MIN_LOAN_AMOUNT: i64 = 10_000;
pub const MAX_LOAN_AMOUNT: i64 = 10_000_000;
pub const MIN_TENURE_MONTHS: u32 = 6;
pub const MAX_TENURE_MONTHS: u32 = 360;
const MAX_ANNUAL_RATE: i64 = 60;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LoanError {
    #[error("loan amount {amount} is outside 10000..=10000000")]
    AmountOutOfRange { amount: Decimal },
    #[error("tenure of {months} months is outside 6..=360")]
    TenureOutOfRange { months: u32 },
    #[error("annual interest rate {rate}% is not usable")]
    InvalidRate { rate: Decimal },
    #[error("instalment {emi} must be positive")]
    InvalidInstalment { emi: Decimal },
    #[error("principal {principal} must be positive")]
    InvalidPrincipal { principal: Decimal },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoanQuote {
    pub principal: Decimal,
    pub annual_rate: Decimal,
    pub tenure_months: u32,
    pub emi: Decimal,
    pub total_payable: Decimal,
    pub total_interest: Decimal,
}

/// Reducing-balance monthly instalment, rounded to paise. Product amount limits are
/// enforced by [`quote`], not here.
pub fn calculate_emi(
    principal: Decimal,
    annual_rate: Decimal,
    tenure_months: u32,
) -> Result<Decimal, LoanError> {
    if principal <= Decimal::ZERO {
        return Err(LoanError::InvalidPrincipal { principal });
    }
    check_terms(annual_rate, tenure_months)?;

    let rate = monthly_rate(annual_rate);
    if rate.is_zero() {
        return Ok(money(principal / Decimal::from(tenure_months)));
    }

    let growth = compound(rate, tenure_months);
    Ok(money(principal * rate * growth / (growth - Decimal::ONE)))
}

/// Largest principal whose instalment does not exceed `emi`.
pub fn max_principal_for_emi(
    emi: Decimal,
    annual_rate: Decimal,
    tenure_months: u32,
) -> Result<Decimal, LoanError> {
    if emi <= Decimal::ZERO {
        return Err(LoanError::InvalidInstalment { emi });
    }
    check_terms(annual_rate, tenure_months)?;

    let rate = monthly_rate(annual_rate);
    let principal = if rate.is_zero() {
        emi * Decimal::from(tenure_months)
    } else {
        let growth = compound(rate, tenure_months);
        emi * (growth - Decimal::ONE) / (rate * growth)
    };
    Ok(principal.round_dp_with_strategy(2, RoundingStrategy::ToZero))
}

pub fn quote(
    principal: Decimal,
    annual_rate: Decimal,
    tenure_months: u32,
) -> Result<LoanQuote, LoanError> {
    check_amount(principal)?;
    let emi = calculate_emi(principal, annual_rate, tenure_months)?;
    let total_payable = money(emi * Decimal::from(tenure_months));
    Ok(LoanQuote {
        principal,
        annual_rate,
        tenure_months,
        emi,
        total_payable,
        total_interest: total_payable - principal,
    })
}

pub fn check_amount(amount: Decimal) -> Result<(), LoanError> {
    if amount < Decimal::from(MIN_LOAN_AMOUNT) || amount > Decimal::from(MAX_LOAN_AMOUNT) {
        return Err(LoanError::AmountOutOfRange { amount });
    }
    Ok(())
}

pub fn decimal_from_f64(value: f64) -> Option<Decimal> {
    Decimal::from_f64(value)
}

pub fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn check_terms(annual_rate: Decimal, tenure_months: u32) -> Result<(), LoanError> {
    if !(MIN_TENURE_MONTHS..=MAX_TENURE_MONTHS).contains(&tenure_months) {
        return Err(LoanError::TenureOutOfRange { months: tenure_months });
    }
    if annual_rate < Decimal::ZERO || annual_rate > Decimal::from(MAX_ANNUAL_RATE) {
        return Err(LoanError::InvalidRate { rate: annual_rate });
    }
    Ok(())
}

fn monthly_rate(annual_rate: Decimal) -> Decimal {
    annual_rate / Decimal::from(1200)
}

fn compound(rate: Decimal, periods: u32) -> Decimal {
    let base = Decimal::ONE + rate;
    (0..periods).fold(Decimal::ONE, |acc, _| acc * base)
}

fn money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
