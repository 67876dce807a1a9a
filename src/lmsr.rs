//! src/lmsr.rs
//! Numerically stable LMSR pricing over N-ary outcome quantity vectors,
//! plus the micro-unit conversions used at the settlement-service boundary.
//!
//! All functions here are pure and side-effect-free; the market manager owns
//! the mutation of stored quantity vectors.

use crate::errors::HubError;

/// 1 dollar = 1,000,000 micro-units on the settlement-service wire.
pub const MICRO_UNITS_PER_DOLLAR: i64 = 1_000_000;

/// Default liquidity parameter when no override and no pool-derived value.
pub const DEFAULT_LIQUIDITY_B: f64 = 100.0;

#[inline]
pub fn to_micro_units(dollars: f64) -> Result<i64, HubError> {
    if dollars.is_nan() || !dollars.is_finite() {
        return Err(HubError::Validation(format!(
            "non-finite amount cannot be converted to micro-units: {dollars}"
        )));
    }
    // round half-away-from-zero
    let scaled = dollars * MICRO_UNITS_PER_DOLLAR as f64;
    let rounded = if scaled >= 0.0 {
        (scaled + 0.5).floor()
    } else {
        (scaled - 0.5).ceil()
    };
    Ok(rounded as i64)
}

#[inline]
pub fn from_micro_units(micro: i64) -> f64 {
    micro as f64 / MICRO_UNITS_PER_DOLLAR as f64
}

/// log(Σ exp(xᵢ)) with the max subtracted before exponentiation.
#[inline]
fn log_sum_exp(xs: &[f64]) -> f64 {
    let m = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if m == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    m + xs.iter().map(|x| (x - m).exp()).sum::<f64>().ln()
}

fn check_inputs(quantities: &[f64], b: f64) -> Result<(), HubError> {
    if !(b.is_finite() && b > 0.0) {
        return Err(HubError::Validation(format!(
            "liquidity parameter b must be positive and finite, got {b}"
        )));
    }
    if quantities.len() < 2 {
        return Err(HubError::Validation(format!(
            "quantity vector needs at least 2 outcomes, got {}",
            quantities.len()
        )));
    }
    if quantities.iter().any(|q| !q.is_finite()) {
        return Err(HubError::Validation("quantities must be finite".into()));
    }
    Ok(())
}

/// LMSR cost function C(q, b) = b · ln(Σ exp(qᵢ / b)).
pub fn cost(quantities: &[f64], b: f64) -> Result<f64, HubError> {
    check_inputs(quantities, b)?;
    let exponents: Vec<f64> = quantities.iter().map(|q| q / b).collect();
    Ok(b * log_sum_exp(&exponents))
}

/// Price vector pᵢ = exp(qᵢ/b) / Σ exp(qⱼ/b). Strictly inside (0, 1),
/// sums to 1 within floating tolerance.
pub fn prices(quantities: &[f64], b: f64) -> Result<Vec<f64>, HubError> {
    check_inputs(quantities, b)?;
    let exponents: Vec<f64> = quantities.iter().map(|q| q / b).collect();
    let m = exponents.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let shifted: Vec<f64> = exponents.iter().map(|x| (x - m).exp()).collect();
    let denom: f64 = shifted.iter().sum();
    Ok(shifted.iter().map(|e| e / denom).collect())
}

/// Shares `s` bought on outcome `i` for `amount`, from the closed form
///   s = b·ln(exp(a/b)·Σⱼ exp(qⱼ/b) − Σⱼ≠ᵢ exp(qⱼ/b)) − qᵢ
/// computed in the log domain so large quantity vectors do not overflow.
pub fn shares_for_amount(
    quantities: &[f64],
    b: f64,
    outcome: usize,
    amount: f64,
) -> Result<f64, HubError> {
    check_inputs(quantities, b)?;
    if outcome >= quantities.len() {
        return Err(HubError::Validation(format!(
            "outcome index {outcome} out of range for {} outcomes",
            quantities.len()
        )));
    }
    if !(amount.is_finite() && amount > 0.0) {
        return Err(HubError::Validation(format!(
            "bet amount must be positive, got {amount}"
        )));
    }

    let exponents: Vec<f64> = quantities.iter().map(|q| q / b).collect();
    let lse_all = log_sum_exp(&exponents);
    let others: Vec<f64> = exponents
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != outcome)
        .map(|(_, x)| *x)
        .collect();
    let lse_others = log_sum_exp(&others);

    // ln(exp(a/b + lse_all) - exp(lse_others)), stable form:
    //   big + ln(1 - exp(lse_others - big))   where big = a/b + lse_all.
    let big = amount / b + lse_all;
    let diff = lse_others - big;
    // diff < 0 always holds mathematically (a > 0), but rounding can push the
    // inner term to <= 0 for tiny amounts on lopsided books.
    let inner = 1.0 - diff.exp();
    if inner <= 0.0 {
        return Err(HubError::PriceInfeasible(format!(
            "bet of {amount} on outcome {outcome} is numerically infeasible"
        )));
    }
    let shares = b * (big + inner.ln()) - quantities[outcome];
    if !shares.is_finite() || shares <= 0.0 {
        return Err(HubError::PriceInfeasible(format!(
            "share computation produced {shares} for amount {amount}"
        )));
    }
    Ok(shares)
}

/// Exact cost of buying `s` shares on outcome `i`: C(q + s·eᵢ) − C(q).
/// Used as the oracle in property tests and by round-trip checks.
pub fn cost_delta(quantities: &[f64], b: f64, outcome: usize, shares: f64) -> Result<f64, HubError> {
    let before = cost(quantities, b)?;
    let mut after_q = quantities.to_vec();
    after_q[outcome] += shares;
    let after = cost(&after_q, b)?;
    Ok(after - before)
}

/// Post-trade quantity vector q' = q + s·eᵢ.
pub fn apply_purchase(quantities: &[f64], outcome: usize, shares: f64) -> Vec<f64> {
    let mut next = quantities.to_vec();
    next[outcome] += shares;
    next
}
