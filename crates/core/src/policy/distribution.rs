//! Categorical and Bernoulli helpers over logits.
//!
//! Everything is computed from logits with max-subtraction / softplus so
//! log-probabilities and entropies stay finite for saturated heads.

use ndarray::Array1;
use rand::Rng;
use rand::distributions::{Bernoulli, Distribution, WeightedIndex};

use crate::error::AgentError;

pub fn log_softmax(logits: &Array1<f32>) -> Array1<f32> {
    let max = logits.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
    let shifted = logits.mapv(|x| x - max);
    let log_sum = shifted.mapv(f32::exp).sum().ln();
    shifted.mapv(|x| x - log_sum)
}

pub fn softmax(logits: &Array1<f32>) -> Array1<f32> {
    log_softmax(logits).mapv(f32::exp)
}

/// ln(1 + e^x) without overflow.
pub fn softplus(x: f32) -> f32 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Entropy of the categorical distribution given by `logits`.
pub fn categorical_entropy(logits: &Array1<f32>) -> f32 {
    let log_p = log_softmax(logits);
    -log_p.iter().map(|&lp| lp.exp() * lp).sum::<f32>()
}

/// Entropy of Bernoulli(sigmoid(logit)).
pub fn bernoulli_entropy(logit: f32) -> f32 {
    let p = sigmoid(logit);
    p * softplus(-logit) + (1.0 - p) * softplus(logit)
}

/// log P(flag) under Bernoulli(sigmoid(logit)).
pub fn bernoulli_log_prob(logit: f32, flag: bool) -> f32 {
    if flag { -softplus(-logit) } else { -softplus(logit) }
}

/// Zero out `masked` and renormalise the rest.
///
/// The divisor is floored at `floor`; if essentially all mass sat on the
/// masked entry the result falls back to a point mass on the first
/// remaining index, so the output is always a valid distribution.
pub fn mask_and_renormalize(probs: &Array1<f32>, masked: usize, floor: f32) -> Array1<f32> {
    let mut out = probs.clone();
    if let Some(p) = out.get_mut(masked) {
        *p = 0.0;
    }
    let total = out.sum();
    if total < floor {
        out.fill(0.0);
        if let Some(first) = (0..out.len()).find(|&i| i != masked) {
            out[first] = 1.0;
        }
        return out;
    }
    out.mapv_inplace(|p| p / total.max(floor));
    out
}

pub fn sample_categorical<R: Rng + ?Sized>(probs: &Array1<f32>, rng: &mut R) -> Result<usize, AgentError> {
    let dist = WeightedIndex::new(probs.iter().copied())
        .map_err(|e| AgentError::Sampling(format!("categorical: {e}")))?;
    Ok(dist.sample(rng))
}

pub fn sample_bernoulli<R: Rng + ?Sized>(p: f32, rng: &mut R) -> Result<bool, AgentError> {
    let dist = Bernoulli::new(f64::from(p))
        .map_err(|e| AgentError::Sampling(format!("bernoulli p={p}: {e}")))?;
    Ok(dist.sample(rng))
}
