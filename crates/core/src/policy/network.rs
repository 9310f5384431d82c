//! Shared-trunk actor-critic network.
//!
//! `state → Linear(D, H) → ReLU → {persona, context, special, value}` heads.
//! Persona and special heads are categorical (softmax), the context head is
//! one independent Bernoulli per source (sigmoid), value is a raw scalar.
//! Gradients are derived by hand; see `backward`.

use ndarray::Array1;
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::distribution::{
    bernoulli_entropy, bernoulli_log_prob, categorical_entropy, log_softmax, sigmoid, softmax,
};
use crate::config::AgentCfg;
use crate::error::AgentError;
use crate::types::{ActionRecord, ContextSource, Persona, SpecialAction, StateVector};

/// Construction-time shape of the network. Part of every checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDims {
    pub state_dim: usize,
    pub hidden_dim: usize,
    pub persona_count: usize,
    pub context_count: usize,
    pub special_count: usize,
}

impl NetworkDims {
    pub fn from_cfg(cfg: &AgentCfg) -> Self {
        Self {
            state_dim: cfg.state_dim(),
            hidden_dim: cfg.hidden_dim,
            persona_count: Persona::COUNT,
            context_count: ContextSource::COUNT,
            special_count: SpecialAction::COUNT,
        }
    }

    pub fn param_count(&self) -> usize {
        let h = self.hidden_dim;
        (self.state_dim + 1) * h
            + (h + 1) * self.persona_count
            + (h + 1) * self.context_count
            + (h + 1) * self.special_count
            + (h + 1)
    }
}

/// Dense layer, `y = W x + b` with `W: (out, in)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    /// Uniform(-1/sqrt(in), 1/sqrt(in)) for weights and bias.
    fn init<R: Rng + ?Sized>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (inputs as f32).sqrt();
        let weight = Array2::from_shape_fn((outputs, inputs), |_| rng.gen_range(-bound..bound));
        let bias = Array1::from_shape_fn(outputs, |_| rng.gen_range(-bound..bound));
        Self { weight, bias }
    }

    fn zeros(inputs: usize, outputs: usize) -> Self {
        Self {
            weight: Array2::zeros((outputs, inputs)),
            bias: Array1::zeros(outputs),
        }
    }

    fn forward(&self, x: &Array1<f32>) -> Array1<f32> {
        self.weight.dot(x) + &self.bias
    }

    /// Gradient accumulation: `W += g ⊗ x`, `b += g`.
    fn accumulate(&mut self, grad_out: &Array1<f32>, input: &Array1<f32>) {
        for (mut row, &g) in self.weight.rows_mut().into_iter().zip(grad_out.iter()) {
            row.scaled_add(g, input);
        }
        self.bias += grad_out;
    }

    fn len(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

/// Raw head outputs for one state. Probabilities are derived on demand.
#[derive(Debug, Clone)]
pub struct PolicyOutput {
    pub persona_logits: Array1<f32>,
    pub context_logits: Array1<f32>,
    pub special_logits: Array1<f32>,
    pub value: f32,
}

/// Entropy of each component distribution.
#[derive(Debug, Clone, Copy)]
pub struct EntropyBreakdown {
    pub persona: f32,
    /// Sum over all context Bernoullis.
    pub context: f32,
    pub special: f32,
}

impl EntropyBreakdown {
    pub fn total(&self) -> f32 {
        self.persona + self.context + self.special
    }
}

impl PolicyOutput {
    pub fn persona_probs(&self) -> Array1<f32> {
        softmax(&self.persona_logits)
    }

    pub fn context_probs(&self) -> Array1<f32> {
        self.context_logits.mapv(sigmoid)
    }

    pub fn special_probs(&self) -> Array1<f32> {
        softmax(&self.special_logits)
    }

    pub fn entropy(&self) -> EntropyBreakdown {
        EntropyBreakdown {
            persona: categorical_entropy(&self.persona_logits),
            context: self.context_logits.iter().map(|&l| bernoulli_entropy(l)).sum(),
            special: categorical_entropy(&self.special_logits),
        }
    }

    pub fn persona_log_prob(&self, index: usize) -> f32 {
        log_softmax(&self.persona_logits)[index]
    }

    /// Joint log-probability of a full context flag vector.
    pub fn context_log_prob(&self, flags: &[bool]) -> f32 {
        self.context_logits
            .iter()
            .zip(flags)
            .map(|(&l, &f)| bernoulli_log_prob(l, f))
            .sum()
    }

    /// Log-probability under the unmasked special-action distribution.
    pub fn special_log_prob(&self, index: usize) -> f32 {
        log_softmax(&self.special_logits)[index]
    }

    pub fn joint_log_prob(&self, action: &ActionRecord) -> f32 {
        self.persona_log_prob(action.persona)
            + self.context_log_prob(&action.context_flags)
            + self.special_log_prob(action.special)
    }
}

/// Re-evaluation of a stored action under current parameters.
#[derive(Debug, Clone, Copy)]
pub struct Evaluation {
    pub log_prob: f32,
    pub entropy: f32,
    pub value: f32,
}

/// Intermediate activations kept for the backward pass.
pub(crate) struct ForwardCache {
    input: Array1<f32>,
    pre_activation: Array1<f32>,
    hidden: Array1<f32>,
    pub(crate) output: PolicyOutput,
}

/// Loss derivatives with respect to the three per-sample quantities.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Upstream {
    pub d_log_prob: f32,
    pub d_entropy: f32,
    pub d_value: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyValueNet {
    dims: NetworkDims,
    pub(crate) shared: Linear,
    pub(crate) persona_head: Linear,
    pub(crate) context_head: Linear,
    pub(crate) special_head: Linear,
    pub(crate) value_head: Linear,
}

impl PolicyValueNet {
    pub fn new<R: Rng + ?Sized>(dims: NetworkDims, rng: &mut R) -> Self {
        let h = dims.hidden_dim;
        Self {
            dims,
            shared: Linear::init(dims.state_dim, h, rng),
            persona_head: Linear::init(h, dims.persona_count, rng),
            context_head: Linear::init(h, dims.context_count, rng),
            special_head: Linear::init(h, dims.special_count, rng),
            value_head: Linear::init(h, 1, rng),
        }
    }

    /// Same shape, all zeros. Used as a gradient accumulator.
    pub fn zeros(dims: NetworkDims) -> Self {
        let h = dims.hidden_dim;
        Self {
            dims,
            shared: Linear::zeros(dims.state_dim, h),
            persona_head: Linear::zeros(h, dims.persona_count),
            context_head: Linear::zeros(h, dims.context_count),
            special_head: Linear::zeros(h, dims.special_count),
            value_head: Linear::zeros(h, 1),
        }
    }

    pub fn dims(&self) -> NetworkDims {
        self.dims
    }

    fn layers(&self) -> [&Linear; 5] {
        [
            &self.shared,
            &self.persona_head,
            &self.context_head,
            &self.special_head,
            &self.value_head,
        ]
    }

    fn layers_mut(&mut self) -> [&mut Linear; 5] {
        [
            &mut self.shared,
            &mut self.persona_head,
            &mut self.context_head,
            &mut self.special_head,
            &mut self.value_head,
        ]
    }

    pub fn param_count(&self) -> usize {
        self.layers().iter().map(|l| l.len()).sum()
    }

    /// All parameters flattened layer by layer (weights row-major, then bias).
    pub fn to_flat(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(self.param_count());
        for layer in self.layers() {
            flat.extend(layer.weight.iter().copied());
            flat.extend(layer.bias.iter().copied());
        }
        flat
    }

    /// Inverse of `to_flat`. Fails without modifying anything on a length mismatch.
    pub fn load_flat(&mut self, flat: &[f32]) -> Result<(), AgentError> {
        let expected = self.param_count();
        if flat.len() != expected {
            return Err(AgentError::ShapeMismatch(format!(
                "network expects {expected} parameters, got {}",
                flat.len()
            )));
        }
        let mut values = flat.iter().copied();
        for layer in self.layers_mut() {
            for (w, v) in layer.weight.iter_mut().zip(values.by_ref()) {
                *w = v;
            }
            for (b, v) in layer.bias.iter_mut().zip(values.by_ref()) {
                *b = v;
            }
        }
        Ok(())
    }

    fn check_state(&self, state: &[f32]) -> Result<Array1<f32>, AgentError> {
        if state.len() != self.dims.state_dim {
            return Err(AgentError::ShapeMismatch(format!(
                "state has {} features, network expects {}",
                state.len(),
                self.dims.state_dim
            )));
        }
        Ok(Array1::from(state.to_vec()))
    }

    pub(crate) fn check_action(&self, action: &ActionRecord) -> Result<(), String> {
        if action.persona >= self.dims.persona_count {
            return Err(format!("persona index {} out of range", action.persona));
        }
        if action.context_flags.len() != self.dims.context_count {
            return Err(format!(
                "{} context flags, expected {}",
                action.context_flags.len(),
                self.dims.context_count
            ));
        }
        if action.special >= self.dims.special_count {
            return Err(format!("special index {} out of range", action.special));
        }
        Ok(())
    }

    pub(crate) fn forward_cached(&self, state: &[f32]) -> Result<ForwardCache, AgentError> {
        let input = self.check_state(state)?;
        let pre_activation = self.shared.forward(&input);
        let hidden = pre_activation.mapv(|z| z.max(0.0));
        let output = PolicyOutput {
            persona_logits: self.persona_head.forward(&hidden),
            context_logits: self.context_head.forward(&hidden),
            special_logits: self.special_head.forward(&hidden),
            value: self.value_head.forward(&hidden)[0],
        };
        Ok(ForwardCache { input, pre_activation, hidden, output })
    }

    /// Inference pass.
    pub fn forward(&self, state: &StateVector) -> Result<PolicyOutput, AgentError> {
        Ok(self.forward_cached(state.as_slice())?.output)
    }

    /// Joint log-probability, total entropy and value of a previously taken action.
    pub fn evaluate(&self, state: &StateVector, action: &ActionRecord) -> Result<Evaluation, AgentError> {
        self.check_action(action).map_err(AgentError::ShapeMismatch)?;
        let out = self.forward(state)?;
        Ok(Evaluation {
            log_prob: out.joint_log_prob(action),
            entropy: out.entropy().total(),
            value: out.value,
        })
    }

    /// Accumulate parameter gradients of
    /// `d_log_prob·logπ(a|s) + d_entropy·H(s) + d_value·V(s)` into `grads`.
    ///
    /// Categorical: ∂logp_a/∂l_k = 1[k=a] − p_k, ∂H/∂l_k = −p_k(log p_k + H).
    /// Bernoulli:   ∂logp/∂l = c − σ(l),      ∂H/∂l = −l·σ(l)(1 − σ(l)).
    pub(crate) fn backward(
        &self,
        cache: &ForwardCache,
        action: &ActionRecord,
        up: Upstream,
        grads: &mut PolicyValueNet,
    ) {
        let out = &cache.output;

        let g_persona = categorical_grad(&out.persona_logits, action.persona, up);
        let g_special = categorical_grad(&out.special_logits, action.special, up);
        let g_context = Array1::from_shape_fn(out.context_logits.len(), |j| {
            let l = out.context_logits[j];
            let s = sigmoid(l);
            let c = if action.context_flags[j] { 1.0 } else { 0.0 };
            up.d_log_prob * (c - s) + up.d_entropy * (-l * s * (1.0 - s))
        });
        let g_value = Array1::from_elem(1, up.d_value);

        grads.persona_head.accumulate(&g_persona, &cache.hidden);
        grads.context_head.accumulate(&g_context, &cache.hidden);
        grads.special_head.accumulate(&g_special, &cache.hidden);
        grads.value_head.accumulate(&g_value, &cache.hidden);

        let mut d_hidden = self.persona_head.weight.t().dot(&g_persona);
        d_hidden += &self.context_head.weight.t().dot(&g_context);
        d_hidden += &self.special_head.weight.t().dot(&g_special);
        d_hidden += &self.value_head.weight.t().dot(&g_value);

        let d_pre = Array1::from_shape_fn(d_hidden.len(), |k| {
            if cache.pre_activation[k] > 0.0 { d_hidden[k] } else { 0.0 }
        });
        grads.shared.accumulate(&d_pre, &cache.input);
    }
}

fn categorical_grad(logits: &Array1<f32>, taken: usize, up: Upstream) -> Array1<f32> {
    let log_p = log_softmax(logits);
    let p = log_p.mapv(f32::exp);
    let entropy = -p.iter().zip(log_p.iter()).map(|(&pk, &lk)| pk * lk).sum::<f32>();
    Array1::from_shape_fn(logits.len(), |k| {
        let indicator = if k == taken { 1.0 } else { 0.0 };
        up.d_log_prob * (indicator - p[k]) + up.d_entropy * (-p[k] * (log_p[k] + entropy))
    })
}
