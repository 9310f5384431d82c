use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Adam over a flat parameter vector. Moment estimates are checkpointed
/// with the weights so a restart resumes the same optimisation trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    step: u64,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Adam {
    pub fn new(param_count: usize, lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step: 0,
            m: vec![0.0; param_count],
            v: vec![0.0; param_count],
        }
    }

    pub fn steps_taken(&self) -> u64 {
        self.step
    }

    pub fn param_count(&self) -> usize {
        self.m.len()
    }

    /// Both moment vectors must cover exactly `param_count` parameters.
    pub fn check_shape(&self, param_count: usize) -> Result<(), AgentError> {
        if self.m.len() != param_count || self.v.len() != param_count {
            return Err(AgentError::ShapeMismatch(format!(
                "optimizer moments are {}/{} long, network has {param_count} parameters",
                self.m.len(),
                self.v.len()
            )));
        }
        Ok(())
    }

    /// One bias-corrected update, `params -= lr · m̂ / (√v̂ + eps)`.
    pub fn step(&mut self, params: &mut [f32], grads: &[f32]) -> Result<(), AgentError> {
        self.check_shape(params.len())?;
        if grads.len() != params.len() {
            return Err(AgentError::ShapeMismatch(format!(
                "{} params but {} grads",
                params.len(),
                grads.len()
            )));
        }
        self.step += 1;
        let t = self.step as i32;
        let bc1 = 1.0 - self.beta1.powi(t);
        let bc2 = 1.0 - self.beta2.powi(t);

        for i in 0..params.len() {
            let g = grads[i];
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * g;
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = self.m[i] / bc1;
            let v_hat = self.v[i] / bc2;
            params[i] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
        }
        Ok(())
    }
}
