//! Clipped-surrogate policy update over one finished trajectory.

use super::network::{PolicyValueNet, Upstream};
use super::optimizer::Adam;
use crate::config::AgentCfg;
use crate::error::AgentError;
use crate::types::Experience;

#[derive(Debug, Clone, Copy)]
pub struct PpoParams {
    pub gamma: f32,
    pub gae_lambda: f32,
    pub clip_epsilon: f32,
    pub epochs: usize,
    pub value_coef: f32,
    pub entropy_coef: f32,
    pub advantage_epsilon: f32,
}

impl PpoParams {
    pub fn from_cfg(cfg: &AgentCfg) -> Self {
        Self {
            gamma: cfg.gamma,
            gae_lambda: cfg.gae_lambda,
            clip_epsilon: cfg.clip_epsilon,
            epochs: cfg.update_epochs,
            value_coef: cfg.value_coef,
            entropy_coef: cfg.entropy_coef,
            advantage_epsilon: cfg.advantage_epsilon,
        }
    }
}

impl Default for PpoParams {
    fn default() -> Self {
        Self::from_cfg(&AgentCfg::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearnReport {
    /// Mean loss of the last epoch, measured before its gradient step.
    pub final_loss: f32,
    pub epochs: usize,
    pub steps: usize,
}

/// Reverse-time generalised advantage estimation.
///
/// The bootstrap value, advantage and return all start at zero; `done[i]`
/// cuts the recursion at step `i`. Returns `(advantages, returns)`.
pub fn compute_gae(
    rewards: &[f32],
    values: &[f32],
    dones: &[bool],
    gamma: f32,
    lambda: f32,
) -> (Vec<f32>, Vec<f32>) {
    let n = rewards.len();
    let mut advantages = vec![0.0; n];
    let mut returns = vec![0.0; n];
    let mut last_value = 0.0;
    let mut last_advantage = 0.0;
    let mut last_return = 0.0;
    for i in (0..n).rev() {
        let mask = if dones[i] { 0.0 } else { 1.0 };
        let delta = rewards[i] + gamma * last_value * mask - values[i];
        last_advantage = delta + gamma * lambda * last_advantage * mask;
        advantages[i] = last_advantage;
        last_return = rewards[i] + gamma * last_return * mask;
        returns[i] = last_return;
        last_value = values[i];
    }
    (advantages, returns)
}

/// Shift to zero mean and scale by `1 / (std + eps)`, using the unbiased
/// standard deviation. A single-element slice has std 0 and becomes `[0.0]`.
pub fn normalize_advantages(advantages: &mut [f32], eps: f32) {
    let n = advantages.len();
    if n == 0 {
        return;
    }
    let mean = advantages.iter().sum::<f32>() / n as f32;
    let std = if n > 1 {
        let var = advantages.iter().map(|a| (a - mean).powi(2)).sum::<f32>() / (n - 1) as f32;
        var.sqrt()
    } else {
        0.0
    };
    for a in advantages.iter_mut() {
        *a = (*a - mean) / (std + eps);
    }
}

fn validate(net: &PolicyValueNet, trajectory: &[Experience]) -> Result<(), AgentError> {
    if trajectory.is_empty() {
        return Err(AgentError::InvalidExperience { step: 0, reason: "empty trajectory".into() });
    }
    let state_dim = net.dims().state_dim;
    for (step, exp) in trajectory.iter().enumerate() {
        if exp.state.len() != state_dim {
            return Err(AgentError::InvalidExperience {
                step,
                reason: format!("state has {} features, expected {state_dim}", exp.state.len()),
            });
        }
        net.check_action(&exp.action)
            .map_err(|reason| AgentError::InvalidExperience { step, reason })?;
        if !(exp.log_prob.is_finite() && exp.value.is_finite() && exp.reward.is_finite()) {
            return Err(AgentError::InvalidExperience {
                step,
                reason: "non-finite log_prob, value or reward".into(),
            });
        }
    }
    Ok(())
}

/// Run `params.epochs` full-batch updates over `trajectory`.
///
/// All work happens on copies of the network and optimizer; they replace
/// the originals only if every epoch stays finite. On error `net` and
/// `opt` are untouched.
pub fn learn(
    net: &mut PolicyValueNet,
    opt: &mut Adam,
    trajectory: &[Experience],
    params: &PpoParams,
) -> Result<LearnReport, AgentError> {
    validate(net, trajectory)?;

    let rewards: Vec<f32> = trajectory.iter().map(|e| e.reward).collect();
    let values: Vec<f32> = trajectory.iter().map(|e| e.value).collect();
    let dones: Vec<bool> = trajectory.iter().map(|e| e.done).collect();
    let (mut advantages, returns) =
        compute_gae(&rewards, &values, &dones, params.gamma, params.gae_lambda);
    normalize_advantages(&mut advantages, params.advantage_epsilon);

    let n = trajectory.len() as f32;
    let lo = 1.0 - params.clip_epsilon;
    let hi = 1.0 + params.clip_epsilon;

    let mut work = net.clone();
    let mut work_opt = opt.clone();
    let mut final_loss = 0.0;

    for epoch in 0..params.epochs {
        let mut grads = PolicyValueNet::zeros(work.dims());
        let mut loss_sum = 0.0;

        for (i, exp) in trajectory.iter().enumerate() {
            let cache = work.forward_cached(exp.state.as_slice())?;
            let out = &cache.output;
            let log_prob = out.joint_log_prob(&exp.action);
            let entropy = out.entropy().total();
            let value = out.value;

            let a = advantages[i];
            let ratio = (log_prob - exp.log_prob).exp();
            let surr1 = ratio * a;
            let surr2 = ratio.clamp(lo, hi) * a;
            let value_err = value - returns[i];
            loss_sum += -surr1.min(surr2) + params.value_coef * value_err * value_err
                - params.entropy_coef * entropy;

            // d(−min(surr1, surr2))/d logπ: the clipped branch has zero slope outside [lo, hi].
            let unclipped = surr1 <= surr2 || (lo..=hi).contains(&ratio);
            let d_policy = if unclipped { -a * ratio } else { 0.0 };
            let up = Upstream {
                d_log_prob: d_policy / n,
                d_entropy: -params.entropy_coef / n,
                d_value: params.value_coef * 2.0 * value_err / n,
            };
            work.backward(&cache, &exp.action, up, &mut grads);
        }

        let loss = loss_sum / n;
        let grad_flat = grads.to_flat();
        if !loss.is_finite() || grad_flat.iter().any(|g| !g.is_finite()) {
            return Err(AgentError::Numerical(format!("non-finite loss or gradient in epoch {epoch}")));
        }

        let mut flat = work.to_flat();
        work_opt.step(&mut flat, &grad_flat)?;
        if flat.iter().any(|w| !w.is_finite()) {
            return Err(AgentError::Numerical(format!("non-finite weights after epoch {epoch}")));
        }
        work.load_flat(&flat)?;
        final_loss = loss;
        tracing::debug!(epoch, loss, "policy epoch");
    }

    *net = work;
    *opt = work_opt;
    tracing::info!(steps = trajectory.len(), epochs = params.epochs, final_loss, "policy updated");
    Ok(LearnReport { final_loss, epochs: params.epochs, steps: trajectory.len() })
}
