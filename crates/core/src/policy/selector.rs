//! Confidence-gated sampling from the network's three action heads.

use rand::Rng;

use super::distribution::{mask_and_renormalize, sample_bernoulli, sample_categorical};
use super::network::PolicyOutput;
use crate::config::AgentCfg;
use crate::error::AgentError;
use crate::persona::PersonaRenderer;
use crate::types::{
    ActionDecision, ActionRecord, ContextSource, Persona, QUESTIONER, SpecialAction, StateVector,
    UserProfile,
};

#[derive(Debug, Clone, Copy)]
pub struct GateParams {
    pub entropy_weight: f32,
    pub threshold: f32,
    pub mask_floor: f32,
}

impl GateParams {
    pub fn from_cfg(cfg: &AgentCfg) -> Self {
        Self {
            entropy_weight: cfg.confidence_entropy_weight,
            threshold: cfg.confidence_threshold,
            mask_floor: cfg.mask_floor,
        }
    }
}

impl Default for GateParams {
    fn default() -> Self {
        Self::from_cfg(&AgentCfg::default())
    }
}

/// Raw sample plus the numbers training needs.
#[derive(Debug, Clone)]
pub struct SampledAction {
    pub action: ActionRecord,
    pub log_prob: f32,
    pub value: f32,
    pub confidence: f32,
    pub forced_question: bool,
}

/// `value − weight × (H_persona + ΣH_context + H_special)`.
pub fn confidence(output: &PolicyOutput, entropy_weight: f32) -> f32 {
    output.value - entropy_weight * output.entropy().total()
}

/// Sample a full action.
///
/// Below the confidence threshold the special action is forced to
/// ask-question and its log-probability comes from the unmasked special
/// distribution. Otherwise ask-question is masked out and the special action
/// is sampled, and scored, under the renormalised distribution. Persona and
/// context are sampled in both cases.
pub fn select<R: Rng + ?Sized>(
    output: &PolicyOutput,
    gate: &GateParams,
    rng: &mut R,
) -> Result<SampledAction, AgentError> {
    let confidence = confidence(output, gate.entropy_weight);
    let ask = SpecialAction::AskQuestion.index();
    let forced_question = confidence < gate.threshold;

    let persona = sample_categorical(&output.persona_probs(), rng)?;
    let context_probs = output.context_probs();
    let mut context_flags = Vec::with_capacity(context_probs.len());
    for &p in context_probs.iter() {
        context_flags.push(sample_bernoulli(p, rng)?);
    }

    let (special, special_log_prob) = if forced_question {
        (ask, output.special_log_prob(ask))
    } else {
        let masked = mask_and_renormalize(&output.special_probs(), ask, gate.mask_floor);
        let s = sample_categorical(&masked, rng)?;
        (s, masked[s].ln())
    };

    let log_prob =
        output.persona_log_prob(persona) + output.context_log_prob(&context_flags) + special_log_prob;

    Ok(SampledAction {
        action: ActionRecord { persona, context_flags, special },
        log_prob,
        value: output.value,
        confidence,
        forced_question,
    })
}

/// Map a sampled action onto persona text and context sources.
///
/// Ask-question short-circuits to the `QUESTIONER` sentinel with an empty
/// prompt and no contexts; the renderer is not called. With an image
/// attached, vector search is dropped from the context list.
pub fn resolve(
    sampled: SampledAction,
    state: StateVector,
    renderer: &dyn PersonaRenderer,
    user: &UserProfile,
    has_image: bool,
) -> Result<ActionDecision, AgentError> {
    let (persona_name, persona_prompt, context_sources) = if sampled.action.is_ask_question() {
        (QUESTIONER.to_owned(), String::new(), Vec::new())
    } else {
        let persona = Persona::from_index(sampled.action.persona).ok_or_else(|| {
            AgentError::ShapeMismatch(format!("persona index {}", sampled.action.persona))
        })?;
        let prompt = renderer.render(persona, user)?;
        let sources: Vec<ContextSource> = ContextSource::ALL
            .iter()
            .zip(&sampled.action.context_flags)
            .filter(|(_, on)| **on)
            .map(|(c, _)| *c)
            .filter(|c| !(has_image && *c == ContextSource::VectorSearch))
            .collect();
        (persona.name().to_owned(), prompt, sources)
    };

    Ok(ActionDecision {
        persona_name,
        persona_prompt,
        context_sources,
        confidence: sampled.confidence,
        forced_question: sampled.forced_question,
        action: sampled.action,
        log_prob: sampled.log_prob,
        value: sampled.value,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::network::{NetworkDims, PolicyValueNet};
    use ndarray::Array1;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRenderer(AtomicUsize);

    impl PersonaRenderer for CountingRenderer {
        fn render(&self, persona: Persona, _user: &UserProfile) -> Result<String, AgentError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("be a {}", persona.name()))
        }
    }

    fn dims() -> NetworkDims {
        NetworkDims { state_dim: 64, hidden_dim: 128, persona_count: 6, context_count: 7, special_count: 2 }
    }

    fn state() -> StateVector {
        StateVector((0..64).map(|i| (i as f32 * 0.37).sin()).collect())
    }

    fn net_with_value_bias(bias: f32, seed: u64) -> PolicyValueNet {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut net = PolicyValueNet::new(dims(), &mut rng);
        net.value_head.weight.fill(0.0);
        net.value_head.bias[0] = bias;
        net
    }

    #[test]
    fn low_confidence_forces_a_question() {
        let net = net_with_value_bias(-100.0, 1);
        let out = net.forward(&state()).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let renderer = CountingRenderer(AtomicUsize::new(0));
        let user = UserProfile::new(1, "mina");

        for _ in 0..20 {
            let s = select(&out, &GateParams::default(), &mut rng).unwrap();
            assert!(s.forced_question);
            assert!(s.confidence < -0.5);
            assert_eq!(s.action.special, SpecialAction::AskQuestion.index());
            assert_eq!(s.action.context_flags.len(), 7);
            assert!(s.action.persona < 6);
            let expected = out.persona_log_prob(s.action.persona)
                + out.context_log_prob(&s.action.context_flags)
                + out.special_log_prob(1);
            assert!((s.log_prob - expected).abs() < 1e-4);

            let d = resolve(s, state(), &renderer, &user, false).unwrap();
            assert_eq!(d.persona_name, QUESTIONER);
            assert!(d.persona_prompt.is_empty());
            assert!(d.context_sources.is_empty());
        }
        assert_eq!(renderer.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn confident_policy_never_asks_even_when_the_head_prefers_it() {
        let mut net = net_with_value_bias(100.0, 3);
        net.special_head.weight.fill(0.0);
        net.special_head.bias = Array1::from(vec![-8.0, 8.0]);
        let out = net.forward(&state()).unwrap();
        assert!(out.special_probs()[1] > 0.99);

        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..200 {
            let s = select(&out, &GateParams::default(), &mut rng).unwrap();
            assert!(!s.forced_question);
            assert_eq!(s.action.special, SpecialAction::None.index());
            let expected = out.persona_log_prob(s.action.persona)
                + out.context_log_prob(&s.action.context_flags);
            assert!((s.log_prob - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn image_suppresses_vector_search() {
        let user = UserProfile::new(1, "mina");
        let renderer = CountingRenderer(AtomicUsize::new(0));
        let sampled = || SampledAction {
            action: ActionRecord { persona: 1, context_flags: vec![true, false, true, false, false, false, true], special: 0 },
            log_prob: -3.0,
            value: 0.1,
            confidence: 0.0,
            forced_question: false,
        };

        let with_image = resolve(sampled(), state(), &renderer, &user, true).unwrap();
        assert_eq!(with_image.context_sources, vec![ContextSource::Schedule, ContextSource::Relationship]);
        assert_eq!(with_image.persona_name, "Advisor");
        assert_eq!(with_image.persona_prompt, "be a Advisor");

        let without = resolve(sampled(), state(), &renderer, &user, false).unwrap();
        assert_eq!(
            without.context_sources,
            vec![ContextSource::Schedule, ContextSource::VectorSearch, ContextSource::Relationship]
        );
        assert_eq!(renderer.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn confidence_subtracts_weighted_entropy() {
        let net = net_with_value_bias(0.25, 5);
        let out = net.forward(&state()).unwrap();
        let c = confidence(&out, 0.01);
        assert!((c - (0.25 - 0.01 * out.entropy().total())).abs() < 1e-6);
    }
}
