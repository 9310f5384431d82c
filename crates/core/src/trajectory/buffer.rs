use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::policy::LearnReport;
use crate::types::{Emotion, Experience};

/// Learning backend a buffer hands finished trajectories to.
pub trait PolicyTrainer: Send + Sync {
    fn train(&self, trajectory: &[Experience]) -> Result<LearnReport, AgentError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Threshold,
    Feedback,
}

impl FlushReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Feedback => "feedback",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Still accumulating.
    Pending { len: usize },
    Learned { reason: FlushReason, report: LearnReport },
    /// Learning failed; the trajectory was discarded anyway.
    Dropped { reason: FlushReason, error: String },
}

/// Per-session experience log.
///
/// `empty → accumulating → (threshold | feedback) flush → empty`. Every
/// flush empties the buffer, whether or not learning succeeded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryBuffer {
    experiences: Vec<Experience>,
}

impl TrajectoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.experiences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiences.is_empty()
    }

    pub fn experiences(&self) -> &[Experience] {
        &self.experiences
    }

    pub fn last(&self) -> Option<&Experience> {
        self.experiences.last()
    }

    /// Credit the previous turn with the reward implied by the user's reaction.
    ///
    /// Only touches a last experience that is neither backfilled nor done;
    /// returns the reward applied, or `None` for a no-op.
    pub fn backfill(&mut self, emotion: Emotion) -> Option<f32> {
        let last = self.experiences.last_mut()?;
        if last.backfilled || last.done {
            return None;
        }
        last.reward = emotion.implicit_reward();
        last.backfilled = true;
        Some(last.reward)
    }

    /// Append, evicting the oldest entry once `cap` is reached.
    pub fn push(&mut self, experience: Experience, cap: usize) {
        if cap > 0 && self.experiences.len() >= cap {
            let excess = self.experiences.len() + 1 - cap;
            tracing::warn!(cap, excess, "trajectory cap reached, evicting oldest experiences");
            self.experiences.drain(..excess);
        }
        self.experiences.push(experience);
    }

    pub fn should_flush(&self, threshold: usize) -> bool {
        self.experiences.len() >= threshold
    }

    /// Overwrite the last reward and mark the episode terminal.
    /// Rejects non-finite rewards and empty buffers without mutating anything.
    pub fn apply_feedback(&mut self, reward: f32) -> Result<(), AgentError> {
        if !reward.is_finite() {
            return Err(AgentError::FeedbackRejected(format!("reward {reward} is not finite")));
        }
        let last = self
            .experiences
            .last_mut()
            .ok_or_else(|| AgentError::FeedbackRejected("no pending experience".into()))?;
        last.reward = reward;
        last.done = true;
        last.backfilled = true;
        Ok(())
    }

    /// Train on everything buffered, then empty the buffer.
    pub fn flush(&mut self, trainer: &dyn PolicyTrainer, reason: FlushReason) -> FlushOutcome {
        let trajectory = std::mem::take(&mut self.experiences);
        match trainer.train(&trajectory) {
            Ok(report) => {
                tracing::info!(
                    reason = reason.as_str(),
                    steps = report.steps,
                    final_loss = report.final_loss,
                    "trajectory flushed"
                );
                FlushOutcome::Learned { reason, report }
            }
            Err(e) => {
                tracing::warn!(reason = reason.as_str(), steps = trajectory.len(), error = %e, "learning failed, trajectory dropped");
                FlushOutcome::Dropped { reason, error: e.to_string() }
            }
        }
    }

    /// Append a new decision and flush if the threshold is reached.
    pub fn record(
        &mut self,
        experience: Experience,
        threshold: usize,
        cap: usize,
        trainer: &dyn PolicyTrainer,
    ) -> FlushOutcome {
        self.push(experience, cap);
        if self.should_flush(threshold) {
            self.flush(trainer, FlushReason::Threshold)
        } else {
            FlushOutcome::Pending { len: self.len() }
        }
    }

    /// Explicit user rating: terminal reward on the last turn and an immediate update.
    pub fn feedback(&mut self, reward: f32, trainer: &dyn PolicyTrainer) -> Result<FlushOutcome, AgentError> {
        self.apply_feedback(reward)?;
        Ok(self.flush(trainer, FlushReason::Feedback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionRecord, StateVector};
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTrainer {
        calls: Mutex<Vec<Vec<Experience>>>,
        fail: bool,
    }

    impl PolicyTrainer for RecordingTrainer {
        fn train(&self, trajectory: &[Experience]) -> Result<LearnReport, AgentError> {
            self.calls.lock().push(trajectory.to_vec());
            if self.fail {
                return Err(AgentError::Numerical("nan".into()));
            }
            Ok(LearnReport { final_loss: 0.1, epochs: 4, steps: trajectory.len() })
        }
    }

    fn exp(tag: f32) -> Experience {
        Experience {
            state: StateVector(vec![tag]),
            action: ActionRecord { persona: 0, context_flags: vec![false; 7], special: 0 },
            log_prob: -2.0,
            value: 0.0,
            reward: 0.0,
            done: false,
            backfilled: false,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn backfill_applies_once() {
        let mut buf = TrajectoryBuffer::new();
        assert_eq!(buf.backfill(Emotion::Happiness), None);

        buf.push(exp(0.0), 64);
        assert_eq!(buf.backfill(Emotion::Disgust), Some(-0.5));
        assert_eq!(buf.backfill(Emotion::Happiness), None);
        assert_eq!(buf.last().unwrap().reward, -0.5);
    }

    #[test]
    fn backfill_skips_terminal_experience() {
        let mut buf = TrajectoryBuffer::new();
        buf.push(exp(0.0), 64);
        buf.apply_feedback(1.0).unwrap();
        assert_eq!(buf.backfill(Emotion::Anger), None);
        assert_eq!(buf.last().unwrap().reward, 1.0);
    }

    #[test]
    fn fifth_experience_triggers_one_learn_call() {
        let trainer = RecordingTrainer::default();
        let mut buf = TrajectoryBuffer::new();
        for i in 0..4 {
            let out = buf.record(exp(i as f32), 5, 64, &trainer);
            assert_eq!(out, FlushOutcome::Pending { len: i + 1 });
        }
        assert!(trainer.calls.lock().is_empty());

        let out = buf.record(exp(4.0), 5, 64, &trainer);
        assert!(matches!(out, FlushOutcome::Learned { reason: FlushReason::Threshold, .. }));
        let calls = trainer.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 5);
        assert!(buf.is_empty());
    }

    #[test]
    fn feedback_marks_done_and_flushes() {
        let trainer = RecordingTrainer::default();
        let mut buf = TrajectoryBuffer::new();
        buf.push(exp(0.0), 64);
        buf.push(exp(1.0), 64);

        let out = buf.feedback(0.8, &trainer).unwrap();
        assert!(matches!(out, FlushOutcome::Learned { reason: FlushReason::Feedback, .. }));
        let calls = trainer.calls.lock();
        let last = calls[0].last().unwrap();
        assert_eq!(last.reward, 0.8);
        assert!(last.done);
        assert!(!calls[0][0].done);
        assert!(buf.is_empty());
    }

    #[test]
    fn malformed_feedback_is_rejected_without_mutation() {
        let trainer = RecordingTrainer::default();
        let mut buf = TrajectoryBuffer::new();
        assert!(matches!(buf.feedback(1.0, &trainer), Err(AgentError::FeedbackRejected(_))));

        buf.push(exp(0.0), 64);
        let before = buf.clone();
        assert!(buf.feedback(f32::NAN, &trainer).is_err());
        assert!(buf.feedback(f32::INFINITY, &trainer).is_err());
        assert_eq!(buf, before);
        assert!(trainer.calls.lock().is_empty());
    }

    #[test]
    fn failed_learning_still_empties_the_buffer() {
        let trainer = RecordingTrainer { fail: true, ..Default::default() };
        let mut buf = TrajectoryBuffer::new();
        buf.push(exp(0.0), 64);
        let out = buf.feedback(-1.0, &trainer).unwrap();
        assert!(matches!(out, FlushOutcome::Dropped { reason: FlushReason::Feedback, .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn cap_evicts_oldest() {
        let mut buf = TrajectoryBuffer::new();
        for i in 0..5 {
            buf.push(exp(i as f32), 3);
        }
        let tags: Vec<f32> = buf.experiences().iter().map(|e| e.state.0[0]).collect();
        assert_eq!(tags, vec![2.0, 3.0, 4.0]);
    }
}
