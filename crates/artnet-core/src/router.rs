//! Question/answer sequencing on the controller.
//!
//! The controller never plays audio itself; it decides which file the swarm
//! should hear next and floods the path. Players play whatever path they
//! receive and flood `eof_mp3:` when done, which is what moves the
//! controller along.
//!
//! # Transitions
//!
//! ```text
//!            advance (any mode)
//!   ┌──────────────────────────────────────────────┐
//!   ▼                                              │
//! Start ──advance──▶ Question ──eof──▶ Answer ──eof, chaos > 2──▶ Start
//!                    /NN-question.mp3  /NN-answer.mp3
//!                                        │
//!                                        └─eof, chaos ≤ 2──▶ Answer (wait for button)
//! ```
//!
//! An advance always jumps back to `Start` and immediately runs the `Start`
//! step, so pressing the button mid-sequence skips straight to the next
//! question. `Pause` exists for an inter-segment rest that nothing enters
//! yet; an `eof_mp3` there, or in `Start`, changes nothing.
//!
//! Losing an `eof_mp3` stalls the sequence until someone presses the button.
//! There is no timeout.

use std::fmt;

use rand::Rng;
use tracing::{debug, info};

use crate::chaos::ChaosLevel;
use crate::message::Message;
use crate::QUESTION_COUNT;

/// Where the controller is in the question/answer sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PlaybackMode {
    /// Waiting for the button.
    #[default]
    Start,
    /// A question is playing somewhere in the swarm.
    Question,
    /// Reserved for a rest between segments.
    Pause,
    /// An answer is playing, or has played and the button is awaited.
    Answer,
}

impl PlaybackMode {
    /// Name used in track file names.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Question => "question",
            Self::Pause => "pause",
            Self::Answer => "answer",
        }
    }
}

impl fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What can move the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterEvent {
    /// The controller's "next" button.
    Advance,
    /// An `eof_mp3` broadcast from any player.
    PlaybackFinished,
}

/// Advance the question cursor: 1, 2, …, 26, 1, …
pub const fn next_question(current: u8) -> u8 {
    current % QUESTION_COUNT + 1
}

/// Path of the track for `question` in `mode`, e.g. `/07-question.mp3`.
///
/// Every node derives the same name, so players can play a received path
/// without knowing anything about modes.
pub fn track_path(question: u8, mode: PlaybackMode) -> String {
    format!("/{:02}-{}.mp3", question, mode.name())
}

/// The controller's sequencing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouterState {
    pub mode: PlaybackMode,
    pub question: u8,
}

impl RouterState {
    /// Apply one event. Returns the new state and the broadcasts to send.
    ///
    /// At maximum chaos an advance picks a uniformly random question in
    /// `0..QUESTION_COUNT` instead of the next one.
    pub fn step<R: Rng>(self, event: RouterEvent, chaos: ChaosLevel, rng: &mut R) -> (Self, Vec<Message>) {
        match (event, self.mode) {
            (RouterEvent::Advance, _) => {
                let question = if chaos.is_max() {
                    rng.gen_range(0..QUESTION_COUNT)
                } else {
                    next_question(self.question)
                };
                let next = Self {
                    mode: PlaybackMode::Question,
                    question,
                };
                let path = track_path(question, PlaybackMode::Question);
                info!(question, from = %self.mode, path = %path, "Start, requesting question");
                (next, vec![Message::PathRequest(path)])
            }
            (RouterEvent::PlaybackFinished, PlaybackMode::Question) => {
                let next = Self {
                    mode: PlaybackMode::Answer,
                    ..self
                };
                let path = track_path(self.question, PlaybackMode::Answer);
                info!(question = self.question, path = %path, "Question playback done, requesting answer");
                (next, vec![Message::PathRequest(path)])
            }
            (RouterEvent::PlaybackFinished, PlaybackMode::Answer) => {
                if chaos.value() > 2 {
                    info!(question = self.question, chaos = %chaos, "Answer playback done, rearming");
                    let next = Self {
                        mode: PlaybackMode::Start,
                        ..self
                    };
                    (next, Vec::new())
                } else {
                    info!(question = self.question, "Answer playback done, waiting for button");
                    (self, Vec::new())
                }
            }
            (RouterEvent::PlaybackFinished, mode @ (PlaybackMode::Start | PlaybackMode::Pause)) => {
                debug!(mode = %mode, "Ignoring playback completion");
                (self, Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(26)
    }

    fn at(mode: PlaybackMode, question: u8) -> RouterState {
        RouterState { mode, question }
    }

    fn path(msgs: &[Message]) -> Option<&str> {
        match msgs {
            [Message::PathRequest(p)] => Some(p.as_str()),
            _ => None,
        }
    }

    #[test]
    fn track_names_are_zero_padded() {
        assert_eq!(track_path(7, PlaybackMode::Question), "/07-question.mp3");
        assert_eq!(track_path(26, PlaybackMode::Answer), "/26-answer.mp3");
        assert_eq!(track_path(0, PlaybackMode::Question), "/00-question.mp3");
    }

    #[test]
    fn question_cursor_wraps() {
        assert_eq!(next_question(0), 1);
        assert_eq!(next_question(25), 26);
        assert_eq!(next_question(26), 1);
    }

    #[test]
    fn full_sequence_at_calm() {
        let calm = ChaosLevel::CALM;
        let mut rng = rng();

        let (s, out) = RouterState::default().step(RouterEvent::Advance, calm, &mut rng);
        assert_eq!(s, at(PlaybackMode::Question, 1));
        assert_eq!(path(&out), Some("/01-question.mp3"));

        let (s, out) = s.step(RouterEvent::PlaybackFinished, calm, &mut rng);
        assert_eq!(s, at(PlaybackMode::Answer, 1));
        assert_eq!(path(&out), Some("/01-answer.mp3"));

        let (s, out) = s.step(RouterEvent::PlaybackFinished, calm, &mut rng);
        assert_eq!(s, at(PlaybackMode::Answer, 1));
        assert!(out.is_empty());
    }

    #[test]
    fn answer_rearms_only_above_two() {
        let mut rng = rng();
        for (level, expected) in [(0, PlaybackMode::Answer), (2, PlaybackMode::Answer), (3, PlaybackMode::Start), (4, PlaybackMode::Start)] {
            let (s, out) = at(PlaybackMode::Answer, 5).step(RouterEvent::PlaybackFinished, ChaosLevel::new(level), &mut rng);
            assert_eq!(s.mode, expected, "chaos {}", level);
            assert_eq!(s.question, 5);
            assert!(out.is_empty());
        }
    }

    #[test]
    fn advance_skips_from_any_mode() {
        let mut rng = rng();
        for mode in [PlaybackMode::Question, PlaybackMode::Pause, PlaybackMode::Answer] {
            let (s, out) = at(mode, 9).step(RouterEvent::Advance, ChaosLevel::CALM, &mut rng);
            assert_eq!(s, at(PlaybackMode::Question, 10));
            assert_eq!(path(&out), Some("/10-question.mp3"));
        }
    }

    #[test]
    fn completion_is_ignored_in_start_and_pause() {
        let mut rng = rng();
        for mode in [PlaybackMode::Start, PlaybackMode::Pause] {
            let before = at(mode, 3);
            let (s, out) = before.step(RouterEvent::PlaybackFinished, ChaosLevel::new(4), &mut rng);
            assert_eq!(s, before);
            assert!(out.is_empty());
        }
    }

    #[test]
    fn max_chaos_draws_uniform_question() {
        let mut rng = rng();
        let mut seen = [0usize; QUESTION_COUNT as usize];
        for _ in 0..5200 {
            let (s, out) = RouterState::default().step(RouterEvent::Advance, ChaosLevel::new(4), &mut rng);
            assert!(s.question < QUESTION_COUNT);
            assert_eq!(path(&out), Some(track_path(s.question, PlaybackMode::Question).as_str()));
            seen[s.question as usize] += 1;
        }
        // 200 expected per bucket.
        assert!(seen.iter().all(|&n| n > 100 && n < 300), "skewed draw: {:?}", seen);
    }

    proptest! {
        #[test]
        fn advance_below_max_increments(question in 0u8..=26, level in 0u8..4, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let (s, _) = at(PlaybackMode::Start, question).step(RouterEvent::Advance, ChaosLevel::new(level.into()), &mut rng);
            prop_assert_eq!(s.mode, PlaybackMode::Question);
            prop_assert_eq!(s.question, question % 26 + 1);
        }

        #[test]
        fn question_eof_requests_exactly_one_answer(question in 0u8..=26, level in 0u8..=4, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let (s, out) = at(PlaybackMode::Question, question).step(RouterEvent::PlaybackFinished, ChaosLevel::new(level.into()), &mut rng);
            prop_assert_eq!(s, at(PlaybackMode::Answer, question));
            prop_assert_eq!(out, vec![Message::PathRequest(track_path(question, PlaybackMode::Answer))]);
        }
    }
}
