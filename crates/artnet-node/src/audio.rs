//! Audio playback.
//!
//! Decoding and output are out of scope for the swarm itself; what matters
//! to the protocol is *when* a track ends, because that end-of-file is what
//! drives the controller's sequencing. [`ClipPlayer`] models each file as a
//! clip of fixed length and reports completion on the node's event channel,
//! honouring seeks and time offsets by moving the end deadline.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use artnet_core::Event;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Playback backend driven by the runtime.
pub trait Player {
    /// Start `path`, replacing whatever is playing.
    fn play(&mut self, path: &str);

    /// Jump to `fraction` of the current file's length.
    fn seek(&mut self, fraction: f32);

    /// Shift the current file by whole seconds; positive skips ahead.
    fn set_time_offset(&mut self, seconds: i32);
}

/// Player for nodes without a speaker. Logs and discards every command.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPlayer;

impl Player for NullPlayer {
    fn play(&mut self, path: &str) {
        trace!(path, "No audio, not playing");
    }

    fn seek(&mut self, fraction: f32) {
        trace!(fraction, "No audio, not seeking");
    }

    fn set_time_offset(&mut self, seconds: i32) {
        trace!(seconds, "No audio, not offsetting");
    }
}

struct Playing {
    path: PathBuf,
    deadline: Instant,
    finish: JoinHandle<()>,
}

/// Fixed-length clip player rooted at a media directory.
///
/// Every call must happen inside a tokio runtime, since completion is
/// tracked by a spawned timer task.
pub struct ClipPlayer {
    media_root: PathBuf,
    clip_length: Duration,
    events: mpsc::UnboundedSender<Event>,
    playing: Option<Playing>,
}

impl ClipPlayer {
    pub fn new(
        media_root: impl Into<PathBuf>,
        clip_length: Duration,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            media_root: media_root.into(),
            clip_length,
            events,
            playing: None,
        }
    }

    /// Whether a clip is running and has not yet finished.
    pub fn is_playing(&self) -> bool {
        self.playing
            .as_ref()
            .is_some_and(|playing| !playing.finish.is_finished())
    }

    /// Resolved file of the current or last clip.
    pub fn current_path(&self) -> Option<&Path> {
        self.playing.as_ref().map(|playing| playing.path.as_path())
    }

    /// Resolve a mesh path like `/03-answer.mp3` under the media root.
    /// Anything that could escape the root is rejected.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.as_os_str().is_empty() {
            return None;
        }
        relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
            .then(|| self.media_root.join(relative))
    }

    fn schedule(&mut self, path: PathBuf, deadline: Instant) {
        self.stop();

        let events = self.events.clone();
        let finish = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = events.send(Event::PlaybackFinished);
        });
        self.playing = Some(Playing {
            path,
            deadline,
            finish,
        });
    }

    fn stop(&mut self) {
        if let Some(playing) = &self.playing {
            playing.finish.abort();
        }
    }
}

impl Player for ClipPlayer {
    fn play(&mut self, path: &str) {
        let Some(file) = self.resolve(path) else {
            warn!(path, "Refusing to play path outside media root");
            return;
        };
        if !file.exists() {
            debug!(file = %file.display(), "Media file missing, timing the clip anyway");
        }
        info!(file = %file.display(), "Playing");
        let deadline = Instant::now() + self.clip_length;
        self.schedule(file, deadline);
    }

    fn seek(&mut self, fraction: f32) {
        if !self.is_playing() {
            return;
        }
        let remaining = self.clip_length.mul_f32(1.0 - fraction.clamp(0.0, 1.0));
        let Some(path) = self.playing.as_ref().map(|p| p.path.clone()) else {
            return;
        };
        debug!(fraction, remaining_ms = remaining.as_millis() as u64, "Seek");
        self.schedule(path, Instant::now() + remaining);
    }

    fn set_time_offset(&mut self, seconds: i32) {
        if !self.is_playing() {
            return;
        }
        let Some((path, deadline)) = self.playing.as_ref().map(|p| (p.path.clone(), p.deadline)) else {
            return;
        };
        let shift = Duration::from_secs(u64::from(seconds.unsigned_abs()));
        // Skipping ahead brings the end closer.
        let deadline = if seconds >= 0 {
            deadline.checked_sub(shift).unwrap_or_else(Instant::now)
        } else {
            deadline + shift
        };
        trace!(seconds, "Time offset");
        self.schedule(path, deadline);
    }
}

impl Drop for ClipPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIP: Duration = Duration::from_secs(10);

    fn player() -> (ClipPlayer, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClipPlayer::new("/media", CLIP, tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn clip_finishes_after_its_length() {
        let (mut player, mut rx) = player();
        player.play("/01-question.mp3");
        assert!(player.is_playing());
        assert_eq!(player.current_path(), Some(Path::new("/media/01-question.mp3")));

        tokio::time::sleep(CLIP - Duration::from_millis(1)).await;
        assert!(rx.try_recv().is_err());

        assert_eq!(rx.recv().await, Some(Event::PlaybackFinished));
        tokio::task::yield_now().await;
        assert!(!player.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn replay_cancels_previous_clip() {
        let (mut player, mut rx) = player();
        player.play("/01-question.mp3");
        tokio::time::sleep(Duration::from_secs(5)).await;
        player.play("/01-answer.mp3");

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rx.try_recv(), Ok(Event::PlaybackFinished));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn seek_moves_the_end() {
        let (mut player, mut rx) = player();
        player.play("/02-question.mp3");
        player.seek(0.5);

        tokio::time::sleep(Duration::from_millis(4999)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(rx.try_recv(), Ok(Event::PlaybackFinished));
    }

    #[tokio::test(start_paused = true)]
    async fn offset_shifts_both_ways() {
        let (mut player, mut rx) = player();
        player.play("/02-question.mp3");
        player.set_time_offset(3);
        player.set_time_offset(-1);

        tokio::time::sleep(Duration::from_millis(7999)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(rx.try_recv(), Ok(Event::PlaybackFinished));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_player_ignores_seek_and_offset() {
        let (mut player, mut rx) = player();
        player.seek(0.5);
        player.set_time_offset(2);
        tokio::time::sleep(CLIP * 2).await;
        assert!(rx.try_recv().is_err());
        assert!(player.current_path().is_none());
    }

    #[tokio::test]
    async fn escaping_paths_are_refused() {
        let (mut player, _rx) = player();
        player.play("/../etc/passwd");
        player.play("/");
        assert!(!player.is_playing());
        assert!(player.current_path().is_none());
    }

    #[test]
    fn null_player_accepts_everything() {
        let mut player = NullPlayer;
        player.play("/01-question.mp3");
        player.seek(0.5);
        player.set_time_offset(-1);
    }
}
