use crate::models::{Video, VideoId};
use crate::stream::supervisor::ExitReason;
use tracing::{debug, warn};

/// What the engine should do after the encoder went away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NextAction {
    /// Settle the session; `note` is surfaced to the operator when set.
    Idle { note: Option<String> },
    /// Launch the given video.
    Advance(VideoId),
    /// Give up looping and put the session in error.
    Fault(String),
}

/// Facts about a process exit the scheduler decides on.
#[derive(Clone, Debug)]
pub struct ExitContext<'a> {
    pub reason: ExitReason,
    /// The process never got confirmed live, or could not be launched at all.
    pub immediate: bool,
    pub loop_enabled: bool,
    pub current_video_id: Option<VideoId>,
    pub queued_video_id: Option<VideoId>,
    pub playlist: &'a [Video],
}

#[derive(Debug)]
pub struct LoopScheduler {
    failure_threshold: u32,
    consecutive_failures: u32,
}

impl LoopScheduler {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// The running encoder was confirmed live.
    pub fn confirm_live(&mut self) {
        self.reset();
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn on_process_exited(&mut self, exit: &ExitContext<'_>) -> NextAction {
        if exit.reason == ExitReason::ExplicitStop || !exit.loop_enabled {
            self.reset();
            return NextAction::Idle { note: None };
        }

        if exit.immediate {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.failure_threshold {
                let failures = self.consecutive_failures;
                self.reset();
                warn!(failures, "Loop halted after consecutive failed starts");
                return NextAction::Fault(format!(
                    "Loop playback halted after {failures} consecutive failed starts"
                ));
            }
        } else {
            self.reset();
        }

        match next_video(exit.playlist, exit.current_video_id, exit.queued_video_id) {
            Some(next) => {
                debug!(
                    from = ?exit.current_video_id,
                    next,
                    failures = self.consecutive_failures,
                    "Advancing playlist"
                );
                NextAction::Advance(next)
            }
            None => {
                self.reset();
                NextAction::Idle {
                    note: Some("Cannot loop: the playlist is empty".into()),
                }
            }
        }
    }
}

/// Picks the video that follows `current`.
///
/// A queued video wins if it is still in the playlist. Otherwise this is the
/// entry with the smallest `(playlist_order, id)` after the current one,
/// wrapping around to the first entry.
pub fn next_video(
    playlist: &[Video],
    current: Option<VideoId>,
    queued: Option<VideoId>,
) -> Option<VideoId> {
    if let Some(queued) = queued
        && playlist.iter().any(|video| video.id == queued)
    {
        return Some(queued);
    }

    let first = playlist.iter().min_by_key(|video| video.order_key())?;
    let Some(current) = current.and_then(|id| playlist.iter().find(|video| video.id == id)) else {
        return Some(first.id);
    };

    let after = playlist
        .iter()
        .filter(|video| video.order_key() > current.order_key())
        .min_by_key(|video| video.order_key());
    Some(after.unwrap_or(first).id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn video(id: VideoId, playlist_order: i64) -> Video {
        Video {
            id,
            title: format!("video {id}"),
            filename: format!("{id}.mp4"),
            playlist_order,
            file_size: 0,
            created_at: Utc::now(),
        }
    }

    fn exit(
        reason: ExitReason,
        immediate: bool,
        current: VideoId,
        playlist: &[Video],
    ) -> ExitContext<'_> {
        ExitContext {
            reason,
            immediate,
            loop_enabled: true,
            current_video_id: Some(current),
            queued_video_id: None,
            playlist,
        }
    }

    const FAILED: ExitReason = ExitReason::Failed { code: Some(1) };

    #[test]
    fn test_next_video_wraps_around() {
        let playlist = [video(1, 1), video(2, 2), video(3, 3)];
        assert_eq!(next_video(&playlist, Some(1), None), Some(2));
        assert_eq!(next_video(&playlist, Some(2), None), Some(3));
        assert_eq!(next_video(&playlist, Some(3), None), Some(1));
        assert_eq!(next_video(&[video(7, 1)], Some(7), None), Some(7));
    }

    #[test]
    fn test_next_video_edge_cases() {
        assert_eq!(next_video(&[], Some(1), None), None);
        assert_eq!(next_video(&[], None, Some(1)), None);

        let playlist = [video(4, 10), video(5, 20)];
        // Unknown or missing current starts from the top
        assert_eq!(next_video(&playlist, None, None), Some(4));
        assert_eq!(next_video(&playlist, Some(99), None), Some(4));
        // Stale queued ids are ignored
        assert_eq!(next_video(&playlist, Some(4), Some(99)), Some(5));
        assert_eq!(next_video(&playlist, Some(4), Some(4)), Some(4));
    }

    #[test]
    fn test_ties_are_broken_by_id() {
        let playlist = [video(3, 1), video(1, 1), video(2, 1)];
        assert_eq!(next_video(&playlist, Some(1), None), Some(2));
        assert_eq!(next_video(&playlist, Some(2), None), Some(3));
        assert_eq!(next_video(&playlist, Some(3), None), Some(1));
    }

    #[test]
    fn test_cyclic_coverage() {
        for size in 1..=8 {
            // Scrambled insertion, ordering comes from playlist_order alone
            let playlist = (1..=size)
                .map(|id| video(id, (id * 7) % (size + 1)))
                .collect::<Vec<_>>();
            let mut current = next_video(&playlist, None, None);
            let mut seen = Vec::new();
            for _ in 0..size {
                let id = current.unwrap();
                assert!(!seen.contains(&id), "repeated {id} before covering all");
                seen.push(id);
                current = next_video(&playlist, Some(id), None);
            }
            assert_eq!(seen.len() as i64, size);
            assert_eq!(current, Some(seen[0]), "wraps back to the first entry");
        }
    }

    #[test]
    fn test_reorder_changes_next_pick() {
        // A was uploaded first, then the playlist was reordered to [B, A]
        let playlist = [video(1, 2), video(2, 1)];
        assert_eq!(next_video(&playlist, Some(1), None), Some(2));
        assert_eq!(next_video(&playlist, Some(2), None), Some(1));
    }

    #[test]
    fn test_explicit_stop_wins() {
        let playlist = [video(1, 1), video(2, 2)];
        let mut scheduler = LoopScheduler::new(3);
        let action = scheduler.on_process_exited(&exit(ExitReason::ExplicitStop, false, 1, &playlist));
        assert_eq!(action, NextAction::Idle { note: None });
    }

    #[test]
    fn test_loop_disabled_settles() {
        let playlist = [video(1, 1), video(2, 2)];
        let mut scheduler = LoopScheduler::new(3);
        let context = ExitContext {
            loop_enabled: false,
            ..exit(ExitReason::Completed, false, 1, &playlist)
        };
        assert_eq!(
            scheduler.on_process_exited(&context),
            NextAction::Idle { note: None }
        );
    }

    #[test]
    fn test_empty_playlist_settles_with_note() {
        let mut scheduler = LoopScheduler::new(3);
        let NextAction::Idle { note: Some(note) } =
            scheduler.on_process_exited(&exit(ExitReason::Completed, false, 1, &[]))
        else {
            panic!("expected idle with a note");
        };
        assert!(note.contains("empty"));
    }

    #[test]
    fn test_failures_advance_until_threshold() {
        // [A, B], loop on, both fail right away, threshold 2
        let playlist = [video(1, 1), video(2, 2)];
        let mut scheduler = LoopScheduler::new(2);

        let action = scheduler.on_process_exited(&exit(FAILED, true, 1, &playlist));
        assert_eq!(action, NextAction::Advance(2));
        assert_eq!(scheduler.consecutive_failures(), 1);

        let action = scheduler.on_process_exited(&exit(FAILED, true, 2, &playlist));
        assert!(matches!(action, NextAction::Fault(_)));
        assert_eq!(scheduler.consecutive_failures(), 0);
    }

    #[test]
    fn test_live_exits_reset_failure_count() {
        let playlist = [video(1, 1), video(2, 2)];
        let mut scheduler = LoopScheduler::new(2);

        scheduler.on_process_exited(&exit(FAILED, true, 1, &playlist));
        assert_eq!(scheduler.consecutive_failures(), 1);

        // A failure after going live is a skippable item, not a crash loop
        let action = scheduler.on_process_exited(&exit(FAILED, false, 2, &playlist));
        assert_eq!(action, NextAction::Advance(1));
        assert_eq!(scheduler.consecutive_failures(), 0);

        scheduler.on_process_exited(&exit(ExitReason::Completed, true, 1, &playlist));
        scheduler.confirm_live();
        assert_eq!(scheduler.consecutive_failures(), 0);
    }

    #[test]
    fn test_queued_video_is_played_next() {
        let playlist = [video(1, 1), video(2, 2), video(3, 3)];
        let mut scheduler = LoopScheduler::new(3);
        let context = ExitContext {
            queued_video_id: Some(3),
            ..exit(ExitReason::Completed, false, 1, &playlist)
        };
        assert_eq!(scheduler.on_process_exited(&context), NextAction::Advance(3));
    }
}
