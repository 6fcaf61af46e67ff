//! Gapless playback scheduling
//!
//! Chunks arrive from the network with arbitrary jitter. Each one is placed
//! on the output timeline at `max(now, previous end)` so consecutive chunks
//! play back-to-back, and a late chunk after an underrun starts immediately.

/// Where one chunk landed on the output timeline (seconds)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PlaybackScheduler {
    next_start: f64,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a chunk of `duration` seconds given the output clock `now`
    pub fn schedule(&mut self, now: f64, duration: f64) -> ScheduledChunk {
        let start = self.next_start.max(now);
        let end = start + duration.max(0.0);
        self.next_start = end;
        ScheduledChunk { start, end }
    }

    /// Drop the queued timeline; the next chunk schedules from `now`
    pub fn reset(&mut self, now: f64) {
        self.next_start = now;
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    /// True once everything scheduled has finished by `now`
    pub fn is_idle(&self, now: f64) -> bool {
        self.next_start <= now
    }
}
