//! Host loop: a caller-supplied tick source drives steps and draws.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::engine::{Engine, VisMode};
use crate::kernels::Frame;

/// Source of frame ticks; `None` ends the run.
pub trait TickSource {
    fn next_tick(&mut self) -> Option<Instant>;
}

/// A fixed number of ticks stamped with the wall clock.
#[derive(Debug, Clone)]
pub struct FixedTicks {
    remaining: u64,
}

impl FixedTicks {
    #[must_use]
    pub const fn new(count: u64) -> Self {
        Self { remaining: count }
    }
}

impl TickSource for FixedTicks {
    fn next_tick(&mut self) -> Option<Instant> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(Instant::now())
    }
}

/// Replays pre-recorded tick instants.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTicks {
    ticks: VecDeque<Instant>,
}

impl ScriptedTicks {
    pub fn new(ticks: impl IntoIterator<Item = Instant>) -> Self {
        Self {
            ticks: ticks.into_iter().collect(),
        }
    }
}

impl TickSource for ScriptedTicks {
    fn next_tick(&mut self) -> Option<Instant> {
        self.ticks.pop_front()
    }
}

/// Adaptive steps-per-frame policy ("full throttle").
#[derive(Debug, Clone)]
pub struct Throttle {
    enabled: bool,
    frame_budget: Duration,
    steps_per_frame: u32,
    last_frame: Option<Instant>,
}

impl Throttle {
    /// When enabled, frames arriving sooner than `frame_budget` after the
    /// previous one earn an extra step; slower frames give one back.
    #[must_use]
    pub const fn new(enabled: bool, frame_budget: Duration) -> Self {
        Self {
            enabled,
            frame_budget,
            steps_per_frame: 1,
            last_frame: None,
        }
    }

    /// Always one step per frame.
    #[must_use]
    pub const fn disabled() -> Self {
        Self::new(false, Duration::ZERO)
    }

    /// Steps to run for the frame arriving at `now`.
    pub fn steps_for(&mut self, now: Instant) -> u32 {
        let mut steps = 1;
        if self.enabled
            && let Some(last) = self.last_frame
        {
            if now.saturating_duration_since(last) < self.frame_budget {
                self.steps_per_frame += 1;
            } else {
                self.steps_per_frame = self.steps_per_frame.saturating_sub(1).max(1);
            }
            steps = self.steps_per_frame;
        }
        self.last_frame = Some(now);
        steps
    }
}

/// Totals of a scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub frames: u64,
    pub steps: u64,
    pub max_steps_per_frame: u32,
}

/// Runs `steps` then one `draw` per tick.
#[derive(Debug)]
pub struct Scheduler<T> {
    ticks: T,
    throttle: Throttle,
    mode: VisMode,
}

impl<T: TickSource> Scheduler<T> {
    #[must_use]
    pub const fn new(ticks: T, throttle: Throttle, mode: VisMode) -> Self {
        Self {
            ticks,
            throttle,
            mode,
        }
    }

    /// Drive `engine` until the tick source runs dry, handing each frame to
    /// `present` together with its frame index.
    pub fn run<F, E>(&mut self, engine: &mut Engine, mut present: F) -> Result<RunSummary, E>
    where
        F: FnMut(u64, &Frame) -> Result<(), E>,
    {
        let mut summary = RunSummary::default();
        while let Some(now) = self.ticks.next_tick() {
            let steps = self.throttle.steps_for(now);
            for _ in 0..steps {
                engine.step();
            }
            let frame = engine.draw(self.mode);
            present(summary.frames, &frame)?;
            summary.frames += 1;
            summary.steps += u64::from(steps);
            summary.max_steps_per_frame = summary.max_steps_per_frame.max(steps);
        }
        debug!(
            frames = summary.frames,
            steps = summary.steps,
            fps = %engine.fps(),
            "scheduler run finished"
        );
        Ok(summary)
    }
}
