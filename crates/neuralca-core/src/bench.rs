//! Step latency measurement and the steps-per-second meter.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::info;

use crate::engine::{Engine, Stage};
use crate::kernels::KernelKind;

/// Share of a step spent in one dispatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageTiming {
    pub stage: Stage,
    pub kernel: KernelKind,
    pub ms: f64,
    pub percent: f64,
}

/// Result of [`Engine::benchmark`]; `Display` renders the report text.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkReport {
    pub ms_per_step: f64,
    pub steps_per_sec: f64,
    pub stages: Vec<StageTiming>,
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:.2} ms/step, {:.2} step/sec",
            self.ms_per_step, self.steps_per_sec
        )?;
        let per_op = self
            .stages
            .iter()
            .map(|t| format!("{}: {:.1}%", t.kernel, t.percent))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{per_op}\n\n")
    }
}

pub(crate) fn run(engine: &mut Engine) -> BenchmarkReport {
    let n = engine.config().benchmark_steps.max(1);
    engine.flush();
    let start = Instant::now();
    for _ in 0..n {
        engine.step();
    }
    engine.flush();
    let ms_per_step = elapsed_ms(start) / f64::from(n);

    let stages = Stage::PIPELINE
        .iter()
        .map(|&stage| {
            let start = Instant::now();
            let mut kernel = stage.kind();
            for _ in 0..n {
                kernel = engine.run_stage(stage);
            }
            engine.flush_stage(stage);
            let ms = elapsed_ms(start) / f64::from(n);
            let percent = if ms_per_step > 0.0 {
                100.0 * ms / ms_per_step
            } else {
                0.0
            };
            StageTiming {
                stage,
                kernel,
                ms,
                percent,
            }
        })
        .collect();

    let report = BenchmarkReport {
        ms_per_step,
        steps_per_sec: 1_000.0 / ms_per_step,
        stages,
    };
    info!(
        ms_per_step = report.ms_per_step,
        steps_per_sec = report.steps_per_sec,
        "benchmark finished"
    );
    report
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1_000.0
}

/// Counts steps and publishes a rate once per sampling window.
#[derive(Debug, Clone)]
pub struct FpsMeter {
    interval: Duration,
    window_start: Option<Instant>,
    count: u32,
    last: String,
}

impl FpsMeter {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: None,
            count: 0,
            last: String::new(),
        }
    }

    /// Record one step taken at `now`.
    pub fn record_step(&mut self, now: Instant) {
        self.count += 1;
        let start = *self.window_start.get_or_insert(now);
        let elapsed = now.saturating_duration_since(start);
        if elapsed > self.interval {
            let rate = f64::from(self.count) / elapsed.as_secs_f64();
            self.last = format!("{rate:.1}");
            self.window_start = Some(now);
            self.count = 0;
        }
    }

    /// Last published rate; empty until the first window closes.
    #[must_use]
    pub fn last(&self) -> &str {
        &self.last
    }
}
