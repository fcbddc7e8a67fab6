//! # Ingest Telemetry
//!
//! Progress counters for ingest runs. Workers bump relaxed atomics; an
//! optional heartbeat thread samples them and reports throughput.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    Initializing = 0,
    Ingesting = 1,
    Finalizing = 2,
    Saving = 3,
    Loading = 4,
    Complete = 5,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Initializing => "Initializing",
            Stage::Ingesting => "Ingesting",
            Stage::Finalizing => "Finalizing",
            Stage::Saving => "Saving",
            Stage::Loading => "Loading",
            Stage::Complete => "Complete",
        }
    }

    fn from_u64(val: u64) -> Self {
        match val {
            0 => Stage::Initializing,
            1 => Stage::Ingesting,
            2 => Stage::Finalizing,
            3 => Stage::Saving,
            4 => Stage::Loading,
            _ => Stage::Complete,
        }
    }
}

/// Shared progress counters. Relaxed ordering throughout; readers only need
/// approximate values.
pub struct TelemetryBlackboard {
    stage: AtomicU64,
    observations: AtomicU64,
    total_observations: AtomicU64,
    blocks_created: AtomicU64,
    chromosomes_done: AtomicU64,
    total_chromosomes: AtomicU64,
    start_time: Instant,
    last_progress_nanos: AtomicU64,
    shutdown: AtomicBool,
}

impl TelemetryBlackboard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn set_stage(&self, stage: Stage) {
        self.stage.store(stage as u64, Ordering::Relaxed);
        self.touch_progress();
    }

    #[inline]
    pub fn stage(&self) -> Stage {
        Stage::from_u64(self.stage.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn record_observation(&self) {
        self.observations.fetch_add(1, Ordering::Relaxed);
        self.touch_progress();
    }

    pub fn set_total_observations(&self, total: u64) {
        self.total_observations.store(total, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_blocks(&self, created: u64) {
        self.blocks_created.fetch_add(created, Ordering::Relaxed);
    }

    pub fn set_total_chromosomes(&self, total: u64) {
        self.total_chromosomes.store(total, Ordering::Relaxed);
    }

    pub fn record_chromosome_done(&self) {
        self.chromosomes_done.fetch_add(1, Ordering::Relaxed);
        self.touch_progress();
    }

    pub fn observations(&self) -> u64 {
        self.observations.load(Ordering::Relaxed)
    }

    pub fn total_observations(&self) -> u64 {
        self.total_observations.load(Ordering::Relaxed)
    }

    pub fn blocks_created(&self) -> u64 {
        self.blocks_created.load(Ordering::Relaxed)
    }

    pub fn chromosomes_done(&self) -> u64 {
        self.chromosomes_done.load(Ordering::Relaxed)
    }

    pub fn total_chromosomes(&self) -> u64 {
        self.total_chromosomes.load(Ordering::Relaxed)
    }

    #[inline]
    fn touch_progress(&self) {
        let elapsed = self.start_time.elapsed().as_nanos() as u64;
        self.last_progress_nanos.store(elapsed, Ordering::Relaxed);
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            stage: self.stage(),
            observations: self.observations(),
            total_observations: self.total_observations(),
            blocks_created: self.blocks_created(),
            chromosomes_done: self.chromosomes_done(),
            total_chromosomes: self.total_chromosomes(),
            elapsed_secs: self.elapsed_secs(),
            idle_secs: self
                .start_time
                .elapsed()
                .as_nanos()
                .saturating_sub(self.last_progress_nanos.load(Ordering::Relaxed) as u128)
                as u64
                / 1_000_000_000,
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Default for TelemetryBlackboard {
    fn default() -> Self {
        Self {
            stage: AtomicU64::new(Stage::Initializing as u64),
            observations: AtomicU64::new(0),
            total_observations: AtomicU64::new(0),
            blocks_created: AtomicU64::new(0),
            chromosomes_done: AtomicU64::new(0),
            total_chromosomes: AtomicU64::new(0),
            start_time: Instant::now(),
            last_progress_nanos: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }
}

struct TelemetrySnapshot {
    stage: Stage,
    observations: u64,
    total_observations: u64,
    blocks_created: u64,
    chromosomes_done: u64,
    total_chromosomes: u64,
    elapsed_secs: f64,
    idle_secs: u64,
}

pub struct HeartbeatConfig {
    pub interval_secs: u64,
    /// Seconds without progress before a run is reported as stalled
    pub stall_threshold_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            stall_threshold_secs: 300,
        }
    }
}

pub struct HeartbeatHandle {
    handle: Option<JoinHandle<()>>,
    blackboard: Arc<TelemetryBlackboard>,
}

impl HeartbeatHandle {
    pub fn spawn(blackboard: Arc<TelemetryBlackboard>, config: HeartbeatConfig) -> io::Result<Self> {
        let bb = Arc::clone(&blackboard);
        let is_tty = io::stderr().is_terminal();
        let handle = thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || heartbeat_loop(bb, config, is_tty))?;
        Ok(Self {
            handle: Some(handle),
            blackboard,
        })
    }

    /// Stop the heartbeat and wait for its thread
    pub fn shutdown(mut self) {
        self.blackboard.signal_shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.blackboard.signal_shutdown();
    }
}

fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.0}s", secs)
    } else if secs < 3600.0 {
        format!("{:.0}m{:.0}s", (secs / 60.0).floor(), secs % 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

fn heartbeat_loop(bb: Arc<TelemetryBlackboard>, config: HeartbeatConfig, is_tty: bool) {
    let interval = Duration::from_secs(config.interval_secs.max(1));
    let mut last_observations = 0u64;
    let mut last_time = Instant::now();

    loop {
        // Sleep in short slices so shutdown is prompt
        let wake = Instant::now() + interval;
        while Instant::now() < wake && !bb.is_shutdown() {
            thread::sleep(Duration::from_millis(100));
        }
        if bb.is_shutdown() {
            break;
        }

        let snap = bb.snapshot();
        let now = Instant::now();
        let dt = now.duration_since(last_time).as_secs_f64();
        let velocity = if dt > 0.1 {
            snap.observations.saturating_sub(last_observations) as f64 / dt
        } else {
            0.0
        };
        last_observations = snap.observations;
        last_time = now;
        let stalled = snap.idle_secs > config.stall_threshold_secs;

        let total = if snap.total_observations > 0 {
            format!("/{}", snap.total_observations)
        } else {
            String::new()
        };
        if is_tty {
            eprint!(
                "\r{} | {}{} obs | {} blocks | chrom {}/{} | {:.0} obs/s | {}{}    \x1b[K",
                snap.stage.as_str(),
                snap.observations,
                total,
                snap.blocks_created,
                snap.chromosomes_done,
                snap.total_chromosomes,
                velocity,
                format_duration(snap.elapsed_secs),
                if stalled { " [STALLED]" } else { "" }
            );
            let _ = io::stderr().flush();
        } else {
            tracing::info!(
                stage = snap.stage.as_str(),
                observations = snap.observations,
                blocks = snap.blocks_created,
                chromosomes_done = snap.chromosomes_done,
                velocity = %format!("{:.0}/s", velocity),
                elapsed = %format_duration(snap.elapsed_secs),
                stalled,
                "heartbeat"
            );
        }
    }

    if is_tty {
        eprint!("\r\x1b[K");
        let _ = io::stderr().flush();
    }
}
