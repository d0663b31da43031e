//! Fixed-interval inference loop
//!
//! Work runs immediately on start and then once per interval. Invocations
//! never overlap: the loop is sequential, and ticks that come due while an
//! invocation is still running are skipped, not queued; the next invocation
//! starts as soon as the running one finishes. A [`BusyGate`] shared with
//! single-shot callers makes a tick that collides with one of them skip too.

use super::gate::BusyGate;
use crate::error::{ParleyError, Result};
use crate::utils::TimingTracker;
use async_trait::async_trait;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One unit of periodic work: acquire, infer, release
#[async_trait]
pub trait LiveWork: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Clone + Send + std::fmt::Debug + 'static;

    /// Obtain this tick's input; `None` skips the tick quietly
    async fn acquire(&self) -> Result<Option<Self::Input>>;

    async fn infer(&self, input: &Self::Input, cancel: &CancellationToken) -> Result<Self::Output>;

    /// Runs after every successful acquire, including on cancellation
    async fn release(&self, input: Self::Input);
}

/// Result of a single invocation
#[derive(Debug, Clone)]
pub enum Invocation<O> {
    Output(O),
    /// Nothing to do this time
    Idle,
    /// Another invocation holds the gate
    Busy,
    /// Recognised transient fault; the next attempt may succeed
    Transient(String),
    Fault(ParleyError),
    Cancelled,
}

/// Run acquire/infer/release once under `gate`
pub async fn invoke_once<W: LiveWork + ?Sized>(
    work: &W,
    gate: &BusyGate,
    cancel: &CancellationToken,
) -> Invocation<W::Output> {
    let Some(_guard) = gate.try_acquire() else {
        return Invocation::Busy;
    };

    let acquired = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Invocation::Cancelled,
        acquired = work.acquire() => acquired,
    };
    let input = match acquired {
        Ok(Some(input)) => input,
        Ok(None) => return Invocation::Idle,
        Err(e) => return classify(e),
    };

    let inferred = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        inferred = work.infer(&input, cancel) => Some(inferred),
    };
    work.release(input).await;

    match inferred {
        None => Invocation::Cancelled,
        Some(Ok(output)) => Invocation::Output(output),
        Some(Err(e)) => classify(e),
    }
}

fn classify<O>(error: ParleyError) -> Invocation<O> {
    match error {
        ParleyError::TransientFault(message) => Invocation::Transient(message),
        ParleyError::Cancelled => Invocation::Cancelled,
        other => Invocation::Fault(other),
    }
}

/// Whether a non-transient fault ends the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPolicy {
    pub stop_on_fault: bool,
}

impl Default for LoopPolicy {
    fn default() -> Self {
        Self {
            stop_on_fault: true,
        }
    }
}

/// Events emitted by a running loop
#[derive(Debug, Clone)]
pub enum LoopEvent<O> {
    Output(O),
    /// Absorbed; the loop keeps going
    TransientFault(String),
    /// Ticks that came due while busy
    Skipped { ticks: u64 },
    Fault(ParleyError),
    Stopped,
}

/// Counters for a loop's lifetime
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopStats {
    pub invocations: u64,
    pub completed: u64,
    pub idle: u64,
    pub skipped: u64,
    pub transient_faults: u64,
    pub faults: u64,
    pub mean_invocation: Duration,
    pub p95_invocation: Duration,
}

#[derive(Debug)]
struct StatsRecorder {
    stats: LoopStats,
    timings: TimingTracker,
}

impl StatsRecorder {
    fn new() -> Self {
        Self {
            stats: LoopStats::default(),
            timings: TimingTracker::new(100),
        }
    }

    fn record_timing(&mut self, elapsed: Duration) {
        self.stats.invocations += 1;
        self.timings.record(elapsed);
        self.stats.mean_invocation = self.timings.average();
        self.stats.p95_invocation = self.timings.percentile_95();
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Periodic runner for a [`LiveWork`]
pub struct LiveInferenceLoop<W: LiveWork> {
    work: Arc<W>,
    gate: BusyGate,
    policy: LoopPolicy,
    running: Mutex<Option<Running>>,
    stats: Arc<Mutex<StatsRecorder>>,
    event_tx: Sender<LoopEvent<W::Output>>,
}

impl<W: LiveWork> LiveInferenceLoop<W> {
    pub fn new(work: Arc<W>, policy: LoopPolicy) -> (Self, Receiver<LoopEvent<W::Output>>) {
        let (event_tx, event_rx) = unbounded();
        let live = Self {
            work,
            gate: BusyGate::new(),
            policy,
            running: Mutex::new(None),
            stats: Arc::new(Mutex::new(StatsRecorder::new())),
            event_tx,
        };
        (live, event_rx)
    }

    /// Gate to share with single-shot callers of the same resource
    pub fn gate(&self) -> BusyGate {
        self.gate.clone()
    }

    pub fn work(&self) -> &Arc<W> {
        &self.work
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    pub fn stats(&self) -> LoopStats {
        self.stats.lock().stats.clone()
    }

    /// Start ticking; a no-op while already running
    pub fn start(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(ParleyError::Config("Loop interval must be > 0".into()));
        }

        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!("Live loop already running");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let ticker = Ticker {
            work: self.work.clone(),
            gate: self.gate.clone(),
            policy: self.policy,
            interval,
            cancel: cancel.clone(),
            stats: self.stats.clone(),
            event_tx: self.event_tx.clone(),
        };
        info!("Live loop started, interval {}ms", interval.as_millis());
        *running = Some(Running {
            cancel,
            task: tokio::spawn(ticker.run()),
        });
        Ok(())
    }

    /// Stop ticking and wait for any in-flight invocation to wind down
    ///
    /// Idempotent. No invocation starts after this returns.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.task.await {
                warn!("Live loop task ended abnormally: {}", e);
            }
        }
    }

    /// One invocation outside the timer, sharing the loop's gate
    pub async fn run_once(&self, cancel: &CancellationToken) -> Invocation<W::Output> {
        invoke_once(self.work.as_ref(), &self.gate, cancel).await
    }
}

struct Ticker<W: LiveWork> {
    work: Arc<W>,
    gate: BusyGate,
    policy: LoopPolicy,
    interval: Duration,
    cancel: CancellationToken,
    stats: Arc<Mutex<StatsRecorder>>,
    event_tx: Sender<LoopEvent<W::Output>>,
}

impl<W: LiveWork> Ticker<W> {
    async fn run(self) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                deadline = timer.tick() => deadline,
            };

            let missed = missed_ticks(deadline, Instant::now(), self.interval);
            if missed > 0 {
                debug!("Skipped {} tick(s) while busy", missed);
                self.stats.lock().stats.skipped += missed;
                let _ = self.event_tx.send(LoopEvent::Skipped { ticks: missed });
            }

            let started = Instant::now();
            let outcome = invoke_once(self.work.as_ref(), &self.gate, &self.cancel).await;
            if !matches!(outcome, Invocation::Busy | Invocation::Cancelled) {
                self.stats.lock().record_timing(started.elapsed());
            }

            match outcome {
                Invocation::Output(output) => {
                    self.stats.lock().stats.completed += 1;
                    let _ = self.event_tx.send(LoopEvent::Output(output));
                }
                Invocation::Idle => {
                    self.stats.lock().stats.idle += 1;
                }
                Invocation::Busy => {
                    debug!("Tick skipped: another invocation holds the gate");
                    self.stats.lock().stats.skipped += 1;
                    let _ = self.event_tx.send(LoopEvent::Skipped { ticks: 1 });
                }
                Invocation::Transient(message) => {
                    info!("Transient fault, retrying next tick: {}", message);
                    self.stats.lock().stats.transient_faults += 1;
                    let _ = self.event_tx.send(LoopEvent::TransientFault(message));
                }
                Invocation::Fault(e) => {
                    warn!("Live invocation failed: {}", e);
                    self.stats.lock().stats.faults += 1;
                    let _ = self.event_tx.send(LoopEvent::Fault(e));
                    if self.policy.stop_on_fault {
                        break;
                    }
                }
                Invocation::Cancelled => break,
            }
        }

        info!("Live loop stopped");
        let _ = self.event_tx.send(LoopEvent::Stopped);
    }
}

/// Deadlines that fell due while the previous invocation was running
///
/// A tick served `late` after its deadline stands for every deadline in
/// `[deadline, now)`.
fn missed_ticks(deadline: Instant, now: Instant, interval: Duration) -> u64 {
    let late = now.saturating_duration_since(deadline).as_nanos();
    let period = interval.as_nanos().max(1);
    late.div_ceil(period) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missed_ticks() {
        let start = Instant::now();
        let period = Duration::from_millis(2000);
        assert_eq!(missed_ticks(start, start, period), 0);
        assert_eq!(missed_ticks(start, start + Duration::from_millis(1000), period), 1);
        assert_eq!(missed_ticks(start, start + Duration::from_millis(2000), period), 1);
        assert_eq!(missed_ticks(start, start + Duration::from_millis(3000), period), 2);
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify::<()>(ParleyError::TransientFault("trap".into())),
            Invocation::Transient(m) if m == "trap"
        ));
        assert!(matches!(
            classify::<()>(ParleyError::Generation("bad".into())),
            Invocation::Fault(_)
        ));
        assert!(matches!(classify::<()>(ParleyError::Cancelled), Invocation::Cancelled));
    }
}
