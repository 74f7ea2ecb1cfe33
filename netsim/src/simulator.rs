//! Seeded, time-driven network impairment.
//!
//! Packets submitted with [`NetworkSimulator::process_packet`] are either
//! dropped on the spot or scheduled into a [`DeliveryQueue`] at a computed
//! arrival time. A background task pops due entries and hands them to the
//! delivery callback; reordering falls out of the deadline ordering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace};
use voip_bench_common::{MetricsContext, RtpPacket};

use crate::conditions::{NetworkConditions, MAX_DELAY_MS};
use crate::queue::{DeliveryQueue, ScheduledDelivery};

/// Longest the delivery loop sleeps before re-checking for work or stop.
const MAX_TICK: Duration = Duration::from_millis(10);

/// Extra hold-back applied to a reordered packet, in milliseconds.
const REORDER_DELAY_MS: (f64, f64) = (50.0, 200.0);

/// Gap between an original delivery and its duplicate, in milliseconds.
const DUPLICATE_OFFSET_MS: (f64, f64) = (1.0, 5.0);

/// Receives every delivered packet with its `(is_duplicate, is_corrupted)`
/// flags. Errors are logged; delivery carries on.
pub type DeliveryCallback =
    Arc<dyn Fn(RtpPacket, bool, bool) -> anyhow::Result<()> + Send + Sync>;

/// Simulator configuration.
#[derive(Debug, Clone, Default)]
pub struct SimulatorConfig {
    // ---
    pub conditions: NetworkConditions,

    /// Random seed for reproducible runs; `None` seeds from entropy
    pub seed: Option<u64>,
}

impl SimulatorConfig {
    pub fn new(conditions: NetworkConditions) -> Self {
        Self {
            conditions,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Network simulator statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SimulatorStats {
    pub packets_processed: u64,
    pub packets_dropped: u64,
    /// Deliveries made, duplicates included
    pub packets_delivered: u64,
    pub packets_duplicated: u64,
    /// Deliveries flagged for corruption, duplicates included
    pub packets_corrupted: u64,
    pub packets_reordered: u64,
    /// Packets scheduled with a non-zero delay
    pub packets_delayed: u64,
    pub callback_errors: u64,
    pub queue_len: usize,
    pub elapsed: Duration,
    /// dropped / processed
    pub drop_rate: f64,
    /// delivered / processed; exceeds 1.0 when duplicates are delivered
    pub delivery_rate: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    processed: u64,
    dropped: u64,
    delivered: u64,
    duplicated: u64,
    corrupted: u64,
    reordered: u64,
    delayed: u64,
    callback_errors: u64,
}

struct SimState {
    queue: DeliveryQueue,
    rng: StdRng,
    counters: Counters,
    started_at: Option<Instant>,
}

struct Shared {
    state: Mutex<SimState>,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct LoopTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Simulates an impaired network path between two endpoints.
///
/// Lifecycle is `stopped -> running -> stopped`. [`start`](Self::start)
/// while running is a no-op; [`stop`](Self::stop) joins the delivery task
/// and discards whatever is still queued.
///
/// # Example
///
/// ```ignore
/// use netsim::{NetworkConditions, NetworkSimulator, SimulatorConfig};
/// use std::sync::Arc;
///
/// let conditions = NetworkConditions::default()
///     .with_packet_loss(0.1)   // 10% loss
///     .with_latency_ms(40.0)
///     .with_jitter_ms(20.0);   // ±20ms
/// let config = SimulatorConfig::new(conditions).with_seed(42);
///
/// let sim = NetworkSimulator::new(config, Arc::new(|packet, dup, corrupt| {
///     println!("seq={} dup={} corrupt={}", packet.sequence, dup, corrupt);
///     Ok(())
/// }));
/// sim.start();
/// sim.process_packet(packet);
/// sim.stop().await;
/// ```
pub struct NetworkSimulator {
    // ---
    conditions: NetworkConditions,
    shared: Arc<Shared>,
    callback: DeliveryCallback,
    metrics: Option<MetricsContext>,
    running: AtomicBool,
    task: Mutex<Option<LoopTask>>,
}

impl NetworkSimulator {
    // ---
    pub fn new(config: SimulatorConfig, callback: DeliveryCallback) -> Self {
        // ---
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            conditions: config.conditions,
            shared: Arc::new(Shared {
                state: Mutex::new(SimState {
                    queue: DeliveryQueue::new(),
                    rng,
                    counters: Counters::default(),
                    started_at: None,
                }),
                wake: Notify::new(),
            }),
            callback,
            metrics: None,
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn conditions(&self) -> &NetworkConditions {
        &self.conditions
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the delivery loop. No-op if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        // ---
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Network simulator already running");
            return;
        }

        self.shared.lock().started_at = Some(Instant::now());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(delivery_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.callback),
            self.metrics.clone(),
            shutdown_rx,
        ));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(LoopTask { shutdown, handle });

        let c = &self.conditions;
        info!(
            "Network simulator started: loss={:.1}% latency={}ms jitter=±{}ms dup={:.1}% reorder={:.1}% corrupt={:.1}%",
            c.packet_loss() * 100.0,
            c.latency_ms(),
            c.jitter_ms(),
            c.duplicate_prob() * 100.0,
            c.reorder_prob() * 100.0,
            c.corrupt_prob() * 100.0
        );
    }

    /// Stops the delivery loop, waits for it to exit, then discards every
    /// pending delivery. Safe to call repeatedly.
    pub async fn stop(&self) {
        // ---
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.running.store(false, Ordering::SeqCst);

        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                error!("Network simulator delivery loop ended abnormally: {}", e);
            }
        }

        let discarded = self.shared.lock().queue.clear();
        if discarded > 0 {
            info!("Network simulator stopped, {} pending deliveries discarded", discarded);
        } else {
            debug!("Network simulator stopped");
        }
    }

    /// Runs one packet through the impairment pipeline.
    ///
    /// Returns `false` if the packet was lost, `true` if at least one
    /// delivery was scheduled. Steps, in order: loss, latency and jitter,
    /// reorder hold-back, corruption flag, enqueue, duplication.
    pub fn process_packet(&self, packet: RtpPacket) -> bool {
        // ---
        let c = self.conditions;
        let now = Instant::now();

        let mut guard = self.shared.lock();
        let state = &mut *guard;
        state.counters.processed += 1;
        if let Some(m) = &self.metrics {
            m.sim_processed_total.inc();
        }

        // Loss is decided first so a dropped packet costs nothing further.
        if state.rng.gen::<f64>() < c.packet_loss() {
            state.counters.dropped += 1;
            if let Some(m) = &self.metrics {
                m.sim_dropped_total.inc();
            }
            trace!("Dropped packet seq={}", packet.sequence);
            return false;
        }

        let mut delay_ms = c.latency_ms();
        if c.jitter_ms() > 0.0 {
            delay_ms += state.rng.gen_range(-c.jitter_ms()..=c.jitter_ms());
        }
        delay_ms = delay_ms.max(0.0);

        if state.rng.gen::<f64>() < c.reorder_prob() {
            delay_ms += state.rng.gen_range(REORDER_DELAY_MS.0..=REORDER_DELAY_MS.1);
            state.counters.reordered += 1;
            if let Some(m) = &self.metrics {
                m.sim_reordered_total.inc();
            }
        }
        if delay_ms > 0.0 {
            state.counters.delayed += 1;
        }

        let is_corrupted = state.rng.gen::<f64>() < c.corrupt_prob();
        let deliver_at = now + millis(delay_ms);

        // The duplicate shares the corruption roll; its bytes are mangled
        // independently when it is delivered.
        let duplicate_at = if state.rng.gen::<f64>() < c.duplicate_prob() {
            let offset_ms = state
                .rng
                .gen_range(DUPLICATE_OFFSET_MS.0..=DUPLICATE_OFFSET_MS.1);
            Some(deliver_at + millis(offset_ms))
        } else {
            None
        };

        trace!(
            "Scheduled seq={} in {:.1}ms corrupt={} dup={}",
            packet.sequence,
            delay_ms,
            is_corrupted,
            duplicate_at.is_some()
        );

        if let Some(at) = duplicate_at {
            state.queue.push(ScheduledDelivery {
                packet: packet.clone(),
                deliver_at: at,
                submitted_at: now,
                is_duplicate: true,
                is_corrupted,
            });
            state.counters.duplicated += 1;
            if let Some(m) = &self.metrics {
                m.sim_duplicated_total.inc();
            }
        }

        state.queue.push(ScheduledDelivery {
            packet,
            deliver_at,
            submitted_at: now,
            is_duplicate: false,
            is_corrupted,
        });

        if is_corrupted {
            let flagged = 1 + u64::from(duplicate_at.is_some());
            state.counters.corrupted += flagged;
            if let Some(m) = &self.metrics {
                m.sim_corrupted_total.inc_by(flagged);
            }
        }

        drop(guard);
        self.shared.wake.notify_one();
        true
    }

    /// Waits until the delivery queue is empty or `timeout` passes.
    ///
    /// Returns whether the queue drained.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        // ---
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.lock().queue.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn stats(&self) -> SimulatorStats {
        // ---
        let state = self.shared.lock();
        let c = state.counters;
        let ratio = |n: u64| {
            if c.processed > 0 {
                n as f64 / c.processed as f64
            } else {
                0.0
            }
        };

        SimulatorStats {
            packets_processed: c.processed,
            packets_dropped: c.dropped,
            packets_delivered: c.delivered,
            packets_duplicated: c.duplicated,
            packets_corrupted: c.corrupted,
            packets_reordered: c.reordered,
            packets_delayed: c.delayed,
            callback_errors: c.callback_errors,
            queue_len: state.queue.len(),
            elapsed: state
                .started_at
                .map(|t| t.elapsed())
                .unwrap_or_default(),
            drop_rate: ratio(c.dropped),
            delivery_rate: ratio(c.delivered),
        }
    }
}

impl Drop for NetworkSimulator {
    fn drop(&mut self) {
        // ---
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
        }
    }
}

async fn delivery_loop(
    shared: Arc<Shared>,
    callback: DeliveryCallback,
    metrics: Option<MetricsContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    // ---
    loop {
        if *shutdown.borrow() {
            break;
        }

        let now = Instant::now();
        let (due, next_deadline) = {
            let mut guard = shared.lock();
            let state = &mut *guard;
            match state.queue.pop_due(now) {
                Some(mut delivery) => {
                    if delivery.is_corrupted {
                        let touched = delivery.packet.corrupt_payload(&mut state.rng);
                        debug!(
                            "Corrupted seq={} payload offsets {:?}",
                            delivery.packet.sequence, touched
                        );
                    }
                    state.counters.delivered += 1;
                    (Some(delivery), None)
                }
                None => (None, state.queue.peek_min().map(|d| d.deliver_at)),
            }
        };

        if let Some(delivery) = due {
            if let Some(m) = &metrics {
                m.sim_delivered_total.inc();
                m.network_transit_seconds
                    .observe(now.saturating_duration_since(delivery.submitted_at).as_secs_f64());
            }

            let sequence = delivery.packet.sequence;
            if let Err(e) = callback(delivery.packet, delivery.is_duplicate, delivery.is_corrupted)
            {
                error!("Delivery callback failed for seq={}: {:#}", sequence, e);
                shared.lock().counters.callback_errors += 1;
            }
            continue;
        }

        let wait = next_deadline.map_or(MAX_TICK, |at| {
            at.saturating_duration_since(now).min(MAX_TICK)
        });

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = time::sleep(wait) => {}
            _ = shared.wake.notified() => {}
        }
    }
}

/// Converts a scheduling delay, capping anything a `Duration` cannot hold.
fn millis(ms: f64) -> Duration {
    // ---
    Duration::try_from_secs_f64(ms.max(0.0) / 1000.0)
        .unwrap_or_else(|_| Duration::from_millis(2 * MAX_DELAY_MS as u64))
}
