//! Wall-clock measurement of device work and the deadline that cuts a
//! micro-step short.
//!
//! Device kernels run asynchronously, so reading the host clock alone would
//! under-count time whenever the queue is backlogged. [`StepClock`] records a
//! marker on the device stream at every reading and blocks on the oldest
//! marker still in its look-back window before reading the clock.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    time::{Duration, Instant},
};

use bert::{ForwardHook, Interrupted};
use candle_core::Device;
use thiserror::Error;
use tracing::{debug, warn};

/// Queue of device work that can be fenced with markers.
pub trait DeviceStream {
    type Marker: fmt::Debug;

    /// Enqueues a marker behind all work submitted so far.
    fn record(&self) -> Self::Marker;

    /// Blocks until all work queued before `marker` has finished.
    fn wait(&self, marker: &Self::Marker);
}

/// Stream for host-synchronous execution; markers are free.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostStream;

impl DeviceStream for HostStream {
    type Marker = ();

    fn record(&self) -> Self::Marker {}

    fn wait(&self, _marker: &Self::Marker) {}
}

/// Markers on a candle device. candle exposes a full-device fence only, so a
/// marker is a sequence number and one fence satisfies every marker recorded
/// before it.
#[derive(Debug)]
pub struct CandleStream {
    device: Device,
    recorded: Cell<u64>,
    fenced: Cell<u64>,
}

impl CandleStream {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            recorded: Cell::new(0),
            fenced: Cell::new(0),
        }
    }
}

impl DeviceStream for CandleStream {
    type Marker = u64;

    fn record(&self) -> u64 {
        let next = self.recorded.get() + 1;
        self.recorded.set(next);
        next
    }

    fn wait(&self, marker: &u64) {
        if *marker <= self.fenced.get() {
            return;
        }
        if let Err(err) = self.device.synchronize() {
            warn!(error = %err, "device synchronization failed; timing may under-count");
        }
        self.fenced.set(self.recorded.get());
    }
}

/// Timer that accounts for queued device work.
#[derive(Debug)]
pub struct StepClock<S: DeviceStream = HostStream> {
    stream: S,
    markers: VecDeque<S::Marker>,
    capacity: usize,
    started_at: Option<Instant>,
}

impl<S: DeviceStream> StepClock<S> {
    /// `look_back` is how many newer markers may stay in flight while the
    /// clock blocks on an older one; at most `look_back + 1` are retained.
    pub fn new(stream: S, look_back: usize) -> Self {
        let capacity = look_back + 1;
        Self {
            stream,
            markers: VecDeque::with_capacity(capacity),
            capacity,
            started_at: None,
        }
    }

    fn sync(&mut self) {
        if self.markers.len() == self.capacity {
            self.markers.pop_front();
        }
        self.markers.push_back(self.stream.record());
        if let Some(oldest) = self.markers.front() {
            self.stream.wait(oldest);
        }
    }

    pub fn start(&mut self) {
        self.sync();
        self.started_at = Some(Instant::now());
    }

    /// Time since [`start`](Self::start), or zero if the clock was never started.
    pub fn elapsed(&mut self) -> Duration {
        let Some(started_at) = self.started_at else {
            return Duration::ZERO;
        };
        self.sync();
        started_at.elapsed()
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// Un-starts the clock. Outstanding markers are kept.
    pub fn reset(&mut self) {
        self.started_at = None;
    }

    pub fn outstanding_markers(&self) -> usize {
        self.markers.len()
    }
}

/// Raised when a hooked sub-module finishes after the step budget ran out.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("compute timeout at {label}: {elapsed:?} elapsed, threshold {threshold:?}")]
pub struct ComputeTimeout {
    pub label: String,
    pub elapsed: Duration,
    pub threshold: Duration,
}

/// Deadline policy over a [`StepClock`]. Used as the forward hook of the
/// model, so it is driven through shared references.
#[derive(Debug)]
pub struct DeadlineGuard<S: DeviceStream = HostStream> {
    clock: RefCell<StepClock<S>>,
    enabled: Cell<bool>,
    threshold: Cell<Duration>,
    debug: Cell<bool>,
    dropped: Cell<bool>,
    last_timeout: RefCell<Option<ComputeTimeout>>,
}

impl<S: DeviceStream> DeadlineGuard<S> {
    pub fn new(stream: S, look_back: usize) -> Self {
        Self {
            clock: RefCell::new(StepClock::new(stream, look_back)),
            enabled: Cell::new(false),
            threshold: Cell::new(Duration::ZERO),
            debug: Cell::new(false),
            dropped: Cell::new(false),
            last_timeout: RefCell::new(None),
        }
    }

    pub fn configure(&self, enabled: bool, threshold: Duration, debug: bool) {
        self.enabled.set(enabled);
        self.threshold.set(threshold);
        self.debug.set(debug);
    }

    pub fn start(&self) {
        self.clock.borrow_mut().start();
    }

    /// Clears `dropped` and un-starts the timer.
    pub fn reset(&self) {
        self.dropped.set(false);
        self.last_timeout.borrow_mut().take();
        self.clock.borrow_mut().reset();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn is_started(&self) -> bool {
        self.clock.borrow().is_started()
    }

    pub fn dropped(&self) -> bool {
        self.dropped.get()
    }

    pub fn threshold(&self) -> Duration {
        self.threshold.get()
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.borrow_mut().elapsed()
    }

    /// No-op until started. Afterwards, fails with [`ComputeTimeout`] and
    /// marks the step dropped when enabled and past the threshold.
    pub fn check_or_signal(&self, label: &str) -> Result<(), ComputeTimeout> {
        if !self.is_started() {
            return Ok(());
        }
        let elapsed = self.elapsed();
        let threshold = self.threshold.get();
        if self.enabled.get() && elapsed > threshold {
            self.dropped.set(true);
            if self.debug.get() {
                debug!(
                    module = label,
                    elapsed_s = elapsed.as_secs_f64(),
                    threshold_s = threshold.as_secs_f64(),
                    "reached timeout"
                );
            }
            return Err(ComputeTimeout {
                label: label.to_string(),
                elapsed,
                threshold,
            });
        }
        Ok(())
    }

    /// The timeout raised through the hook interface since the last reset.
    pub fn take_timeout(&self) -> Option<ComputeTimeout> {
        self.last_timeout.borrow_mut().take()
    }
}

impl<S: DeviceStream> ForwardHook for DeadlineGuard<S> {
    fn on_forward(&self, label: &str) -> Result<(), Interrupted> {
        self.check_or_signal(label).map_err(|timeout| {
            let label = timeout.label.clone();
            *self.last_timeout.borrow_mut() = Some(timeout);
            Interrupted { label }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{rc::Rc, thread};

    #[derive(Debug, Default)]
    struct CountingStream {
        next: Cell<usize>,
        waited: Rc<RefCell<Vec<usize>>>,
    }

    impl DeviceStream for CountingStream {
        type Marker = usize;

        fn record(&self) -> usize {
            let id = self.next.get();
            self.next.set(id + 1);
            id
        }

        fn wait(&self, marker: &usize) {
            self.waited.borrow_mut().push(*marker);
        }
    }

    #[test]
    fn elapsed_is_zero_before_start() {
        let mut clock = StepClock::new(HostStream, 9);
        assert_eq!(clock.elapsed(), Duration::ZERO);
        assert!(!clock.is_started());
        assert_eq!(clock.outstanding_markers(), 0);
    }

    #[test]
    fn elapsed_is_monotonic_after_start() {
        let mut clock = StepClock::new(HostStream, 2);
        clock.start();
        let mut previous = clock.elapsed();
        for _ in 0..50 {
            let current = clock.elapsed();
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn marker_history_is_bounded_and_waits_on_oldest() {
        let waited = Rc::new(RefCell::new(Vec::new()));
        let stream = CountingStream {
            next: Cell::new(0),
            waited: Rc::clone(&waited),
        };
        let mut clock = StepClock::new(stream, 2);
        clock.start();
        for _ in 0..6 {
            clock.elapsed();
            assert!(clock.outstanding_markers() <= 3);
        }
        assert_eq!(clock.outstanding_markers(), 3);
        // Markers 0..=6 were recorded; once the window is full the clock
        // blocks on the marker recorded two readings earlier.
        assert_eq!(waited.borrow().as_slice(), &[0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn candle_stream_fences_once_per_backlog() {
        let stream = CandleStream::new(Device::Cpu);
        let first = stream.record();
        let second = stream.record();
        stream.wait(&first);
        assert_eq!(stream.fenced.get(), 2);
        stream.wait(&second);
        assert_eq!(stream.fenced.get(), 2);
    }

    #[test]
    fn guard_over_custom_stream_is_debug_printable() {
        let guard = DeadlineGuard::new(CountingStream::default(), 3);
        guard.start();
        guard.elapsed();
        let printed = format!("{guard:?}");
        assert!(printed.starts_with("DeadlineGuard"));
        assert!(printed.contains("markers"));
    }

    #[test]
    fn unstarted_guard_never_signals() {
        let guard = DeadlineGuard::new(HostStream, 9);
        guard.configure(true, Duration::ZERO, false);
        assert!(guard.check_or_signal("bert.embeddings_fwd").is_ok());
        assert!(!guard.dropped());
    }

    #[test]
    fn disabled_guard_never_signals() {
        let guard = DeadlineGuard::new(HostStream, 9);
        guard.configure(false, Duration::ZERO, false);
        guard.start();
        thread::sleep(Duration::from_millis(1));
        assert!(guard.check_or_signal("loss_fn_fwd").is_ok());
        assert!(!guard.dropped());
    }

    #[test]
    fn overrun_signals_and_reset_clears() {
        let guard = DeadlineGuard::new(HostStream, 9);
        guard.configure(true, Duration::ZERO, true);
        guard.start();
        thread::sleep(Duration::from_millis(1));

        let timeout = guard.check_or_signal("bert.pooler_fwd").unwrap_err();
        assert_eq!(timeout.label, "bert.pooler_fwd");
        assert!(timeout.elapsed > timeout.threshold);
        assert!(guard.dropped());

        guard.reset();
        assert!(!guard.dropped());
        assert!(!guard.is_started());
        assert_eq!(guard.elapsed(), Duration::ZERO);
    }

    #[test]
    fn hook_interface_records_timeout() {
        let guard = DeadlineGuard::new(HostStream, 9);
        guard.configure(true, Duration::ZERO, false);
        guard.start();
        thread::sleep(Duration::from_millis(1));

        let err = guard.on_forward("bert.encoder.layer.0_fwd").unwrap_err();
        assert_eq!(err.label, "bert.encoder.layer.0_fwd");
        let recorded = guard.take_timeout().unwrap();
        assert_eq!(recorded.label, err.label);
        assert!(guard.take_timeout().is_none());
    }

    #[test]
    fn generous_threshold_passes() {
        let guard = DeadlineGuard::new(HostStream, 9);
        guard.configure(true, Duration::from_secs(3600), false);
        guard.start();
        assert!(guard.check_or_signal("bert.embeddings_fwd").is_ok());
        assert!(!guard.dropped());
    }
}
