//! State shared between the probe's spin loop and its signal handlers.
//!
//! Every field has a single writer:
//!
//! | field                  | writer                 | reader                  |
//! |------------------------|------------------------|-------------------------|
//! | `first`, `second`      | spin loop              | `SIGALRM` handler       |
//! | `counts`, `repetitions`| `SIGALRM` handler      | spin loop (after stop)  |
//! | `sampled`              | both (clear / set)     | spin loop               |
//! | `output_enabled`       | `SIGUSR1`/`SIGUSR2`    | main context at exit    |
//!
//! `sampled` is cleared by the loop only while no timer is armed, so the two
//! writers never overlap. All accesses are plain atomic loads and stores; no
//! locks are taken, which keeps the handler side async-signal-safe.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering, compiler_fence};

/// One of the four states the pair can be observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// `(0,0)`: fully written zero.
    BothZero,
    /// `(0,1)`: first field already reset, second still one.
    TornZeroOne,
    /// `(1,0)`: first field already set, second still zero.
    TornOneZero,
    /// `(1,1)` and anything else: fully written one.
    BothOne,
}

impl Outcome {
    pub const ALL: [Outcome; 4] = [
        Outcome::BothZero,
        Outcome::TornZeroOne,
        Outcome::TornOneZero,
        Outcome::BothOne,
    ];

    /// Classify an observed pair. Comparison order is fixed: 00, 01, 10, else 11.
    pub const fn classify(first: i32, second: i32) -> Self {
        if first == 0 && second == 0 {
            Outcome::BothZero
        } else if first == 0 && second == 1 {
            Outcome::TornZeroOne
        } else if first == 1 && second == 0 {
            Outcome::TornOneZero
        } else {
            Outcome::BothOne
        }
    }

    pub const fn index(self) -> usize {
        match self {
            Outcome::BothZero => 0,
            Outcome::TornZeroOne => 1,
            Outcome::TornOneZero => 2,
            Outcome::BothOne => 3,
        }
    }

    /// Two-character label used in the report line.
    pub const fn label(self) -> &'static str {
        match self {
            Outcome::BothZero => "00",
            Outcome::TornZeroOne => "01",
            Outcome::TornOneZero => "10",
            Outcome::BothOne => "11",
        }
    }

    pub const fn is_torn(self) -> bool {
        matches!(self, Outcome::TornZeroOne | Outcome::TornOneZero)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Snapshot of the four outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeStats {
    counts: [u64; 4],
}

impl OutcomeStats {
    pub const fn new(counts: [u64; 4]) -> Self {
        Self { counts }
    }

    pub const fn count(&self, outcome: Outcome) -> u64 {
        self.counts[outcome.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn torn(&self) -> u64 {
        self.count(Outcome::TornZeroOne) + self.count(Outcome::TornOneZero)
    }
}

/// The two-field value, its outcome counters and the probe's control flags.
#[derive(Debug)]
pub struct SharedPairStore {
    first: AtomicI32,
    second: AtomicI32,
    counts: [AtomicU64; 4],
    repetitions: AtomicU64,
    budget: AtomicU64,
    sampled: AtomicBool,
    output_enabled: AtomicBool,
}

impl Default for SharedPairStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedPairStore {
    /// Empty store with output enabled and a zero budget.
    pub const fn new() -> Self {
        Self {
            first: AtomicI32::new(0),
            second: AtomicI32::new(0),
            counts: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            repetitions: AtomicU64::new(0),
            budget: AtomicU64::new(0),
            sampled: AtomicBool::new(false),
            output_enabled: AtomicBool::new(true),
        }
    }

    /// Reset every field for a fresh run. Must happen before handlers are installed.
    pub fn reset(&self, budget: u64) {
        self.store_pair(0);
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
        self.repetitions.store(0, Ordering::Relaxed);
        self.budget.store(budget, Ordering::Relaxed);
        self.sampled.store(false, Ordering::Relaxed);
        self.output_enabled.store(true, Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
    }

    /// Write both fields to `value` as two separate stores.
    ///
    /// The window between the stores is what the timer handler is trying to hit.
    #[inline]
    pub fn store_pair(&self, value: i32) {
        self.first.store(value, Ordering::Relaxed);
        self.second.store(value, Ordering::Relaxed);
    }

    pub fn load_pair(&self) -> (i32, i32) {
        (
            self.first.load(Ordering::Relaxed),
            self.second.load(Ordering::Relaxed),
        )
    }

    /// Timer handler body: classify the pair and count one repetition.
    ///
    /// Restricted context. Fixed-size atomic operations only.
    pub fn record_sample(&self) {
        compiler_fence(Ordering::SeqCst);
        let (first, second) = self.load_pair();
        let outcome = Outcome::classify(first, second);
        self.counts[outcome.index()].fetch_add(1, Ordering::Relaxed);

        let done = self.repetitions.load(Ordering::Relaxed);
        if done < self.budget.load(Ordering::Relaxed) {
            self.repetitions.store(done + 1, Ordering::Relaxed);
        }
        self.sampled.store(true, Ordering::Release);
        compiler_fence(Ordering::SeqCst);
    }

    /// Gate handler body. Last writer wins.
    pub fn set_output(&self, enabled: bool) {
        self.output_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::Relaxed)
    }

    /// Clear the interrupt flag before arming the next sample.
    pub fn begin_repetition(&self) {
        self.sampled.store(false, Ordering::Release);
    }

    pub fn sampled(&self) -> bool {
        self.sampled.load(Ordering::Acquire)
    }

    pub fn repetitions(&self) -> u64 {
        self.repetitions.load(Ordering::Acquire)
    }

    pub fn budget(&self) -> u64 {
        self.budget.load(Ordering::Relaxed)
    }

    pub fn budget_reached(&self) -> bool {
        self.repetitions() >= self.budget()
    }

    /// Read the counters. Only meaningful once no timer is pending.
    pub fn stats(&self) -> OutcomeStats {
        compiler_fence(Ordering::SeqCst);
        let mut counts = [0; 4];
        for (slot, count) in counts.iter_mut().zip(&self.counts) {
            *slot = count.load(Ordering::Acquire);
        }
        OutcomeStats::new(counts)
    }
}
