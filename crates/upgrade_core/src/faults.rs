//! Deterministic fault injection for crash/resume tests.
//!
//! A `FaultInjector` is a cloneable handle; every component that hosts an
//! injection point receives one at construction. Handles created with
//! [`FaultInjector::disabled`] never fire, which is what production wiring
//! uses unless `UPGRADE_FAULT_POINTS` is set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Trigger budget meaning "fire on every query".
pub const UNLIMITED: u32 = u32::MAX;

#[derive(Clone, Default)]
pub struct FaultInjector {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    enabled: AtomicBool,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    /// Times each point has fired so far.
    counts: HashMap<String, u32>,
    /// Budgets consulted by `fire`.
    budgets: HashMap<String, u32>,
}

impl FaultInjector {
    /// A handle that never fires.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A handle that is already enabled with no armed points.
    pub fn enabled() -> Self {
        let faults = Self::default();
        faults.enable();
        faults
    }

    /// Parse `name=count,name=unlimited,...`. An empty spec yields a disabled handle.
    pub fn from_spec(spec: &str) -> anyhow::Result<Self> {
        let faults = Self::disabled();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, max) = entry
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("fault point {entry:?} must be name=count"))?;
            let max = match max.trim() {
                "unlimited" | "*" => UNLIMITED,
                raw => raw
                    .parse::<u32>()
                    .map_err(|err| anyhow::anyhow!("fault point {name:?} count {raw:?}: {err}"))?,
            };
            faults.arm(name.trim(), max);
        }
        Ok(faults)
    }

    /// Turn the harness on. There is no way back.
    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Give `name` a budget for [`fire`](Self::fire) and enable the harness.
    pub fn arm(&self, name: &str, max: u32) {
        self.registry().budgets.insert(name.to_string(), max);
        self.enable();
    }

    /// Whether the caller should behave as if a fault happened at `name`.
    ///
    /// False while disabled. With `max == UNLIMITED` always true; otherwise
    /// true while the point has fired fewer than `max` times.
    pub fn insert(&self, name: &str, max: u32) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if max == UNLIMITED {
            return true;
        }
        let mut registry = self.registry();
        let count = registry.counts.entry(name.to_string()).or_insert(0);
        if *count < max {
            *count += 1;
            tracing::warn!(point = name, hit = *count, max, "fault injected");
            true
        } else {
            false
        }
    }

    /// `insert` with the budget armed for `name`, or zero if it was never armed.
    pub fn fire(&self, name: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let max = self.registry().budgets.get(name).copied().unwrap_or(0);
        self.insert(name, max)
    }

    /// Times `name` has fired with a bounded budget.
    pub fn hits(&self, name: &str) -> u32 {
        self.registry().counts.get(name).copied().unwrap_or(0)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjector")
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}
