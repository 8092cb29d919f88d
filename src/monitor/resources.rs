// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process resource readings.
//!
//! [`ProcessSampler`] reads the current process through `sysinfo`.
//! [`ScriptedSampler`] is a test double that replays fixed readings; it
//! never reports real telemetry.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use sysinfo::{Pid, System};

/// One reading of the current process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Real readings for this process via `sysinfo`.
pub struct ProcessSampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessSampler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for ProcessSampler {
    /// CPU usage is relative to the previous call, so the first reading is 0.
    fn sample(&self) -> ResourceSample {
        let Some(pid) = self.pid else {
            return ResourceSample::default();
        };
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return ResourceSample::default();
        }
        system
            .process(pid)
            .map(|p| ResourceSample {
                memory_mb: p.memory() as f64 / (1024.0 * 1024.0),
                cpu_percent: f64::from(p.cpu_usage()),
            })
            .unwrap_or_default()
    }
}

/// Replays queued readings, then repeats the last one.
#[derive(Default)]
pub struct ScriptedSampler {
    queue: Mutex<VecDeque<ResourceSample>>,
    last: Mutex<ResourceSample>,
}

impl ScriptedSampler {
    #[must_use]
    pub fn new(samples: impl IntoIterator<Item = ResourceSample>) -> Self {
        Self {
            queue: Mutex::new(samples.into_iter().collect()),
            last: Mutex::new(ResourceSample::default()),
        }
    }

    /// Always report the same reading
    #[must_use]
    pub fn constant(memory_mb: f64, cpu_percent: f64) -> Self {
        Self::new([ResourceSample { memory_mb, cpu_percent }])
    }
}

impl ResourceSampler for ScriptedSampler {
    fn sample(&self) -> ResourceSample {
        let mut last = self.last.lock();
        if let Some(next) = self.queue.lock().pop_front() {
            *last = next;
        }
        *last
    }
}
