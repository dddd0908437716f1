//! Tests inter-composants du noyau PMS (voir `tests/`).
//!
//! Les doublures propres aux tests de récupération process vivent ici.

use parking_lot::Mutex;
use pms_kernel::monitor::{MonitorError, ResourceSample, ResourceSampler};
use std::collections::VecDeque;
use std::sync::Arc;
use time::OffsetDateTime;

/// Échantillonneur rejouant une liste fixe, puis le dernier échantillon indéfiniment
#[derive(Clone)]
pub struct ScriptedSampler {
    samples: Arc<Mutex<VecDeque<ResourceSample>>>,
    last: Arc<Mutex<Option<ResourceSample>>>,
}

impl ScriptedSampler {
    pub fn new(samples: impl IntoIterator<Item = ResourceSample>) -> Self {
        Self {
            samples: Arc::new(Mutex::new(samples.into_iter().collect())),
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub fn push(&self, sample: ResourceSample) {
        self.samples.lock().push_back(sample);
    }
}

impl ResourceSampler for ScriptedSampler {
    fn sample(&mut self) -> Result<ResourceSample, MonitorError> {
        let next = self.samples.lock().pop_front();
        let mut last = self.last.lock();
        if let Some(sample) = next {
            *last = Some(sample);
        }
        (*last).ok_or_else(|| MonitorError::Sampling("no scripted sample".into()))
    }
}

pub fn sample(memory_mb: f64, cpu_percent: f32, thread_count: u32) -> ResourceSample {
    ResourceSample {
        timestamp: OffsetDateTime::now_utc(),
        memory_bytes: (memory_mb * 1024.0 * 1024.0) as u64,
        cpu_percent,
        thread_count,
    }
}

/// CPU et threads au-delà des seuils par défaut
pub fn critical_sample() -> ResourceSample {
    sample(100.0, 95.0, 5000)
}

pub fn healthy_sample() -> ResourceSample {
    sample(100.0, 5.0, 8)
}
