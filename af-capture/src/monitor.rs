//! Periodic performance sampling of a VM during a capture.

use crate::error::{CaptureError, Result};
use crate::status::Status;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Reads performance counters of one VM.
#[async_trait]
pub trait PerfSampler: Send + Sync {
    /// Seconds between samples the backend can provide.
    fn refresh_rate(&self) -> u32;

    async fn sample(&self, moid: &str) -> Result<BTreeMap<String, i64>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTicket {
    pub id: u64,
    pub refresh_rate: u32,
}

#[derive(Clone)]
pub struct JobMonitor {
    sampler: Arc<dyn PerfSampler>,
    jobs: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
}

impl JobMonitor {
    pub fn new(sampler: Arc<dyn PerfSampler>) -> Self {
        Self {
            sampler,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a first sample, then keep sampling into `status` until stopped.
    pub async fn start_monitoring(&self, moid: &str, status: Status) -> Result<MonitorTicket> {
        let refresh_rate = self.sampler.refresh_rate().max(1);
        let first = self.sampler.sample(moid).await?;
        status.set_refresh_rate(refresh_rate);
        status.update_perf(Utc::now(), first);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sampler = self.sampler.clone();
        let moid = moid.to_string();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(refresh_rate.into()));
            interval.tick().await;
            loop {
                interval.tick().await;
                match sampler.sample(&moid).await {
                    Ok(values) => status.update_perf(Utc::now(), values),
                    Err(e) => debug!("Performance sample of {} failed: {}", moid, e),
                }
            }
        });
        self.jobs().insert(id, handle);
        Ok(MonitorTicket { id, refresh_rate })
    }

    pub fn stop_monitoring(&self, ticket: MonitorTicket) -> Result<()> {
        match self.jobs().remove(&ticket.id) {
            Some(handle) => {
                handle.abort();
                Ok(())
            }
            None => {
                warn!("No performance monitor with id {}", ticket.id);
                Err(CaptureError::InvalidState(format!(
                    "Unknown monitor {}",
                    ticket.id
                )))
            }
        }
    }

    pub fn active(&self) -> usize {
        self.jobs().len()
    }
}
