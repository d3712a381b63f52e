use crate::tier::scan::{HealthReport, HealthSummary};
use crate::tier::util::age_display;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CachedAudit {
    report: Arc<HealthReport>,
    summary: HealthSummary,
    computed_at: Instant,
    computed_at_wall: DateTime<Utc>,
}

/// Read-through cache in front of the tier audit. Owned by one
/// `MaintenanceService`; the mutex also keeps two pollers from walking the
/// tiers at the same time.
#[derive(Debug)]
pub struct AuditCache {
    ttl: Duration,
    slot: Mutex<Option<CachedAudit>>,
}

impl AuditCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, Option<CachedAudit>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached report while it is younger than the TTL, otherwise
    /// compute a fresh one under the lock.
    pub fn get_or_compute<E>(
        &self,
        force_refresh: bool,
        compute: impl FnOnce() -> Result<HealthReport, E>,
    ) -> Result<(Arc<HealthReport>, DateTime<Utc>), E> {
        let mut slot = self.lock();
        if !force_refresh {
            if let Some(cached) = slot.as_ref() {
                if cached.computed_at.elapsed() < self.ttl {
                    return Ok((cached.report.clone(), cached.computed_at_wall));
                }
            }
        }

        let report = Arc::new(compute()?);
        let computed_at_wall = Utc::now();
        *slot = Some(CachedAudit {
            summary: report.health_summary(),
            report: report.clone(),
            computed_at: Instant::now(),
            computed_at_wall,
        });
        Ok((report, computed_at_wall))
    }

    pub fn cached_summary(&self) -> Option<HealthSummary> {
        let slot = self.lock();
        slot.as_ref()
            .filter(|c| c.computed_at.elapsed() < self.ttl)
            .map(|c| c.summary.clone())
    }

    pub fn invalidate(&self) {
        *self.lock() = None;
    }

    pub fn age_display(&self) -> Option<String> {
        let slot = self.lock();
        slot.as_ref()
            .map(|c| age_display(Utc::now().signed_duration_since(c.computed_at_wall).num_seconds()))
    }
}
