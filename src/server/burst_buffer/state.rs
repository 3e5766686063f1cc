use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;
use tokio::sync::Notify;

use crate::common::timeutils::now_secs;
use crate::server::burst_buffer::config::BbConfig;
use crate::server::job::{JobRecord, JobTable, NICE_OFFSET};
use crate::{JobId, Map, UserId};

/// Lifecycle of a burst buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BbAllocState {
    Allocated = 1,
    StagingIn = 2,
    StagedIn = 3,
    StagingOut = 4,
    StagedOut = 5,
}

impl BbAllocState {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Allocated),
            2 => Some(Self::StagingIn),
            3 => Some(Self::StagedIn),
            4 => Some(Self::StagingOut),
            5 => Some(Self::StagedOut),
            _ => None,
        }
    }
}

/// Per-GRES usage attached to a record or to the configured inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BbGres {
    pub name: String,
    pub avail_cnt: u32,
    pub used_cnt: u32,
}

pub type GresList = SmallVec<[BbGres; 4]>;

/// One burst buffer allocation, either tied to a job or named.
#[derive(Debug, Clone)]
pub struct BbAlloc {
    pub name: Option<String>,
    /// 0 for a named buffer without a job.
    pub job_id: JobId,
    pub array_job_id: u32,
    pub array_task_id: u32,
    pub user_id: UserId,
    /// Size in granularity units.
    pub size: u32,
    pub state: BbAllocState,
    pub state_time: u64,
    pub seen_time: u64,
    pub use_time: u64,
    pub end_time: u64,
    pub gres: GresList,
}

#[derive(Debug, Clone, Default)]
pub struct BbUser {
    pub user_id: UserId,
    /// Aggregate size of the user's allocations, in granularity units.
    pub size: u32,
}

/// Wakes long-running burst buffer tasks when the subsystem shuts down.
#[derive(Clone, Default)]
pub struct TermSignal {
    inner: Arc<TermInner>,
}

#[derive(Default)]
struct TermInner {
    flag: AtomicBool,
    notify: Notify,
}

impl TermSignal {
    pub fn terminate(&self) {
        self.inner.flag.store(true, AtomicOrdering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.flag.load(AtomicOrdering::SeqCst)
    }

    /// Pause for up to `duration`, returning early on termination.
    pub async fn sleep(&self, duration: Duration) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_terminated() {
            return;
        }
        let _ = tokio::time::timeout(duration, notified).await;
    }
}

impl std::fmt::Debug for TermSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TermSignal")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Bookkeeping state of the burst buffer subsystem: configuration, space
/// accounting and the per-user allocation and usage tables.
///
/// The operations take no locks of their own; callers hold the appropriate
/// controller locks.
#[derive(Debug, Default)]
pub struct BbState {
    pub config: BbConfig,
    pub total_space: u32,
    pub used_space: u32,
    pub next_end_time: u64,
    pub term: TermSignal,
    allocs: Map<UserId, Vec<BbAlloc>>,
    users: Map<UserId, BbUser>,
}

impl BbState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all cached allocation and user records.
    pub fn clear_cache(&mut self) {
        self.allocs.clear();
        self.users.clear();
    }

    /// Find the allocation record of a specific job, if any.
    pub fn find_job_rec(&self, job: &JobRecord) -> Option<&BbAlloc> {
        let bucket = self.allocs.get(&job.user_id)?;
        for alloc in bucket {
            if alloc.job_id == job.job_id {
                if alloc.user_id == job.user_id {
                    return Some(alloc);
                }
                // Observed after a controller crash recovered a job state
                // that was missing jobs which already had buffers.
                log::error!(
                    "state inconsistent with burst buffer: job {} has UserID mismatch ({} != {})",
                    job.job_id,
                    alloc.user_id,
                    job.user_id
                );
            }
        }
        None
    }

    /// Per-user usage record, created on first reference.
    pub fn find_user_rec(&mut self, user_id: UserId) -> &mut BbUser {
        self.users
            .entry(user_id)
            .or_insert_with(|| BbUser { user_id, size: 0 })
    }

    /// Insert a named allocation record for a user.
    pub fn alloc_name_rec(&mut self, name: &str, user_id: UserId) -> &mut BbAlloc {
        let now = now_secs();
        self.insert_alloc(BbAlloc {
            name: Some(name.to_string()),
            job_id: 0,
            array_job_id: 0,
            array_task_id: 0,
            user_id,
            size: 0,
            state: BbAllocState::Allocated,
            state_time: now,
            seen_time: now,
            use_time: 0,
            end_time: 0,
            gres: GresList::new(),
        })
    }

    /// Insert an allocation record for a job.
    pub fn alloc_job_rec(&mut self, job: &JobRecord, size: u32) -> &mut BbAlloc {
        let now = now_secs();
        self.insert_alloc(BbAlloc {
            name: None,
            job_id: job.job_id,
            array_job_id: job.array_job_id,
            array_task_id: job.array_task_id,
            user_id: job.user_id,
            size,
            state: BbAllocState::Allocated,
            state_time: now,
            seen_time: now,
            use_time: 0,
            end_time: 0,
            gres: GresList::new(),
        })
    }

    /// Allocate a buffer for a job, boosting the job's priority when so
    /// configured, and account the space to the owning user.
    pub fn alloc_job(&mut self, job: &mut JobRecord, size: u32) -> &mut BbAlloc {
        let prio_boost_use = self.config.prio_boost_use;
        if prio_boost_use > 0 {
            apply_use_boost(job, prio_boost_use);
        }
        self.add_load(job.user_id, size);
        self.alloc_job_rec(job, size)
    }

    /// Account an allocation's size to the global and per-user usage.
    pub fn add_user_load(&mut self, alloc: &BbAlloc) {
        self.add_load(alloc.user_id, alloc.size);
    }

    /// Release an allocation's size from the global and per-user usage,
    /// saturating at zero if the books disagree.
    pub fn remove_user_load(&mut self, alloc: &BbAlloc) {
        if self.used_space >= alloc.size {
            self.used_space -= alloc.size;
        } else {
            log::error!(
                "used space underflow releasing buffer for job {}",
                alloc.job_id
            );
            self.used_space = 0;
        }

        let user = self.find_user_rec(alloc.user_id);
        if user.size >= alloc.size {
            user.size -= alloc.size;
        } else {
            log::error!("user {} table underflow", user.user_id);
            user.size = 0;
        }
    }

    /// Remove a job's allocation record, returning it for release
    /// accounting.
    pub fn remove_job_rec(&mut self, job: &JobRecord) -> Option<BbAlloc> {
        let bucket = self.allocs.get_mut(&job.user_id)?;
        let index = bucket
            .iter()
            .position(|alloc| alloc.job_id == job.job_id && alloc.user_id == job.user_id)?;
        Some(bucket.swap_remove(index))
    }

    /// Set each record's `use_time` to the time its use is expected to
    /// begin (the owning job's expected start time) and refresh the
    /// estimate of the next buffer release.
    pub fn set_use_time(&mut self, jobs: &JobTable) {
        let now = now_secs();
        self.next_end_time = now + 60 * 60;
        for bucket in self.allocs.values_mut() {
            for alloc in bucket.iter_mut() {
                if alloc.job_id != 0
                    && matches!(
                        alloc.state,
                        BbAllocState::StagingIn | BbAllocState::StagedIn
                    )
                {
                    match jobs.find_job_record(alloc.job_id) {
                        None => {
                            log::error!(
                                "job {} with allocated burst buffers not found",
                                alloc.job_id
                            );
                            alloc.use_time = now + 24 * 60 * 60;
                        }
                        Some(job) if job.start_time != 0 => {
                            alloc.end_time = job.end_time;
                            alloc.use_time = job.start_time;
                        }
                        Some(_) => {
                            // Start time not yet known
                            alloc.use_time = now + 60 * 60;
                        }
                    }
                } else if alloc.job_id != 0 {
                    if let Some(job) = jobs.find_job_record(alloc.job_id) {
                        alloc.end_time = job.end_time;
                    }
                } else {
                    alloc.use_time = now;
                }
                if alloc.end_time != 0 && alloc.size != 0 {
                    if alloc.end_time <= now {
                        self.next_end_time = now;
                    } else if self.next_end_time > alloc.end_time {
                        self.next_end_time = alloc.end_time;
                    }
                }
            }
        }
    }

    /// Iterate all allocation records, bucket by bucket.
    pub fn allocs(&self) -> impl Iterator<Item = &BbAlloc> {
        self.allocs.values().flatten()
    }

    pub fn user_size(&self, user_id: UserId) -> u32 {
        self.users.get(&user_id).map(|user| user.size).unwrap_or(0)
    }

    fn add_load(&mut self, user_id: UserId, size: u32) {
        self.used_space = self.used_space.saturating_add(size);
        let user = self.find_user_rec(user_id);
        user.size = user.size.saturating_add(size);
    }

    fn insert_alloc(&mut self, alloc: BbAlloc) -> &mut BbAlloc {
        let bucket = self.allocs.entry(alloc.user_id).or_default();
        bucket.push(alloc);
        bucket.last_mut().unwrap()
    }
}

/// Raise a job's priority for burst buffer use; never lowers it.
pub fn apply_use_boost(job: &mut JobRecord, prio_boost_use: u32) {
    let details = match job.details.as_mut() {
        Some(details) => details,
        None => return,
    };
    // prio_boost_use was clamped to NICE_OFFSET at configuration load
    let new_nice = NICE_OFFSET - prio_boost_use as u16;
    if new_nice < details.nice {
        let new_prio = job.priority as i64 + details.nice as i64 - new_nice as i64;
        job.priority = new_prio as u32;
        details.nice = new_nice;
        log::info!(
            "burst buffer use, reset priority to {} for job {}",
            job.priority,
            job.job_id
        );
    }
}

/// Order pending buffer work by the owning jobs' expected start times.
pub fn job_queue_order(a: &JobRecord, b: &JobRecord) -> Ordering {
    a.start_time.cmp(&b.start_time)
}

/// Order preemption candidates by decreasing `use_time`, so the buffers
/// needed furthest in the future are reclaimed first.
pub fn preempt_order(a: &BbAlloc, b: &BbAlloc) -> Ordering {
    b.use_time.cmp(&a.use_time)
}
