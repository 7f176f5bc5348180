//! Base-rate loop: commit parameters, compute, tick due tasks.
//!
//! ## RT Setup Sequence
//! 1. `mlockall(MCL_CURRENT | MCL_FUTURE)` when `lock_memory` is set.
//! 2. Prefault stack pages.
//! 3. `sched_setaffinity` + `SCHED_FIFO` (only with the `rt` feature).
//!
//! ## Cycle Body
//! Parameter commit → model compute → `tick()` of every task whose
//! decimation divides the base tick counter.

use crate::demo::DemoModel;
use daq::config::ConfigError;
use daq::timestamp::Timestamp;
use daq_shared_memory::{
    ParameterCommitter, ProcessImage, SetupError, TaskScheduler, TaskStats,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Fatal server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Memory locking, affinity or scheduler setup failed.
    #[error("RT setup failed: {0}")]
    RtSetup(String),

    /// Registration or arena setup failed.
    #[error(transparent)]
    Setup(#[from] SetupError),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ─── Cycle Statistics ───────────────────────────────────────────────

/// O(1) per-cycle timing statistics.
#[derive(Debug, Clone, Default)]
pub struct LoopStats {
    /// Base ticks executed.
    pub cycle_count: u64,
    /// Last cycle body duration [ns].
    pub last_cycle_ns: i64,
    /// Minimum cycle body duration [ns].
    pub min_cycle_ns: i64,
    /// Maximum cycle body duration [ns].
    pub max_cycle_ns: i64,
    /// Cycles whose body took longer than the period.
    pub overruns: u64,
    /// Parameter writes committed.
    pub parameter_commits: u64,
    sum_ns: i128,
}

impl LoopStats {
    /// Record one cycle.
    #[inline]
    pub fn record(&mut self, duration_ns: i64) {
        if self.cycle_count == 0 || duration_ns < self.min_cycle_ns {
            self.min_cycle_ns = duration_ns;
        }
        if duration_ns > self.max_cycle_ns {
            self.max_cycle_ns = duration_ns;
        }
        self.last_cycle_ns = duration_ns;
        self.sum_ns += duration_ns as i128;
        self.cycle_count += 1;
    }

    /// Mean cycle body duration [ns].
    pub fn avg_cycle_ns(&self) -> i64 {
        if self.cycle_count == 0 {
            0
        } else {
            (self.sum_ns / self.cycle_count as i128) as i64
        }
    }
}

// ─── RT Setup ───────────────────────────────────────────────────────

fn rt_mlockall() -> Result<(), ServerError> {
    use nix::sys::mman::{MlockAllFlags, mlockall};
    mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE)
        .map_err(|e| ServerError::RtSetup(format!("mlockall failed: {e}")))
}

/// Touch 256 KiB of stack so the loop does not fault on first use.
fn prefault_stack() {
    let mut buf = [0u8; 256 * 1024];
    for byte in buf.iter_mut() {
        // SAFETY: in-bounds write to a local buffer.
        unsafe { core::ptr::write_volatile(byte, 0xFF) };
    }
    core::hint::black_box(&buf);
}

#[cfg(feature = "rt")]
fn rt_set_affinity(cpu: usize) -> Result<(), ServerError> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    cpuset
        .set(cpu)
        .map_err(|e| ServerError::RtSetup(format!("CpuSet::set({cpu}) failed: {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
        .map_err(|e| ServerError::RtSetup(format!("sched_setaffinity failed: {e}")))
}

#[cfg(not(feature = "rt"))]
fn rt_set_affinity(_cpu: usize) -> Result<(), ServerError> {
    Ok(())
}

#[cfg(feature = "rt")]
fn rt_set_scheduler(priority: i32) -> Result<(), ServerError> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: plain syscall on the calling thread with a valid param.
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(ServerError::RtSetup(format!(
            "sched_setscheduler(SCHED_FIFO, {priority}) failed: {err}"
        )));
    }
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_scheduler(_priority: i32) -> Result<(), ServerError> {
    Ok(())
}

/// Prepare the calling thread for the base loop. Affinity and scheduler
/// are no-ops without the `rt` feature.
pub fn rt_setup(lock_memory: bool, cpu_core: usize, rt_priority: i32) -> Result<(), ServerError> {
    if lock_memory {
        rt_mlockall()?;
    }
    prefault_stack();
    rt_set_affinity(cpu_core)?;
    rt_set_scheduler(rt_priority)?;
    Ok(())
}

/// Wall-clock time for data frames. `CLOCK_REALTIME` through the vDSO.
#[inline]
pub fn frame_timestamp() -> Timestamp {
    use nix::time::{ClockId, clock_gettime};
    clock_gettime(ClockId::CLOCK_REALTIME)
        .map(|ts| Timestamp::new(i64::from(ts.tv_sec()), ts.tv_nsec() as u32))
        .unwrap_or(Timestamp::ZERO)
}

// ─── Base Loop ──────────────────────────────────────────────────────

struct TaskSlot {
    decimation: u64,
    scheduler: TaskScheduler,
}

/// Owns the process image and every task's producer half.
pub struct BaseLoop {
    model: DemoModel,
    image: ProcessImage,
    committer: ParameterCommitter,
    tasks: Vec<TaskSlot>,
    commit_task: usize,
    period: Duration,
    base_tick: u64,
    stats: LoopStats,
}

impl BaseLoop {
    /// `tasks` pairs each scheduler with its base-tick decimation.
    pub fn new(
        model: DemoModel,
        image: ProcessImage,
        committer: ParameterCommitter,
        tasks: Vec<(u32, TaskScheduler)>,
        period: Duration,
    ) -> Self {
        let tasks: Vec<TaskSlot> = tasks
            .into_iter()
            .map(|(decimation, scheduler)| TaskSlot {
                decimation: u64::from(decimation.max(1)),
                scheduler,
            })
            .collect();
        // Commits run at base rate, on behalf of the fastest task.
        let commit_task = tasks
            .iter()
            .min_by_key(|slot| slot.decimation)
            .map_or(0, |slot| slot.scheduler.task_id());
        Self {
            model,
            image,
            committer,
            tasks,
            commit_task,
            period,
            base_tick: 0,
            stats: LoopStats::default(),
        }
    }

    /// One base tick.
    pub fn step(&mut self) {
        let now = frame_timestamp();
        self.stats.parameter_commits += self.committer.apply(&mut self.image, self.commit_task) as u64;
        self.model.compute(&mut self.image, self.period.as_secs_f64());
        for slot in &mut self.tasks {
            if self.base_tick % slot.decimation == 0 {
                slot.scheduler.tick(&self.image, Some(now));
            }
        }
        self.base_tick += 1;
    }

    /// Run until `running` is cleared. Overruns are counted, not fatal.
    pub fn run(&mut self, running: &AtomicBool) {
        let mut next_wake = Instant::now();
        while running.load(Ordering::Relaxed) {
            let cycle_start = Instant::now();
            self.step();
            let elapsed = cycle_start.elapsed();
            self.stats.record(elapsed.as_nanos() as i64);
            if elapsed > self.period {
                self.stats.overruns += 1;
            }

            next_wake += self.period;
            let now = Instant::now();
            if next_wake > now {
                std::thread::sleep(next_wake - now);
            } else {
                // Fell behind by more than a period: restart pacing.
                next_wake = now;
            }
        }
    }

    /// Timing counters.
    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Task id handed to parameter callbacks.
    pub fn commit_task(&self) -> usize {
        self.commit_task
    }

    /// Base ticks executed.
    pub fn base_tick(&self) -> u64 {
        self.base_tick
    }

    /// `(task_id, counters)` of every task.
    pub fn task_stats(&self) -> impl Iterator<Item = (usize, TaskStats)> + '_ {
        self.tasks
            .iter()
            .map(|slot| (slot.scheduler.task_id(), slot.scheduler.stats()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::DemoRegistry;
    use daq_shared_memory::{RetryPolicy, TaskSetup, create_task, parameter_channel};

    fn base_loop(decimations: &[u32]) -> (BaseLoop, Vec<daq_shared_memory::TaskControl>) {
        let demo = DemoRegistry::build(decimations.len()).unwrap();
        let image = demo.initial_image();
        let (_client, committer) = parameter_channel(&demo.registry, &image, RetryPolicy::default());
        let mut tasks = Vec::new();
        let mut controls = Vec::new();
        for (tid, &dec) in decimations.iter().enumerate() {
            let setup = TaskSetup::new(tid, 0.001 * dec as f64).with_ring_frames(64);
            let (scheduler, control) = create_task(&demo.registry, &setup).unwrap();
            tasks.push((dec, scheduler));
            controls.push(control);
        }
        let lp = BaseLoop::new(
            DemoModel::default(),
            image,
            committer,
            tasks,
            Duration::from_millis(1),
        );
        (lp, controls)
    }

    #[test]
    fn test_tasks_tick_at_their_decimation() {
        let (mut lp, _controls) = base_loop(&[1, 10]);
        for _ in 0..25 {
            lp.step();
        }
        assert_eq!(lp.base_tick(), 25);
        let ticks: Vec<_> = lp.task_stats().map(|(tid, s)| (tid, s.ticks)).collect();
        assert_eq!(ticks, vec![(0, 25), (1, 3)]);
    }

    #[test]
    fn test_commits_run_for_the_fastest_task() {
        let (lp, _controls) = base_loop(&[10, 1]);
        assert_eq!(lp.commit_task(), 1);
        let (lp, _controls) = base_loop(&[1, 10]);
        assert_eq!(lp.commit_task(), 0);
    }

    #[test]
    fn test_run_stops_when_flag_cleared() {
        let (mut lp, _controls) = base_loop(&[1]);
        let running = AtomicBool::new(false);
        lp.run(&running);
        assert_eq!(lp.stats().cycle_count, 0);
    }

    #[test]
    fn test_loop_stats() {
        let mut stats = LoopStats::default();
        stats.record(300);
        stats.record(100);
        stats.record(200);
        assert_eq!(stats.cycle_count, 3);
        assert_eq!(stats.min_cycle_ns, 100);
        assert_eq!(stats.max_cycle_ns, 300);
        assert_eq!(stats.last_cycle_ns, 200);
        assert_eq!(stats.avg_cycle_ns(), 200);
    }

    #[test]
    fn test_rt_setup_without_locking() {
        #[cfg(not(feature = "rt"))]
        assert!(rt_setup(false, 0, 80).is_ok());
    }

    #[test]
    fn test_frame_timestamp_is_wall_clock() {
        let ts = frame_timestamp();
        assert!(ts.sec > 1_600_000_000);
        assert!(ts.nsec < 1_000_000_000);
    }
}
