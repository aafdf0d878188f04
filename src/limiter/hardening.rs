//! Kernel-side hardening of the worker process.
//!
//! [`apply`] runs in the forked child before `exec`, so it only touches raw
//! syscalls and never allocates. The fixed order is:
//!
//! 1. `setsid()` so the worker leads its own process group
//! 2. `PR_SET_PDEATHSIG(SIGKILL)` so an orphaned worker dies with the engine
//! 3. `PR_SET_NO_NEW_PRIVS`
//! 4. rlimits: address space, CPU, core, file size, open files, processes, stack
//! 5. inherited descriptors above stderr marked close-on-exec
//!
//! The `phase_*` helpers run inside the worker between phases and adjust
//! the same limits for the phase about to start.

use crate::config::types::{ResourceBudget, Result, SandboxError};
use crate::limiter::protocol::WorkerJob;
use nix::sys::resource::{getrlimit, getrusage, setrlimit, Resource, UsageWho};
use nix::sys::time::TimeValLike;
use std::io;

/// Descriptor ceiling inside the worker. It needs its three standard
/// streams and a handful for the runtime.
const WORKER_OPEN_FILES: u64 = 16;

/// Slack added to the kernel CPU ceiling so the in-process meter fires first.
const CPU_SLACK_SECS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitPlan {
    pub address_space_bytes: u64,
    pub cpu_soft_secs: u64,
    pub cpu_hard_secs: u64,
    pub stack_bytes: u64,
    pub open_files: u64,
}

impl RlimitPlan {
    /// Limits for a worker that runs the source once and then every
    /// remaining test. The soft CPU limit covers the source phase; the
    /// worker raises it phase by phase up to the hard limit.
    pub fn for_job(job: &WorkerJob, stack_limit_bytes: u64) -> Self {
        let source_secs = cpu_secs(job.budget.cpu_time_limit_ms) + CPU_SLACK_SECS;
        let per_test = cpu_secs(job.test_budget.cpu_time_limit_ms) + CPU_SLACK_SECS;
        let tests = job.remaining_tests() as u64;
        Self {
            address_space_bytes: job.budget.memory_limit_bytes,
            cpu_soft_secs: source_secs,
            cpu_hard_secs: source_secs
                .saturating_add(per_test.saturating_mul(tests))
                .saturating_add(2),
            stack_bytes: stack_limit_bytes,
            open_files: WORKER_OPEN_FILES,
        }
    }
}

/// Whole seconds covering `ms`, never zero.
pub fn cpu_secs(ms: u64) -> u64 {
    ms.div_ceil(1000).max(1)
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn set_raw_limit(resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    check(unsafe { libc::setrlimit(resource, &limit) })
}

/// Apply the plan to the calling process. Meant for `pre_exec`.
pub fn apply(plan: &RlimitPlan) -> io::Result<()> {
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }
    check(unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) })?;
    check(unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) })?;

    set_raw_limit(
        libc::RLIMIT_AS,
        plan.address_space_bytes,
        plan.address_space_bytes,
    )?;
    set_raw_limit(libc::RLIMIT_CPU, plan.cpu_soft_secs, plan.cpu_hard_secs)?;
    set_raw_limit(libc::RLIMIT_CORE, 0, 0)?;
    set_raw_limit(libc::RLIMIT_FSIZE, 0, 0)?;
    set_raw_limit(libc::RLIMIT_NOFILE, plan.open_files, plan.open_files)?;
    set_raw_limit(libc::RLIMIT_NPROC, 0, 0)?;
    set_raw_limit(libc::RLIMIT_STACK, plan.stack_bytes, plan.stack_bytes)?;

    close_inherited_fds();
    Ok(())
}

/// Everything above stderr is closed at `exec`. Marking instead of closing
/// keeps the spawn error pipe usable until then.
fn close_inherited_fds() {
    const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

    let marked = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            3 as libc::c_uint,
            libc::c_uint::MAX,
            CLOSE_RANGE_CLOEXEC,
        )
    };
    if marked == 0 {
        return;
    }

    // Kernels before 5.11 lack CLOEXEC; fall back to per-descriptor flags.
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max_fd = if max_fd <= 0 { 1024 } else { max_fd.min(65_536) } as libc::c_int;
    let mut fd = 3;
    while fd < max_fd {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags >= 0 {
            unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
        }
        fd += 1;
    }
}

fn resource_error(what: &str, e: nix::errno::Errno) -> SandboxError {
    SandboxError::ResourceLimit(format!("{what}: {e}"))
}

/// CPU milliseconds this process has consumed so far, user plus system.
pub fn consumed_cpu_ms() -> Result<u64> {
    let usage = getrusage(UsageWho::RUSAGE_SELF).map_err(|e| resource_error("getrusage", e))?;
    let ms = usage.user_time().num_milliseconds() + usage.system_time().num_milliseconds();
    Ok(ms.max(0) as u64)
}

/// Move the soft CPU limit so the next phase gets its own allowance
/// measured from what has already been spent.
pub fn phase_cpu_limit(budget: &ResourceBudget) -> Result<()> {
    let (_, hard) =
        getrlimit(Resource::RLIMIT_CPU).map_err(|e| resource_error("getrlimit(CPU)", e))?;
    let spent = consumed_cpu_ms()?;
    let soft = cpu_secs(spent)
        .saturating_add(cpu_secs(budget.cpu_time_limit_ms))
        .saturating_add(CPU_SLACK_SECS)
        .min(hard);
    setrlimit(Resource::RLIMIT_CPU, soft, hard).map_err(|e| resource_error("setrlimit(CPU)", e))
}

/// Current virtual memory size of this process.
pub fn virtual_memory_bytes() -> Result<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm")?;
    let pages: u64 = statm
        .split_whitespace()
        .next()
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| SandboxError::ResourceLimit("malformed /proc/self/statm".to_string()))?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = if page_size > 0 { page_size as u64 } else { 4096 };
    Ok(pages.saturating_mul(page_size))
}

/// Narrow the address-space ceiling to the current footprint plus
/// `headroom` bytes. Never widens it.
pub fn phase_memory_limit(headroom: u64) -> Result<u64> {
    let (soft, hard) =
        getrlimit(Resource::RLIMIT_AS).map_err(|e| resource_error("getrlimit(AS)", e))?;
    let target = virtual_memory_bytes()?.saturating_add(headroom);
    let narrowed = target.min(soft as u64);
    setrlimit(Resource::RLIMIT_AS, narrowed as libc::rlim_t, hard)
        .map_err(|e| resource_error("setrlimit(AS)", e))?;
    Ok(narrowed)
}
