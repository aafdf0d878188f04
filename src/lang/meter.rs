use crate::config::types::ResourceBudget;
use crate::lang::error::{ErrorKind, ScriptError, ScriptResult};
use nix::time::{clock_gettime, ClockId};
use std::time::{Duration, Instant};

/// Steps between clock reads.
const CHECK_INTERVAL: u32 = 2048;

/// Rough in-memory cost of one container slot.
pub const SLOT_BYTES: u64 = 32;

/// Cooperative budget enforcement inside the interpreter.
///
/// Deadlines are fixed when the meter starts; `tick` is called on every
/// statement, loop iteration, call and materialised element.
#[derive(Debug, Clone)]
pub struct Meter {
    counter: u32,
    wall_deadline: Option<Instant>,
    cpu_deadline: Option<Duration>,
    budget: Option<ResourceBudget>,
}

impl Meter {
    pub fn unlimited() -> Self {
        Self {
            counter: 0,
            wall_deadline: None,
            cpu_deadline: None,
            budget: None,
        }
    }

    pub fn start(budget: &ResourceBudget) -> Self {
        let wall_deadline = Instant::now() + Duration::from_millis(budget.wall_time_limit_ms);
        let cpu_deadline = thread_cpu_time()
            .map(|used| used + Duration::from_millis(budget.cpu_time_limit_ms));
        Self {
            counter: 0,
            wall_deadline: Some(wall_deadline),
            cpu_deadline,
            budget: Some(*budget),
        }
    }

    #[inline]
    pub fn tick(&mut self) -> ScriptResult<()> {
        self.counter = self.counter.wrapping_add(1);
        if self.counter % CHECK_INTERVAL == 0 {
            self.check_clocks()?;
        }
        Ok(())
    }

    pub fn check_clocks(&self) -> ScriptResult<()> {
        let Some(budget) = &self.budget else {
            return Ok(());
        };
        if let Some(deadline) = self.wall_deadline {
            if Instant::now() >= deadline {
                return Err(ScriptError::new(
                    ErrorKind::Timeout,
                    format!("wall-clock limit of {} ms exceeded", budget.wall_time_limit_ms),
                ));
            }
        }
        if let (Some(deadline), Some(used)) = (self.cpu_deadline, thread_cpu_time()) {
            if used >= deadline {
                return Err(ScriptError::new(
                    ErrorKind::Timeout,
                    format!("CPU time limit of {} ms exceeded", budget.cpu_time_limit_ms),
                ));
            }
        }
        Ok(())
    }

    /// Refuse an allocation of `bytes` that could never fit the budget.
    pub fn guard_bytes(&self, bytes: u64) -> ScriptResult<()> {
        match &self.budget {
            Some(budget) if bytes > budget.memory_limit_bytes => Err(memory_exceeded(budget)),
            _ => Ok(()),
        }
    }

    pub fn guard_slots(&self, slots: usize) -> ScriptResult<()> {
        self.guard_bytes((slots as u64).saturating_mul(SLOT_BYTES))
    }
}

pub fn memory_exceeded(budget: &ResourceBudget) -> ScriptError {
    ScriptError::new(
        ErrorKind::Memory,
        format!("memory limit of {} exceeded", describe_bytes(budget.memory_limit_bytes)),
    )
}

pub fn describe_bytes(bytes: u64) -> String {
    const MIB: u64 = 1024 * 1024;
    if bytes >= MIB && bytes % MIB == 0 {
        format!("{} MiB", bytes / MIB)
    } else {
        format!("{bytes} bytes")
    }
}

/// CPU time consumed by the calling thread so far.
pub fn thread_cpu_time() -> Option<Duration> {
    clock_gettime(ClockId::CLOCK_THREAD_CPUTIME_ID)
        .ok()
        .map(Duration::from)
}
