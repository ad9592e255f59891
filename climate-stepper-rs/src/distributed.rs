//! Process placement passed explicitly into the stepper.

use candle_core::Device;

use crate::error::{StepperError, StepperResult};

/// Device and rank of the current process.
#[derive(Debug, Clone)]
pub struct RunContext {
    device: Device,
    rank: usize,
    world_size: usize,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::cpu()
    }
}

impl RunContext {
    /// Create a context, checking `rank < world_size`.
    pub fn new(device: Device, rank: usize, world_size: usize) -> StepperResult<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(StepperError::invalid_config(format!(
                "rank {rank} is out of range for world size {world_size}"
            )));
        }
        Ok(Self {
            device,
            rank,
            world_size,
        })
    }

    /// Single CPU process.
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            rank: 0,
            world_size: 1,
        }
    }

    /// Read `RANK` and `WORLD_SIZE` from the environment, defaulting to a
    /// single process.
    pub fn from_env(device: Device) -> StepperResult<Self> {
        let rank = read_env_usize("RANK")?.unwrap_or(0);
        let world_size = read_env_usize("WORLD_SIZE")?.unwrap_or(1);
        Self::new(device, rank, world_size)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// True on rank zero.
    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    /// Per-process share of a global batch.
    ///
    /// # Errors
    /// Fails if `batch_size` is not divisible by the world size.
    pub fn local_batch_size(&self, batch_size: usize) -> StepperResult<usize> {
        if batch_size % self.world_size != 0 {
            return Err(StepperError::invalid_config(format!(
                "batch size {batch_size} must be divisible by world size {}",
                self.world_size
            )));
        }
        Ok(batch_size / self.world_size)
    }
}

fn read_env_usize(key: &str) -> StepperResult<Option<usize>> {
    match std::env::var(key) {
        Ok(value) => value.trim().parse().map(Some).map_err(|_| {
            StepperError::invalid_config(format!("{key} must be a non-negative integer, got {value}"))
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_batch_size() {
        let context = RunContext::new(Device::Cpu, 1, 4).unwrap();
        assert_eq!(context.local_batch_size(8).unwrap(), 2);
        assert!(context.local_batch_size(6).is_err());
        assert!(!context.is_root());
    }

    #[test]
    fn test_rank_out_of_range() {
        assert!(RunContext::new(Device::Cpu, 2, 2).is_err());
        assert!(RunContext::new(Device::Cpu, 0, 0).is_err());
    }

    #[test]
    fn test_default_is_single_cpu_process() {
        let context = RunContext::default();
        assert_eq!(context.rank(), 0);
        assert_eq!(context.world_size(), 1);
        assert!(context.is_root());
        assert!(context.device().is_cpu());
    }
}
