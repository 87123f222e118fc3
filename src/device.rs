use std::fmt;

use tracing::{info, warn};

use crate::error::{CrnnError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePlacement {
    Cpu,
    Cuda(usize),
}

impl fmt::Display for DevicePlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePlacement::Cpu => write!(f, "cpu"),
            DevicePlacement::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

impl DevicePlacement {
    /// Resolves the placement of the run. A requested accelerator that is not
    /// available falls back to the CPU with a warning.
    pub fn resolve(request_cuda: bool) -> Self {
        let placement = if request_cuda {
            match probe_cuda() {
                Ok(index) => DevicePlacement::Cuda(index),
                Err(err) => {
                    warn!(%err, "falling back to CPU");
                    DevicePlacement::Cpu
                }
            }
        } else {
            DevicePlacement::Cpu
        };

        info!(device = %placement, "device selected");
        placement
    }
}

#[cfg(feature = "tch")]
fn probe_cuda() -> Result<usize> {
    if tch::Cuda::is_available() {
        Ok(0)
    } else {
        Err(CrnnError::DeviceUnavailable(
            "libtorch reports no CUDA device".to_string(),
        ))
    }
}

#[cfg(not(feature = "tch"))]
fn probe_cuda() -> Result<usize> {
    Err(CrnnError::DeviceUnavailable(
        "built without the `tch` feature, no accelerator backend".to_string(),
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cpu_when_not_requested() {
        assert_eq!(DevicePlacement::resolve(false), DevicePlacement::Cpu);
    }

    #[cfg(not(feature = "tch"))]
    #[test]
    fn test_fallback_without_accelerator() {
        assert_eq!(DevicePlacement::resolve(true), DevicePlacement::Cpu);
        assert!(matches!(probe_cuda(), Err(CrnnError::DeviceUnavailable(_))));
    }
}
