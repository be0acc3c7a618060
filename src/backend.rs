//! Backend selection module.
//!
//! Kernels are encoded once and executed many times, so the backend is not
//! baked into a graph: every command looks up the active backend when it
//! runs on the queue worker.
//!
//! # Supported Backends
//!
//! - `Cpu`: rayon-parallel host kernels (default).
//! - `Wgpu`: compute shaders through `wgpu`, only with the `wgpu` feature.
//!   Kernels without a shader, and every dispatch that fails, fall back to
//!   the CPU path.
//!
//! The selection is stored globally in an `AtomicU8` and shared by every
//! device in the process: creating a [`Device`](crate::Device) selects its
//! configured backend for all queues, and a device that switches it away
//! from an earlier device's choice logs a warning.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Enumeration of supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Backend {
    /// Host backend (default).
    #[default]
    Cpu = 0,
    /// GPU-accelerated backend using `wgpu`.
    Wgpu,
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            _ => Err(()),
        }
    }
}

impl core::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "wgpu" | "gpu" => Ok(Self::Wgpu),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

/// Global backend; changes rarely and never mid-chain.
static GLOBAL_BACKEND: AtomicU8 = AtomicU8::new(Backend::Cpu as u8);

/// Sets the backend used by commands that execute from now on.
///
/// Selecting [`Backend::Wgpu`] without the `wgpu` feature keeps the CPU path.
///
/// # Example
///
/// ```
/// use gradpipe::backend::{set_backend, get_backend, Backend};
/// set_backend(Backend::Cpu);
/// assert_eq!(get_backend(), Backend::Cpu);
/// ```
pub fn set_backend(b: Backend) {
    let b = if cfg!(feature = "wgpu") || b == Backend::Cpu {
        b
    } else {
        log::warn!("wgpu backend requested but the `wgpu` feature is disabled; using cpu");
        Backend::Cpu
    };
    GLOBAL_BACKEND.store(b as u8, Ordering::Release);
}

/// Set once the first device has selected a backend.
static CLAIMED: AtomicBool = AtomicBool::new(false);

/// Selects `b` on behalf of a new device.
///
/// Returns the backend that was replaced when an earlier device had
/// selected a different one.
pub(crate) fn claim_backend(b: Backend) -> Option<Backend> {
    let previous = get_backend();
    set_backend(b);
    let claimed_before = CLAIMED.swap(true, Ordering::AcqRel);
    (claimed_before && previous != get_backend()).then_some(previous)
}

/// Returns the currently active computation backend.
///
/// If the stored value is invalid, defaults to [`Backend::Cpu`].
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_backend_names() {
        assert_eq!("CPU".parse::<Backend>(), Ok(Backend::Cpu));
        assert_eq!(" wgpu ".parse::<Backend>(), Ok(Backend::Wgpu));
        assert!("cuda".parse::<Backend>().is_err());
    }

    #[test]
    #[cfg(not(feature = "wgpu"))]
    fn repeated_cpu_claims_replace_nothing() {
        claim_backend(Backend::Cpu);
        assert_eq!(claim_backend(Backend::Cpu), None);
        assert_eq!(claim_backend(Backend::Wgpu), None);
    }

    #[test]
    fn roundtrip_discriminants() {
        assert_eq!(Backend::try_from(Backend::Wgpu as u8), Ok(Backend::Wgpu));
        assert!(Backend::try_from(7).is_err());
    }
}
