//! DFT Processors
//!
//! Fixed-size forward and inverse DFTs behind one trait. The FFTW backend is
//! used when the `fftw` feature is enabled; the rustfft backend is always
//! available and takes over whenever an FFTW plan cannot be created.
//!
//! Transforms are unnormalized: callers apply their own scaling.

use crate::LayerError;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(feature = "fftw")]
use fftw::array::AlignedVec;
#[cfg(feature = "fftw")]
use fftw::plan::{C2CPlan, C2CPlan32};
#[cfg(feature = "fftw")]
use fftw::types::{Flag, Sign};

/// Transform direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DftDirection {
    Forward,
    Inverse,
}

/// Fixed-size DFT with its own input and output buffers
pub trait DftProcessor: Send {
    fn direction(&self) -> DftDirection;

    fn size(&self) -> usize;

    /// Input buffer, to be filled before [`DftProcessor::run`]
    fn input(&mut self) -> &mut [Complex32];

    /// Transform the input buffer
    fn run(&mut self) -> Result<&[Complex32], LayerError>;
}

/// rustfft-based DFT
pub struct GenericDft {
    direction: DftDirection,
    fft: Arc<dyn Fft<f32>>,
    input: Vec<Complex32>,
    output: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl GenericDft {
    pub fn new(size: usize, direction: DftDirection) -> Self {
        let mut planner = FftPlanner::new();
        let fft = match direction {
            DftDirection::Forward => planner.plan_fft_forward(size),
            DftDirection::Inverse => planner.plan_fft_inverse(size),
        };
        let scratch = vec![Complex32::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        Self {
            direction,
            fft,
            input: vec![Complex32::new(0.0, 0.0); size],
            output: vec![Complex32::new(0.0, 0.0); size],
            scratch,
        }
    }
}

impl DftProcessor for GenericDft {
    fn direction(&self) -> DftDirection {
        self.direction
    }

    fn size(&self) -> usize {
        self.input.len()
    }

    fn input(&mut self) -> &mut [Complex32] {
        &mut self.input
    }

    fn run(&mut self) -> Result<&[Complex32], LayerError> {
        self.output.copy_from_slice(&self.input);
        self.fft.process_with_scratch(&mut self.output, &mut self.scratch);
        Ok(&self.output)
    }
}

/// FFTW-based DFT
#[cfg(feature = "fftw")]
pub struct FftwDft {
    direction: DftDirection,
    plan: C2CPlan32,
    input: AlignedVec<Complex32>,
    output: AlignedVec<Complex32>,
}

#[cfg(feature = "fftw")]
impl FftwDft {
    /// Sizes above this are planned with `ESTIMATE` to bound start-up time
    const MEASURE_LIMIT: usize = 4096;

    pub fn new(size: usize, direction: DftDirection) -> Result<Self, LayerError> {
        let sign = match direction {
            DftDirection::Forward => Sign::Forward,
            DftDirection::Inverse => Sign::Backward,
        };
        let flags = if size <= Self::MEASURE_LIMIT {
            Flag::MEASURE | Flag::DESTROYINPUT
        } else {
            Flag::ESTIMATE | Flag::DESTROYINPUT
        };
        let plan = C2CPlan32::aligned(&[size], sign, flags)
            .map_err(|e| LayerError::InitializationFailed(format!("Failed to create FFTW plan: {:?}", e)))?;
        Ok(Self {
            direction,
            plan,
            input: AlignedVec::new(size),
            output: AlignedVec::new(size),
        })
    }
}

#[cfg(feature = "fftw")]
impl DftProcessor for FftwDft {
    fn direction(&self) -> DftDirection {
        self.direction
    }

    fn size(&self) -> usize {
        self.input.len()
    }

    fn input(&mut self) -> &mut [Complex32] {
        &mut self.input
    }

    fn run(&mut self) -> Result<&[Complex32], LayerError> {
        self.plan
            .c2c(&mut self.input, &mut self.output)
            .map_err(|e| LayerError::ProcessingError(format!("FFTW execution failed: {:?}", e)))?;
        Ok(&self.output)
    }
}

/// Available DFT backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DftBackend {
    Fftw,
    Generic,
}

/// Creates DFT processors of the selected backend
#[derive(Debug, Clone, Copy)]
pub struct DftFactory {
    backend: DftBackend,
}

impl DftFactory {
    /// Fastest backend compiled in
    pub fn best_available() -> Self {
        let backend = if cfg!(feature = "fftw") {
            DftBackend::Fftw
        } else {
            DftBackend::Generic
        };
        info!("Using {:?} DFT backend", backend);
        Self { backend }
    }

    pub fn generic() -> Self {
        Self {
            backend: DftBackend::Generic,
        }
    }

    pub fn backend(&self) -> DftBackend {
        self.backend
    }

    pub fn create(&self, size: usize, direction: DftDirection) -> Result<Box<dyn DftProcessor>, LayerError> {
        if size == 0 {
            return Err(LayerError::InvalidConfiguration("DFT size must be positive".into()));
        }
        debug!("Creating {:?} DFT of size {} ({:?})", direction, size, self.backend);
        match self.backend {
            DftBackend::Fftw => self.create_fftw(size, direction),
            DftBackend::Generic => Ok(Box::new(GenericDft::new(size, direction))),
        }
    }

    #[cfg(feature = "fftw")]
    fn create_fftw(&self, size: usize, direction: DftDirection) -> Result<Box<dyn DftProcessor>, LayerError> {
        match FftwDft::new(size, direction) {
            Ok(dft) => Ok(Box::new(dft)),
            Err(e) => {
                warn!("{}, falling back to rustfft", e);
                Ok(Box::new(GenericDft::new(size, direction)))
            }
        }
    }

    #[cfg(not(feature = "fftw"))]
    fn create_fftw(&self, size: usize, direction: DftDirection) -> Result<Box<dyn DftProcessor>, LayerError> {
        warn!("FFTW backend not compiled in, falling back to rustfft");
        Ok(Box::new(GenericDft::new(size, direction)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn check_tone(factory: DftFactory) {
        let size = 64;
        let mut dft = factory.create(size, DftDirection::Forward).unwrap();
        assert_eq!(dft.size(), size);
        assert_eq!(dft.direction(), DftDirection::Forward);
        for (n, x) in dft.input().iter_mut().enumerate() {
            let phase = 2.0 * PI * 5.0 * n as f32 / size as f32;
            *x = Complex32::new(phase.cos(), phase.sin());
        }
        let output = dft.run().unwrap();
        assert!((output[5].re - size as f32).abs() < 1e-3);
        assert!(output[6].norm() < 1e-3);
    }

    #[test]
    fn test_generic_forward_tone() {
        check_tone(DftFactory::generic());
    }

    #[test]
    fn test_best_available_forward_tone() {
        check_tone(DftFactory::best_available());
    }

    #[test]
    fn test_inverse_then_forward() {
        let factory = DftFactory::best_available();
        let size = 1536;
        let mut inverse = factory.create(size, DftDirection::Inverse).unwrap();
        let mut forward = factory.create(size, DftDirection::Forward).unwrap();
        inverse.input().fill(Complex32::new(0.0, 0.0));
        inverse.input()[10] = Complex32::new(1.0, -2.0);
        let time = inverse.run().unwrap().to_vec();
        forward.input().copy_from_slice(&time);
        let freq = forward.run().unwrap();
        let value = freq[10] / size as f32;
        assert!((value - Complex32::new(1.0, -2.0)).norm() < 1e-4);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(DftFactory::generic().create(0, DftDirection::Forward).is_err());
    }
}
