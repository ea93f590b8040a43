// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Accelerator load behind a minimal device interface.
//!
//! The load loop only ever sees [`MatmulDevice`]: allocate a square
//! matrix, multiply it in place, synchronize. That keeps the generator
//! independent of any particular runtime; the cuBLAS implementation lives
//! behind the `cuda` feature and a host without it simply has no device to
//! offer. The GPU loop is never substituted onto the CPU path: that would
//! corrupt the stress profile the CPU workers are generating.

use anyhow::Result;
use log::error;
use log::info;
use std::thread;
use std::time::Duration;
use std::time::Instant;

/// Host-side pause between multiplies so the dispatch thread doesn't
/// monopolize a CPU that the pinned workers are trying to load.
const HOST_YIELD: Duration = Duration::from_millis(5);

/// Default device-synchronization cadence, in iterations. Synchronizing
/// every iteration would serialize the accelerator pipeline.
pub const DEFAULT_SYNC_INTERVAL: u64 = 8;

/// A fixed-size square-matrix multiply capability.
pub trait MatmulDevice {
    /// Allocate the working set for `dim` x `dim` matrices.
    fn allocate(&mut self, dim: usize) -> Result<()>;
    /// Queue one self-multiply of the working matrix.
    fn multiply_in_place(&mut self) -> Result<()>;
    /// Block until all queued work has completed.
    fn synchronize(&mut self) -> Result<()>;
}

#[derive(Debug)]
pub struct MatmulStats {
    pub dim: usize,
    pub iterations: u64,
    /// False if the device faulted mid-loop and the loop exited early.
    pub completed: bool,
    pub elapsed: Duration,
}

impl MatmulStats {
    /// Achieved throughput, counting 2*n^3 FLOPs per multiply.
    pub fn gflops(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        let flops = self.iterations as f64 * 2.0 * (self.dim as f64).powi(3);
        flops / secs / 1e9
    }
}

/// Drive `dev` until `deadline`, synchronizing every `sync_every`
/// iterations and yielding the host thread briefly in between.
///
/// An allocation failure is the caller's to handle (setup error). A fault
/// mid-loop is reported, ends this loop early, and is otherwise contained:
/// concurrently running CPU workers are unaffected.
pub fn run_matmul_loop(
    dev: &mut dyn MatmulDevice,
    dim: usize,
    deadline: Instant,
    sync_every: u64,
) -> Result<MatmulStats> {
    let sync_every = sync_every.max(1);
    dev.allocate(dim)?;

    let start = Instant::now();
    let mut iterations = 0u64;
    let mut completed = true;

    while Instant::now() < deadline {
        if let Err(e) = dev.multiply_in_place() {
            error!("accelerator fault after {iterations} multiplies: {e:#}");
            completed = false;
            break;
        }
        iterations += 1;
        if iterations % sync_every == 0 {
            if let Err(e) = dev.synchronize() {
                error!("accelerator sync fault after {iterations} multiplies: {e:#}");
                completed = false;
                break;
            }
        }
        thread::sleep(HOST_YIELD);
    }

    // Drain whatever is still queued so elapsed covers real work.
    if completed {
        if let Err(e) = dev.synchronize() {
            error!("accelerator fault in final sync: {e:#}");
            completed = false;
        }
    }

    let stats = MatmulStats {
        dim,
        iterations,
        completed,
        elapsed: start.elapsed(),
    };
    info!(
        "matmul loop: {} iterations of {}x{} in {:.1}s ({:.1} GFLOPS), completed={}",
        stats.iterations,
        dim,
        dim,
        stats.elapsed.as_secs_f64(),
        stats.gflops(),
        stats.completed
    );
    Ok(stats)
}

#[cfg(feature = "cuda")]
pub mod cuda {
    //! cuBLAS-backed [`MatmulDevice`].

    use super::MatmulDevice;
    use anyhow::Context;
    use anyhow::Result;
    use cudarc::cublas::sys::cublasOperation_t;
    use cudarc::cublas::CudaBlas;
    use cudarc::cublas::Gemm;
    use cudarc::cublas::GemmConfig;
    use cudarc::driver::CudaDevice;
    use cudarc::driver::CudaSlice;
    use std::sync::Arc;

    pub struct CublasMatmul {
        dev: Arc<CudaDevice>,
        blas: CudaBlas,
        dim: usize,
        // GEMM can't alias A and C, so "in place" is a ping-pong pair.
        a: Option<CudaSlice<f32>>,
        c: Option<CudaSlice<f32>>,
    }

    impl CublasMatmul {
        /// Bind to a CUDA device. Fails when the runtime or the requested
        /// ordinal is absent; with MIG the visible ordinals are the slices
        /// granted through CUDA_VISIBLE_DEVICES.
        pub fn new(ordinal: usize) -> Result<Self> {
            let dev = CudaDevice::new(ordinal)
                .with_context(|| format!("Failed to open CUDA device {ordinal}"))?;
            let blas = CudaBlas::new(dev.clone()).context("Failed to create cuBLAS handle")?;
            Ok(Self {
                dev,
                blas,
                dim: 0,
                a: None,
                c: None,
            })
        }
    }

    impl MatmulDevice for CublasMatmul {
        fn allocate(&mut self, dim: usize) -> Result<()> {
            self.dim = dim;
            self.a = Some(self.dev.htod_copy(vec![1.0f32; dim * dim])?);
            self.c = Some(self.dev.alloc_zeros::<f32>(dim * dim)?);
            Ok(())
        }

        fn multiply_in_place(&mut self) -> Result<()> {
            let n = self.dim as i32;
            let cfg = GemmConfig {
                transa: cublasOperation_t::CUBLAS_OP_N,
                transb: cublasOperation_t::CUBLAS_OP_N,
                m: n,
                n,
                k: n,
                alpha: 1.0f32,
                lda: n,
                ldb: n,
                beta: 0.0f32,
                ldc: n,
            };
            {
                let a = self.a.as_ref().context("multiply before allocate")?;
                let c = self.c.as_mut().context("multiply before allocate")?;
                unsafe { self.blas.gemm(cfg, a, a, c) }?;
            }
            std::mem::swap(&mut self.a, &mut self.c);
            Ok(())
        }

        fn synchronize(&mut self) -> Result<()> {
            self.dev.synchronize()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    #[derive(Default)]
    struct FakeDevice {
        allocated: Option<usize>,
        multiplies: u64,
        syncs: u64,
        fail_allocate: bool,
        fail_multiply_at: Option<u64>,
    }

    impl MatmulDevice for FakeDevice {
        fn allocate(&mut self, dim: usize) -> Result<()> {
            if self.fail_allocate {
                bail!("no device");
            }
            self.allocated = Some(dim);
            Ok(())
        }

        fn multiply_in_place(&mut self) -> Result<()> {
            if Some(self.multiplies) == self.fail_multiply_at {
                bail!("device fault");
            }
            self.multiplies += 1;
            Ok(())
        }

        fn synchronize(&mut self) -> Result<()> {
            self.syncs += 1;
            Ok(())
        }
    }

    #[test]
    fn test_loop_runs_to_deadline() {
        let mut dev = FakeDevice::default();
        let deadline = Instant::now() + Duration::from_millis(150);
        let stats = run_matmul_loop(&mut dev, 64, deadline, 2).unwrap();

        assert!(stats.completed);
        assert!(stats.iterations >= 2);
        assert_eq!(stats.iterations, dev.multiplies);
        assert_eq!(dev.allocated, Some(64));
        // periodic syncs plus the final drain
        assert!(dev.syncs >= 2);
        assert!(dev.syncs < dev.multiplies + 2);
        assert!(stats.gflops() > 0.0);
    }

    #[test]
    fn test_fault_ends_loop_early() {
        let mut dev = FakeDevice {
            fail_multiply_at: Some(2),
            ..Default::default()
        };
        let deadline = Instant::now() + Duration::from_secs(30);
        let start = Instant::now();
        let stats = run_matmul_loop(&mut dev, 64, deadline, 4).unwrap();

        assert!(!stats.completed);
        assert_eq!(stats.iterations, 2);
        // exited on the fault, nowhere near the deadline
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_allocate_failure_is_setup_error() {
        let mut dev = FakeDevice {
            fail_allocate: true,
            ..Default::default()
        };
        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(run_matmul_loop(&mut dev, 64, deadline, 4).is_err());
        assert_eq!(dev.multiplies, 0);
    }
}
