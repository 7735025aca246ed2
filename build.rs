//! Compiles the CUDA sources and links cuFFT when the `cuda` feature is on.

#[cfg(feature = "cuda")]
use cuda_setup::{GpuArchitecture, build_host};

fn main() {
    #[cfg(feature = "cuda")]
    {
        build_host(
            // Select the min supported GPU architecture.
            GpuArchitecture::Rtx3,
            &["src/cuda/fft_kernels.cu", "src/cuda/cufft_plan.cu"],
            "pw_fft",
        );

        println!("cargo:rerun-if-changed=src/cuda/fft_kernels.cu");
        println!("cargo:rerun-if-changed=src/cuda/cufft_plan.cu");
        println!("cargo:rustc-link-lib=cufft");
    }
}
