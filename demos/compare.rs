// demos/compare.rs — CPU vs device NMS and convolution on a PNG.
//
// Pads the input so the convolution output is a multiple of the 15×15
// work-group, runs both algorithms on the CPU and on the device, prints
// device capabilities and timings, checks the two results are identical,
// and writes the four masks/images to vis_output/.
//
// USAGE
//   cargo run --release --example compare -- path/to/image.png 2
//   RUST_LOG=offload_v=debug cargo run --example compare -- image.png 2
//   WGPU_BACKEND=vulkan OFFLOAD_PROFILE=rpi cargo run --example compare -- image.png 2

use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::time::Instant;

use tracing_subscriber::EnvFilter;

use offload_v::convolution::{convolve2d_image, BLOB_KERNEL_5X5};
use offload_v::gpu::{DeviceConfig, DeviceController, GpuFilters, NdRange};
use offload_v::image::Image;
use offload_v::nms::{block_grid, suppress_to_mask};

const LOCAL_X: usize = 15;
const LOCAL_Y: usize = 15;
const KERNEL_SIZE: usize = 5;
const OUT_DIR: &str = "vis_output";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let (path, n) = match args.as_slice() {
        [_, path, n] => match n.parse::<usize>() {
            Ok(n) if n >= 1 => (path.clone(), n),
            _ => {
                eprintln!("nms_block_size must be a positive integer (got {n:?})");
                return ExitCode::FAILURE;
            }
        },
        _ => {
            eprintln!("Usage: {} png_image_path nms_block_size", args[0]);
            return ExitCode::FAILURE;
        }
    };

    let ctrl = match DeviceController::acquire_with(DeviceConfig::from_env()) {
        Ok(ctrl) => ctrl,
        Err(e) => {
            eprintln!("device initialisation error: {e}");
            return ExitCode::FAILURE;
        }
    };
    println!("{}\n", ctrl.capabilities());

    let mut filters = match GpuFilters::new(&ctrl) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("kernel compilation error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let img = match load_image(&path) {
        Ok(img) => img,
        Err(e) => {
            eprintln!("failed to open {path}: {e}");
            return ExitCode::FAILURE;
        }
    };
    let padded = img.padded_to_multiple(LOCAL_X, LOCAL_Y, KERNEL_SIZE - 1);
    println!(
        "Loaded {path}: {}×{} (padded to {}×{})",
        img.width(),
        img.height(),
        padded.width(),
        padded.height()
    );
    if let Err(e) = fs::create_dir_all(OUT_DIR) {
        eprintln!("failed to create {OUT_DIR}/: {e}");
        return ExitCode::FAILURE;
    }

    // ---- Non-maximum suppression ------------------------------------------
    let (bx, by) = block_grid(padded.width(), padded.height(), n);
    println!("\nNon-Maximum Suppression (n = {n}, {bx}×{by} blocks)");

    let t0 = Instant::now();
    let cpu_nms = suppress_to_mask(&padded, n);
    let cpu_ms = ms(t0);

    let t0 = Instant::now();
    let gpu_nms = match filters.nms(&padded, n) {
        Ok(mask) => mask,
        Err(e) => {
            eprintln!("nms dispatch error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let gpu_ms = ms(t0);

    report(cpu_ms, gpu_ms, &cpu_nms, &gpu_nms);
    if let Err(e) = save(&cpu_nms, "test_image_nms_cpu.png").and_then(|()| save(&gpu_nms, "test_image_nms_gpu.png")) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    // ---- Convolution 2D ----------------------------------------------------
    println!("\nConvolution 2D ({KERNEL_SIZE}×{KERNEL_SIZE} blob kernel, {LOCAL_X}×{LOCAL_Y} work-groups)");

    let t0 = Instant::now();
    let cpu_blob = convolve2d_image(&padded, &BLOB_KERNEL_5X5, KERNEL_SIZE);
    let cpu_ms = ms(t0);

    let t0 = Instant::now();
    let local = NdRange::d2(LOCAL_X, LOCAL_Y);
    let gpu_blob = match filters.convolve2d(&padded, &BLOB_KERNEL_5X5, KERNEL_SIZE, Some(local)) {
        Ok(out) => out,
        Err(e) => {
            eprintln!("convolution dispatch error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let gpu_ms = ms(t0);

    report(cpu_ms, gpu_ms, &cpu_blob, &gpu_blob);
    if let Err(e) = save(&cpu_blob, "test_image_blob_cpu.png").and_then(|()| save(&gpu_blob, "test_image_blob_gpu.png")) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let live = ctrl.live_objects();
    println!(
        "\nDevice objects at exit: {} buffer(s), {} program(s), {} kernel(s)",
        live.buffers, live.programs, live.kernels
    );
    ExitCode::SUCCESS
}

fn ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn report(cpu_ms: f64, gpu_ms: f64, cpu: &Image, gpu: &Image) {
    println!("  CPU running time:    {cpu_ms:.3} ms");
    println!("  Device running time: {gpu_ms:.3} ms (upload, dispatch, readback)");
    let diff = cpu
        .as_slice()
        .iter()
        .zip(gpu.as_slice())
        .filter(|(a, b)| a != b)
        .count();
    if diff == 0 {
        println!("  Results identical ({} bytes)", cpu.len());
    } else {
        println!("  MISMATCH: {diff} of {} bytes differ", cpu.len());
    }
}

fn load_image(path: &str) -> Result<Image, image::ImageError> {
    let img = image::open(path)?.to_luma8();
    let (w, h) = img.dimensions();
    Ok(Image::from_vec(w as usize, h as usize, img.into_raw()))
}

fn save(img: &Image, name: &str) -> Result<(), String> {
    let path = Path::new(OUT_DIR).join(name);
    let buf = image::GrayImage::from_raw(img.width() as u32, img.height() as u32, img.as_slice().to_vec())
        .ok_or_else(|| format!("{}: image buffer does not match its dimensions", path.display()))?;
    buf.save(&path)
        .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
    println!("  wrote {}", path.display());
    Ok(())
}
