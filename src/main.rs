// =============================================================================
// VKCOMPUTE - Vulkan compute command line
// =============================================================================
//
// COMMANDS:
//   devices    list the devices that pass selection
//   filter     7x7 Gaussian filter on a PNG, on the GPU or the host
//   roundtrip  host -> device -> host copy of an f32 range
//
// =============================================================================

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use vkcompute::filter::{self, GaussianFilter};
use vkcompute::{App, Config, CpuBuffer, GrayImage};

#[derive(Parser, Debug)]
#[command(name = "vkcompute", version, about = "Vulkan compute experiments")]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Log level, overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Disable validation layers
    #[arg(long)]
    no_validation: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List usable devices
    Devices,
    /// Run the Gaussian filter on a PNG image
    Filter {
        #[arg(long, default_value = "src.png")]
        input: PathBuf,
        #[arg(long, default_value = "dst.png")]
        output: PathBuf,
        #[arg(long)]
        sigma: Option<f32>,
        #[arg(long)]
        device: Option<usize>,
        /// Compiled SPIR-V of the filter shader
        #[arg(long)]
        shader: Option<PathBuf>,
        /// Compare the GPU result with the host reference
        #[arg(long)]
        verify: bool,
        /// Only run the host reference
        #[arg(long, conflicts_with = "verify")]
        cpu: bool,
    },
    /// Copy a range of f32 to a device and back
    Roundtrip {
        #[arg(long, default_value_t = 25_000_000)]
        elements: usize,
        #[arg(long, default_value_t = 0)]
        device: usize,
    },
}

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, source) = Config::read(&cli.config)?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.no_validation {
        config.instance.validation_layers = false;
    }

    vkcompute::logging::init(&config.logging)?;
    log::info!("Starting vkcompute");
    log::info!("{}", source);
    log::debug!("Config: {:?}", config);

    match cli.command {
        Command::Devices => list_devices(&config),
        Command::Filter {
            input,
            output,
            sigma,
            device,
            shader,
            verify,
            cpu,
        } => {
            if let Some(sigma) = sigma {
                config.filter.sigma = sigma;
            }
            if let Some(device) = device {
                config.filter.device_id = device;
            }
            if let Some(shader) = shader {
                config.filter.shader_path = shader;
            }
            run_filter(&config, &input, &output, verify, cpu)
        }
        Command::Roundtrip { elements, device } => roundtrip(&config, elements, device),
    }
}

fn list_devices(config: &Config) -> Result<()> {
    let app = App::new(config).context("Failed to initialize Vulkan")?;
    for (id, info) in app.device_infos().iter().enumerate() {
        println!(
            "{}: {} [{}] API {} (compute queue family {})",
            id, info.name, info.device_type, info.api_version, info.queue_family_index
        );
    }
    Ok(())
}

fn run_filter(
    config: &Config,
    input: &Path,
    output: &Path,
    verify: bool,
    cpu_only: bool,
) -> Result<()> {
    let image = GrayImage::load(input).with_context(|| format!("Failed to load image: {:?}", input))?;
    log::info!("Loaded {:?} ({}x{})", input, image.width(), image.height());

    let start = Instant::now();
    let filtered = if cpu_only {
        filter::gaussian_blur_cpu(&image, config.filter.sigma)?
    } else {
        let app = App::new(config).context("Failed to initialize Vulkan")?;
        let device = app.device(config.filter.device_id)?;
        let gaussian = GaussianFilter::new(device, &config.filter)
            .with_context(|| format!("Failed to create filter from {:?}", config.filter.shader_path))?;
        let filtered = gaussian.apply(&image)?;

        if verify {
            let reference = filter::gaussian_blur_cpu(&image, config.filter.sigma)?;
            let diff = filter::max_abs_diff(&filtered, &reference).unwrap_or(u8::MAX);
            log::info!("Max difference to host reference: {}", diff);
            if diff > 1 {
                anyhow::bail!("GPU result differs from host reference by {}", diff);
            }
        }
        filtered
    };
    log::info!("Filtered in {:.2?}", start.elapsed());

    filtered
        .save(output)
        .with_context(|| format!("Failed to save image: {:?}", output))?;
    log::info!("Save filtered image as [{:?}].", output);
    Ok(())
}

fn roundtrip(config: &Config, elements: usize, device_id: usize) -> Result<()> {
    let app = App::new(config).context("Failed to initialize Vulkan")?;
    let device = app.device(device_id)?;

    let values: Vec<f32> = (0..elements).map(|i| i as f32).collect();
    let mut host = app.create_cpu_buffer(values.len() * std::mem::size_of::<f32>());
    host.copy_from_slice(&values)?;

    let start = Instant::now();
    let gpu = host.to_device_buffer(device)?;
    let upload = start.elapsed();
    let back: CpuBuffer = gpu.to_cpu_buffer()?;
    let total = start.elapsed();

    log::info!(
        "{} bytes on {}: upload {:.2?}, download {:.2?}",
        gpu.size_byte(),
        device.name(),
        upload,
        total - upload
    );

    if back.to_f32_vec()? != values {
        anyhow::bail!("Data read back from {} does not match", device.name());
    }
    println!("Round trip of {} f32 values OK", elements);
    Ok(())
}
