#![cfg(feature = "gpu-tests")]

// Needs a Vulkan driver with at least one GPU:
//   cargo test --features gpu-tests

use ash::vk;
use std::sync::Arc;
use std::thread;
use vkcompute::backend::shader::read_spirv;
use vkcompute::backend::{create_devices, Buffer, ComputePipeline, CpuBuffer, Instance};
use vkcompute::config::Config;
use vkcompute::filter::{self, GaussianFilter};
use vkcompute::{App, ComputeError, GrayImage};

fn test_config() -> Config {
    let mut config = Config::default();
    config.instance.validation_layers = false;
    config
}

#[test]
fn app_finds_a_device() {
    let app = App::new(&test_config()).unwrap();
    assert!(app.num_devices() > 0);
    assert!(matches!(
        app.device(app.num_devices()),
        Err(ComputeError::InvalidDevice { .. })
    ));
}

#[test]
fn buffers_are_registered_and_returned() {
    let app = App::new(&test_config()).unwrap();
    let device = app.device(0).unwrap();
    let before = device.live_buffers();

    let mut buffer = app.create_buffer(0, 1 << 20).unwrap();
    assert_eq!(buffer.size_byte(), 1 << 20);
    assert_eq!(device.live_buffers(), before + 1);
    assert!(matches!(
        buffer.allocate(device, 16),
        Err(ComputeError::AlreadyAllocated)
    ));

    drop(buffer);
    assert_eq!(device.live_buffers(), before);
}

#[test]
fn zero_sized_buffer_is_rejected() {
    let app = App::new(&test_config()).unwrap();
    assert!(matches!(
        app.create_buffer(0, 0),
        Err(ComputeError::EmptyBuffer)
    ));
}

#[test]
fn cpu_buffer_round_trips_through_device() {
    let app = App::new(&test_config()).unwrap();
    let values: Vec<f32> = (0..250_000).map(|i| i as f32).collect();
    let mut host = app.create_cpu_buffer(values.len() * 4);
    host.copy_from_slice(&values).unwrap();

    let gpu = host.to_device_buffer(app.device(0).unwrap()).unwrap();
    let back = gpu.to_cpu_buffer().unwrap();
    assert_eq!(back.to_f32_vec().unwrap(), values);
}

#[test]
fn upload_size_must_match() {
    let app = App::new(&test_config()).unwrap();
    let buffer = app.create_buffer(0, 64).unwrap();
    assert!(matches!(
        buffer.upload(&CpuBuffer::new(32)),
        Err(ComputeError::SizeMismatch { .. })
    ));
}

#[test]
fn device_outliving_app_keeps_buffers_valid() {
    let config = test_config();
    let instance = Instance::new(&config.instance).unwrap();
    let devices = create_devices(&instance, &config.device).unwrap();
    let device = Arc::clone(&devices[0]);
    drop(devices);
    drop(instance);

    let buffer = Buffer::with_size(&device, 256).unwrap();
    let data = CpuBuffer::from_slice(&[7u8; 256]);
    buffer.upload(&data).unwrap();
    assert_eq!(buffer.to_cpu_buffer().unwrap(), data);
}

#[test]
fn buffer_reports_lost_device() {
    let config = test_config();
    let instance = Instance::new(&config.instance).unwrap();
    let mut devices = create_devices(&instance, &config.device).unwrap();
    let buffer = Buffer::with_size(&devices[0], 16).unwrap();
    devices.clear();
    assert!(matches!(buffer.to_cpu_buffer(), Err(ComputeError::DeviceLost)));
}

#[test]
fn gpu_filter_matches_host_reference() {
    let config = test_config();
    if !config.filter.shader_path.exists() {
        eprintln!("{:?} missing, glslc was not available", config.filter.shader_path);
        return;
    }
    let app = App::new(&config).unwrap();
    let gaussian = GaussianFilter::new(app.device(0).unwrap(), &config.filter).unwrap();

    let (w, h) = (97u32, 45u32);
    let pixels = (0..w * h).map(|i| ((i * 37) % 251) as u8).collect();
    let image = GrayImage::from_raw(w, h, pixels).unwrap();

    let gpu = gaussian.apply(&image).unwrap();
    let cpu = filter::gaussian_blur_cpu(&image, config.filter.sigma).unwrap();
    assert!(filter::max_abs_diff(&gpu, &cpu).unwrap() <= 1);
}

#[test]
fn released_buffer_stays_registered_until_returned() {
    let app = App::new(&test_config()).unwrap();
    let device = app.device(0).unwrap();
    let before = device.live_buffers();

    let mut buffer = app.create_buffer(0, 128).unwrap();
    let handle = buffer.release().unwrap();
    assert_eq!(buffer.size_byte(), 0);
    assert!(!buffer.is_allocated());
    assert_eq!(device.live_buffers(), before + 1);
    assert_eq!(device.buffer_size(handle).unwrap(), 128);

    drop(buffer);
    assert_eq!(device.live_buffers(), before + 1);
    device.return_buffer(handle);
    assert_eq!(device.live_buffers(), before);
}

#[test]
fn returning_unknown_handle_is_harmless() {
    let app = App::new(&test_config()).unwrap();
    let device = app.device(0).unwrap();
    let buffer = app.create_buffer(0, 16).unwrap();
    let before = device.live_buffers();

    device.return_buffer(u32::MAX);
    assert_eq!(device.live_buffers(), before);
    assert_eq!(buffer.to_cpu_buffer().unwrap().len(), 16);
}

#[test]
fn oversized_write_is_rejected() {
    let app = App::new(&test_config()).unwrap();
    let device = app.device(0).unwrap();
    let buffer = app.create_buffer(0, 8).unwrap();
    let handle = buffer.handle().unwrap();
    assert!(matches!(
        device.write_buffer(handle, &[0u8; 9]),
        Err(ComputeError::SizeMismatch {
            expected: 8,
            actual: 9
        })
    ));
    device.write_buffer(handle, &[1u8; 8]).unwrap();
}

#[test]
fn devices_without_int8_requirement_are_created() {
    let mut config = test_config();
    config.device.require_int8 = false;
    config.device.extensions.clear();
    let app = App::new(&config).unwrap();
    assert!(app.num_devices() > 0);

    let values = [1.5f32, -2.0, 3.25];
    let gpu = CpuBuffer::from_slice(&values)
        .to_device_buffer(app.device(0).unwrap())
        .unwrap();
    assert_eq!(gpu.to_cpu_buffer().unwrap().to_f32_vec().unwrap(), values);
}

#[test]
fn timed_out_submit_leaves_device_usable() {
    let mut config = test_config();
    config.device.fence_timeout_ns = 0;
    let instance = Instance::new(&config.instance).unwrap();
    let devices = create_devices(&instance, &config.device).unwrap();
    let device = &devices[0];
    let buffer = Buffer::with_size(device, 64 << 20).unwrap();

    let result = device.submit_one_time(|raw, cmd| unsafe {
        raw.cmd_fill_buffer(cmd, buffer.raw(), 0, vk::WHOLE_SIZE, 0x0101_0101);
    });
    assert!(matches!(result, Ok(()) | Err(ComputeError::Timeout(0))));
    device.wait_idle().unwrap();
}

fn filter_pipeline(device: &Arc<vkcompute::Device>, config: &Config) -> Option<ComputePipeline> {
    if !config.filter.shader_path.exists() {
        eprintln!("{:?} missing, glslc was not available", config.filter.shader_path);
        return None;
    }
    let spirv = read_spirv(&config.filter.shader_path).unwrap();
    Some(ComputePipeline::new(device, &spirv, &config.filter.entry_point, 2, 12).unwrap())
}

#[test]
fn binding_count_must_match_layout() {
    let config = test_config();
    let app = App::new(&config).unwrap();
    let device = app.device(0).unwrap();
    let Some(mut pipeline) = filter_pipeline(device, &config) else {
        return;
    };

    let buffer = app.create_buffer(0, 64).unwrap();
    assert!(matches!(
        pipeline.bind_buffers(&[&buffer]),
        Err(ComputeError::BindingCount {
            expected: 2,
            actual: 1
        })
    ));
    assert!(matches!(
        pipeline.bind_buffers(&[&buffer, &Buffer::new()]),
        Err(ComputeError::NotAllocated)
    ));
    pipeline.bind_buffers(&[&buffer, &buffer]).unwrap();
}

#[test]
fn buffers_from_another_device_are_not_bound() {
    let config = test_config();
    let instance = Instance::new(&config.instance).unwrap();
    let ours = create_devices(&instance, &config.device).unwrap();
    let theirs = create_devices(&instance, &config.device).unwrap();
    let Some(mut pipeline) = filter_pipeline(&ours[0], &config) else {
        return;
    };

    let local = Buffer::with_size(&ours[0], 64).unwrap();
    let foreign = Buffer::with_size(&theirs[0], 64).unwrap();
    assert!(matches!(
        pipeline.bind_buffers(&[&local, &foreign]),
        Err(ComputeError::ForeignBuffer { binding: 1, .. })
    ));
}

#[test]
fn shared_filter_serializes_concurrent_applies() {
    let config = test_config();
    if !config.filter.shader_path.exists() {
        return;
    }
    let app = App::new(&config).unwrap();
    let gaussian = Arc::new(GaussianFilter::new(app.device(0).unwrap(), &config.filter).unwrap());

    let handles: Vec<_> = (0..4u32)
        .map(|seed| {
            let gaussian = Arc::clone(&gaussian);
            thread::spawn(move || {
                let (w, h) = (64 + seed * 7, 40 + seed * 3);
                let pixels = (0..w * h).map(|i| ((i * (seed + 13)) % 256) as u8).collect();
                let image = GrayImage::from_raw(w, h, pixels).unwrap();
                (gaussian.apply(&image).unwrap(), image)
            })
        })
        .collect();

    for handle in handles {
        let (gpu, image) = handle.join().unwrap();
        let cpu = filter::gaussian_blur_cpu(&image, gaussian.sigma()).unwrap();
        assert!(filter::max_abs_diff(&gpu, &cpu).unwrap() <= 1);
    }
}
