// Python extension module `vkcompute`
//
//     app = vkcompute.App()
//     cpu = app.create_cpu_buffer(4 * n)
//     cpu.from_numpy(np.arange(n).astype(np.float32))
//     gpu = cpu.to_device_buffer(0)
//     back = gpu.to_cpu_buffer().to_numpy_f32()

use crate::app::App;
use crate::backend::{Buffer, CpuBuffer, Device};
use crate::config::Config;
use crate::error::ComputeError;
use numpy::{PyArray1, PyReadonlyArray1};
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use std::sync::Arc;

fn to_py_err(e: ComputeError) -> PyErr {
    PyRuntimeError::new_err(e.to_string())
}

fn device_at(devices: &[Arc<Device>], device_id: usize) -> PyResult<&Arc<Device>> {
    devices.get(device_id).ok_or_else(|| {
        to_py_err(ComputeError::InvalidDevice {
            id: device_id,
            count: devices.len(),
        })
    })
}

#[pyclass(name = "App", unsendable)]
struct PyApp {
    app: App,
}

#[pymethods]
impl PyApp {
    #[new]
    fn new() -> PyResult<Self> {
        let config = Config::load();
        let app = App::new(&config).map_err(to_py_err)?;
        Ok(Self { app })
    }

    /// Number of usable devices
    fn get_num_devices(&self) -> usize {
        self.app.num_devices()
    }

    /// Allocate `size_byte` bytes on device `device_id`
    #[pyo3(signature = (device_id, size_byte))]
    fn create_buffer(&self, device_id: usize, size_byte: u64) -> PyResult<PyBuffer> {
        let buffer = self
            .app
            .create_buffer(device_id, size_byte)
            .map_err(to_py_err)?;
        Ok(PyBuffer {
            buffer,
            devices: self.app.devices().to_vec(),
        })
    }

    #[pyo3(signature = (size_byte))]
    fn create_cpu_buffer(&self, size_byte: usize) -> PyCpuBuffer {
        PyCpuBuffer {
            buffer: self.app.create_cpu_buffer(size_byte),
            devices: self.app.devices().to_vec(),
        }
    }
}

#[pyclass(name = "Buffer", unsendable)]
struct PyBuffer {
    buffer: Buffer,
    devices: Vec<Arc<Device>>,
}

#[pymethods]
impl PyBuffer {
    #[getter]
    fn size_byte(&self) -> u64 {
        self.buffer.size_byte()
    }

    fn to_cpu_buffer(&self) -> PyResult<PyCpuBuffer> {
        Ok(PyCpuBuffer {
            buffer: self.buffer.to_cpu_buffer().map_err(to_py_err)?,
            devices: self.devices.clone(),
        })
    }
}

#[pyclass(name = "CpuBuffer", unsendable)]
struct PyCpuBuffer {
    buffer: CpuBuffer,
    devices: Vec<Arc<Device>>,
}

#[pymethods]
impl PyCpuBuffer {
    #[getter]
    fn size_byte(&self) -> usize {
        self.buffer.len()
    }

    /// Overwrite the content with `values`; sizes must match
    fn from_f32(&mut self, values: Vec<f32>) -> PyResult<()> {
        self.buffer.copy_from_slice(&values).map_err(to_py_err)
    }

    fn to_f32(&self) -> PyResult<Vec<f32>> {
        self.buffer.to_f32_vec().map_err(to_py_err)
    }

    /// Same as `from_f32` for a 1-D float32 array, without a list round trip
    fn from_numpy(&mut self, values: PyReadonlyArray1<'_, f32>) -> PyResult<()> {
        let copied = match values.as_slice() {
            Ok(contiguous) => self.buffer.copy_from_slice(contiguous),
            Err(_) => {
                let strided: Vec<f32> = values.as_array().iter().copied().collect();
                self.buffer.copy_from_slice(&strided)
            }
        };
        copied.map_err(to_py_err)
    }

    fn to_numpy_f32<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyArray1<f32>>> {
        let values = self.buffer.to_f32_vec().map_err(to_py_err)?;
        Ok(PyArray1::from_vec(py, values))
    }

    #[pyo3(signature = (device_id))]
    fn to_device_buffer(&self, device_id: usize) -> PyResult<PyBuffer> {
        let device = device_at(&self.devices, device_id)?;
        Ok(PyBuffer {
            buffer: self.buffer.to_device_buffer(device).map_err(to_py_err)?,
            devices: self.devices.clone(),
        })
    }
}

#[pymodule]
fn vkcompute(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // The host process may already own the logger
    match Config::read("config.toml") {
        Ok((config, source)) => {
            if crate::logging::init(&config.logging).is_ok() {
                log::info!("{}", source);
            }
        }
        Err(e) => {
            if crate::logging::init(&Config::default().logging).is_ok() {
                log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            }
        }
    }
    m.add_class::<PyApp>()?;
    m.add_class::<PyBuffer>()?;
    m.add_class::<PyCpuBuffer>()?;
    Ok(())
}
