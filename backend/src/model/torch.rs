//! TorchScript-backed adapters.

use super::preprocess::{self, MODEL_INPUT};
use super::{Cleaner, InferenceError, Matcher};
use image::DynamicImage;
use ndarray::Array3;
use std::path::Path;
use std::sync::Mutex;
use tch::{CModule, Device, Kind, Tensor};

pub fn select_device(gpu_id: i64) -> Device {
    if gpu_id >= 0 && tch::Cuda::is_available() {
        log::info!("Using GPU: {gpu_id}");
        Device::Cuda(gpu_id as usize)
    } else {
        log::info!("Using CPU.");
        Device::Cpu
    }
}

fn load_module(path: &Path, device: Device) -> Result<Mutex<CModule>, tch::TchError> {
    log::info!("Loading model from {}", path.display());
    let mut module = CModule::load_on_device(path, device)?;
    module.set_eval();
    Ok(Mutex::new(module))
}

/// Batch of one, NCHW.
fn to_tensor(array: &Array3<f32>, device: Device) -> Result<Tensor, InferenceError> {
    let (c, h, w) = array.dim();
    let data = array.as_slice().ok_or_else(|| {
        InferenceError::Preprocessing("input array is not contiguous".to_string())
    })?;
    Ok(Tensor::from_slice(data)
        .view([1, c as i64, h as i64, w as i64])
        .to_device(device))
}

fn to_array(output: &Tensor) -> Result<Array3<f32>, InferenceError> {
    let output = output.to_device(Device::Cpu).to_kind(Kind::Float);
    let output = if output.dim() == 4 { output.squeeze_dim(0) } else { output };
    let size = output.size();
    let &[c, h, w] = size.as_slice() else {
        return Err(InferenceError::Postprocessing(format!(
            "expected a CHW output tensor, got shape {size:?}"
        )));
    };

    let data = Vec::<f32>::try_from(output.reshape([-1]))?;
    Array3::from_shape_vec((c as usize, h as usize, w as usize), data)
        .map_err(|e| InferenceError::Postprocessing(e.to_string()))
}

/// Generator network: dirty signature in, clean signature out.
pub struct TorchCleaner {
    model: Mutex<CModule>,
    device: Device,
}

impl TorchCleaner {
    pub fn load(path: &Path, device: Device) -> Result<Self, tch::TchError> {
        Ok(Self {
            model: load_module(path, device)?,
            device,
        })
    }
}

impl Cleaner for TorchCleaner {
    fn clean(&self, image: &DynamicImage) -> Result<DynamicImage, InferenceError> {
        let input = to_tensor(&preprocess::to_normalized_chw(image, MODEL_INPUT), self.device)?;

        let output = {
            let model = self.model.lock().map_err(|_| InferenceError::Poisoned)?;
            tch::no_grad(|| model.forward_ts(&[input]))?
        };

        let cleaned = preprocess::from_normalized_chw(&to_array(&output)?)?;
        Ok(DynamicImage::ImageRgb8(cleaned))
    }
}

/// Siamese network: two signatures in, one similarity score out.
pub struct TorchMatcher {
    model: Mutex<CModule>,
    device: Device,
}

impl TorchMatcher {
    pub fn load(path: &Path, device: Device) -> Result<Self, tch::TchError> {
        Ok(Self {
            model: load_module(path, device)?,
            device,
        })
    }
}

impl Matcher for TorchMatcher {
    fn score(&self, first: &DynamicImage, second: &DynamicImage) -> Result<f32, InferenceError> {
        let first = to_tensor(&preprocess::to_normalized_chw(first, MODEL_INPUT), self.device)?;
        let second = to_tensor(&preprocess::to_normalized_chw(second, MODEL_INPUT), self.device)?;

        let output = {
            let model = self.model.lock().map_err(|_| InferenceError::Poisoned)?;
            tch::no_grad(|| model.forward_ts(&[first, second]))?
        };

        let scores = output.to_device(Device::Cpu).to_kind(Kind::Float).reshape([-1]);
        let scores = Vec::<f32>::try_from(scores)?;
        scores
            .first()
            .copied()
            .ok_or_else(|| InferenceError::Postprocessing("matcher returned no score".to_string()))
    }
}
