//! Model handles, the inference contracts, and startup loading.

pub mod placeholder;
pub mod preprocess;
#[cfg(feature = "torch")]
pub mod torch;

use crate::config::ModelsConfig;
use image::DynamicImage;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Cleaning,
    Matching,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Cleaning => write!(f, "cleaning"),
            ModelKind::Matching => write!(f, "matching"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("{kind} model not found at {}", .path.display())]
    NotFound { kind: ModelKind, path: PathBuf },
    #[error("Failed to load {kind} model from {}: {reason}", .path.display())]
    Load {
        kind: ModelKind,
        path: PathBuf,
        reason: String,
    },
}

#[cfg_attr(not(feature = "torch"), allow(dead_code))]
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Preprocessing failed: {0}")]
    Preprocessing(String),
    #[error("Model forward pass failed: {0}")]
    Model(String),
    #[error("Postprocessing failed: {0}")]
    Postprocessing(String),
    #[error("Model lock poisoned by an earlier failure")]
    Poisoned,
}

#[cfg(feature = "torch")]
impl From<tch::TchError> for InferenceError {
    fn from(err: tch::TchError) -> Self {
        InferenceError::Model(err.to_string())
    }
}

/// Image-to-image model that removes noise from a signature.
pub trait Cleaner: Send + Sync {
    fn clean(&self, image: &DynamicImage) -> Result<DynamicImage, InferenceError>;
}

/// Pairwise model scoring how similar two signatures are, in [0, 1].
pub trait Matcher: Send + Sync {
    fn score(&self, first: &DynamicImage, second: &DynamicImage) -> Result<f32, InferenceError>;
}

/// A loaded model, or `Absent` when startup fell back to bypass mode.
pub enum ModelHandle<T: ?Sized> {
    Present(Arc<T>),
    Absent,
}

impl<T: ?Sized> ModelHandle<T> {
    pub fn is_present(&self) -> bool {
        matches!(self, ModelHandle::Present(_))
    }
}

impl<T: ?Sized> Clone for ModelHandle<T> {
    fn clone(&self) -> Self {
        match self {
            ModelHandle::Present(model) => ModelHandle::Present(Arc::clone(model)),
            ModelHandle::Absent => ModelHandle::Absent,
        }
    }
}

impl<T: ?Sized> fmt::Debug for ModelHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelHandle::Present(_) => write!(f, "Present"),
            ModelHandle::Absent => write!(f, "Absent"),
        }
    }
}

/// Result of a match, before the verdict is derived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOutcome {
    pub score: f32,
    /// The score came from the placeholder.
    pub bypass: bool,
}

/// Loads one model. A missing file or a failing `loader` is fatal unless
/// `bypass` is set, in which case the handle is `Absent`.
pub fn load_model<T, E, F>(
    kind: ModelKind,
    path: &Path,
    bypass: bool,
    loader: F,
) -> Result<ModelHandle<T>, ModelError>
where
    T: ?Sized,
    E: fmt::Display,
    F: FnOnce(&Path) -> Result<Arc<T>, E>,
{
    log::info!("Attempting to load signature {kind} model...");

    if !path.exists() {
        log::error!("{kind} model not found at {}", path.display());
        return degrade(
            bypass,
            ModelError::NotFound {
                kind,
                path: path.to_path_buf(),
            },
        );
    }

    match loader(path) {
        Ok(model) => {
            log::info!("Signature {kind} model loaded successfully.");
            Ok(ModelHandle::Present(model))
        }
        Err(e) => {
            log::error!("Failed to load {kind} model from {}. Error: {e}", path.display());
            degrade(
                bypass,
                ModelError::Load {
                    kind,
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                },
            )
        }
    }
}

fn degrade<T: ?Sized>(bypass: bool, err: ModelError) -> Result<ModelHandle<T>, ModelError> {
    if bypass {
        log::warn!("MODEL_ERROR_BYPASS_FLAG is set ({err}). Proceeding with placeholder functionality.");
        Ok(ModelHandle::Absent)
    } else {
        Err(err)
    }
}

#[cfg(feature = "torch")]
pub fn load_cleaner(config: &ModelsConfig) -> Result<ModelHandle<dyn Cleaner>, ModelError> {
    let device = torch::select_device(config.gpu_id);
    load_model(
        ModelKind::Cleaning,
        &config.cleaning_model_path,
        config.error_bypass,
        |path| torch::TorchCleaner::load(path, device).map(|m| Arc::new(m) as Arc<dyn Cleaner>),
    )
}

#[cfg(feature = "torch")]
pub fn load_matcher(config: &ModelsConfig) -> Result<ModelHandle<dyn Matcher>, ModelError> {
    let device = torch::select_device(config.gpu_id);
    load_model(
        ModelKind::Matching,
        &config.matching_model_path,
        config.error_bypass,
        |path| torch::TorchMatcher::load(path, device).map(|m| Arc::new(m) as Arc<dyn Matcher>),
    )
}

#[cfg(not(feature = "torch"))]
const NO_RUNTIME: &str = "built without the torch runtime (enable the `torch` feature)";

#[cfg(not(feature = "torch"))]
pub fn load_cleaner(config: &ModelsConfig) -> Result<ModelHandle<dyn Cleaner>, ModelError> {
    load_model(
        ModelKind::Cleaning,
        &config.cleaning_model_path,
        config.error_bypass,
        |_path| Err::<Arc<dyn Cleaner>, _>(NO_RUNTIME),
    )
}

#[cfg(not(feature = "torch"))]
pub fn load_matcher(config: &ModelsConfig) -> Result<ModelHandle<dyn Matcher>, ModelError> {
    load_model(
        ModelKind::Matching,
        &config.matching_model_path,
        config.error_bypass,
        |_path| Err::<Arc<dyn Matcher>, _>(NO_RUNTIME),
    )
}

/// Runs the cleaner when one is loaded, otherwise the identity placeholder.
pub fn run_cleaner(
    cleaner: &ModelHandle<dyn Cleaner>,
    image: DynamicImage,
    placeholder_delay: Duration,
) -> Result<DynamicImage, InferenceError> {
    match cleaner {
        ModelHandle::Present(model) => model.clean(&image),
        ModelHandle::Absent => Ok(placeholder::clean(image, placeholder_delay)),
    }
}

pub fn run_matcher(
    matcher: &ModelHandle<dyn Matcher>,
    first: &DynamicImage,
    second: &DynamicImage,
    placeholder_delay: Duration,
) -> Result<MatchOutcome, InferenceError> {
    match matcher {
        ModelHandle::Present(model) => {
            let score = model.score(first, second)?;
            if score.is_nan() {
                return Err(InferenceError::Postprocessing(
                    "matcher produced a NaN score".to_string(),
                ));
            }
            Ok(MatchOutcome {
                score: score.clamp(0.0, 1.0),
                bypass: false,
            })
        }
        ModelHandle::Absent => Ok(MatchOutcome {
            score: placeholder::match_score(placeholder_delay),
            bypass: true,
        }),
    }
}
