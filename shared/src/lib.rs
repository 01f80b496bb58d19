use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::{AsRefStr, Display};

/// A single image travelling over the wire. `data` is base64, optionally
/// carrying a `data:image/<fmt>;base64,` header.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ImagePayload {
    pub id: String,
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CleanRequest {
    pub images: Vec<ImagePayload>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CleanResponse {
    pub cleaned_images: Vec<ImagePayload>,
    /// Seconds per image id, plus the whole batch under `"total"`.
    pub processing_times: BTreeMap<String, f64>,
    #[serde(default)]
    pub bypass: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatchRequest {
    pub image1: ImagePayload,
    pub image2: ImagePayload,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum MatchVerdict {
    #[serde(rename = "match")]
    #[strum(serialize = "match")]
    Match,
    #[serde(rename = "no match")]
    #[strum(serialize = "no match")]
    NoMatch,
}

impl MatchVerdict {
    /// A pair matches only when the score is strictly above the threshold.
    pub fn from_score(score: f32, threshold: f32) -> Self {
        if score > threshold {
            MatchVerdict::Match
        } else {
            MatchVerdict::NoMatch
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatchResponse {
    #[serde(rename = "match")]
    pub verdict: MatchVerdict,
    pub similarity_score: f32,
    pub processing_time: f64,
    /// Set when the score came from the random placeholder, not a model.
    #[serde(default)]
    pub bypass: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelStatus {
    pub loaded: bool,
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelsResponse {
    pub cleaner: ModelStatus,
    pub matcher: ModelStatus,
}
