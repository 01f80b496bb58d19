use crate::codec::{self, CodecError};
use crate::model::{self, Cleaner, InferenceError, MatchOutcome, ModelHandle};
use crate::state::AppState;
use crate::timing::{ProcessingTimes, Timer, timed};
use actix_web::error::{BlockingError, InternalError, JsonPayloadError};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError, web};
use futures::future::try_join_all;
use log::{error, info, warn};
use serde::Serialize;
use shared::{
    CleanRequest, CleanResponse, ImagePayload, MatchRequest, MatchResponse, MatchVerdict,
    StatusResponse,
};
use std::time::Duration;

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

/// Failure of one unit of request work.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("Worker pool unavailable: {0}")]
    Blocking(String),
}

impl From<BlockingError> for ProcessingError {
    fn from(err: BlockingError) -> Self {
        ProcessingError::Blocking(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("Failed to process image {id}: {source}")]
    Clean {
        id: String,
        source: ProcessingError,
    },
    #[error("Failed to match signatures: {0}")]
    Match(ProcessingError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Clean { .. } | ApiError::Match(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            detail: self.to_string(),
        })
    }
}

/// JSON extractor settings: a body limit large enough for base64 images, and
/// malformed bodies answered as `{"detail": ...}`.
pub fn json_config(limit: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(limit)
        .error_handler(|err, _req| {
            let detail = err.to_string();
            warn!("Rejected request body: {}", detail);
            let status = match err {
                JsonPayloadError::Overflow { .. } | JsonPayloadError::OverflowKnownLength { .. } => {
                    StatusCode::PAYLOAD_TOO_LARGE
                }
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            };
            InternalError::from_response(err, HttpResponse::build(status).json(ErrorResponse { detail }))
                .into()
        })
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(root)))
        .service(web::resource("/clean").route(web::post().to(clean_signatures)))
        .service(web::resource("/match").route(web::post().to(match_signatures)))
        .service(web::resource("/models").route(web::get().to(model_status)));
}

async fn root() -> HttpResponse {
    HttpResponse::Ok().json(StatusResponse {
        status: "Signature Verification API is running".to_string(),
    })
}

async fn model_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.model_status())
}

fn clean_one(
    cleaner: &ModelHandle<dyn Cleaner>,
    payload: ImagePayload,
    placeholder_delay: Duration,
    times: &ProcessingTimes,
) -> Result<ImagePayload, ProcessingError> {
    let ImagePayload { id, data } = payload;
    timed(format!("Image ID {id} cleaning"), times, &id, || -> Result<ImagePayload, ProcessingError> {
        let input = codec::decode(&data)?;
        let cleaned = model::run_cleaner(cleaner, input, placeholder_delay)?;
        Ok(ImagePayload {
            id: id.clone(),
            data: codec::encode_png(&cleaned)?,
        })
    })
}

/// Cleans every image on the blocking pool. Results keep the request order;
/// the first failure fails the whole request.
async fn clean_signatures(
    state: web::Data<AppState>,
    request: web::Json<CleanRequest>,
) -> Result<HttpResponse, ApiError> {
    let CleanRequest { images } = request.into_inner();
    if images.is_empty() {
        return Err(ApiError::Validation {
            field: "images",
            message: "must contain at least one image".to_string(),
        });
    }

    let times = ProcessingTimes::new();
    let cleaned_images = {
        let _total = Timer::start("Total cleaning time for all images", &times, "total");

        let tasks = images.into_iter().map(|payload| {
            let cleaner = state.cleaner.clone();
            let delay = state.clean_delay();
            let times = times.clone();
            async move {
                let id = payload.id.clone();
                let result = web::block(move || clean_one(&cleaner, payload, delay, &times))
                    .await
                    .map_err(ProcessingError::from)
                    .and_then(|cleaned| cleaned);

                result.map_err(|source| {
                    error!("Error processing image {}: {}", id, source);
                    ApiError::Clean { id, source }
                })
            }
        });

        try_join_all(tasks).await?
    };

    Ok(HttpResponse::Ok().json(CleanResponse {
        cleaned_images,
        processing_times: times.snapshot(),
        bypass: !state.cleaner.is_present(),
    }))
}

async fn match_signatures(
    state: web::Data<AppState>,
    request: web::Json<MatchRequest>,
) -> Result<HttpResponse, ApiError> {
    let MatchRequest { image1, image2 } = request.into_inner();
    info!("Matching signature {} against {}", image1.id, image2.id);

    let times = ProcessingTimes::new();
    let matcher = state.matcher.clone();
    let delay = state.match_delay();

    let outcome = {
        let _total = Timer::start("Total matching time", &times, "total");
        web::block(move || -> Result<MatchOutcome, ProcessingError> {
            let first = codec::decode(&image1.data)?;
            let second = codec::decode(&image2.data)?;
            Ok(model::run_matcher(&matcher, &first, &second, delay)?)
        })
        .await
        .map_err(ProcessingError::from)
        .and_then(|outcome| outcome)
    };

    let outcome = outcome.map_err(|source| {
        error!("Error during matching: {}", source);
        ApiError::Match(source)
    })?;

    Ok(HttpResponse::Ok().json(MatchResponse {
        verdict: MatchVerdict::from_score(outcome.score, state.match_threshold),
        similarity_score: outcome.score,
        processing_time: times.get("total").unwrap_or(0.0),
        bypass: outcome.bypass,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::{sample_image, sample_png_base64};
    use crate::config::{PlaceholderConfig, ServiceConfig};
    use crate::model::Matcher;
    use actix_web::http::header::ContentType;
    use actix_web::{App, test};
    use image::DynamicImage;
    use serde_json::{Value, json};
    use std::sync::Arc;

    struct Invert;

    impl Cleaner for Invert {
        fn clean(&self, image: &DynamicImage) -> Result<DynamicImage, InferenceError> {
            let mut image = image.clone();
            image.invert();
            Ok(image)
        }
    }

    struct Broken;

    impl Cleaner for Broken {
        fn clean(&self, _: &DynamicImage) -> Result<DynamicImage, InferenceError> {
            Err(InferenceError::Model("CUDA out of memory".to_string()))
        }
    }

    struct Fixed(f32);

    impl Matcher for Fixed {
        fn score(&self, _: &DynamicImage, _: &DynamicImage) -> Result<f32, InferenceError> {
            Ok(self.0)
        }
    }

    fn state(cleaner: ModelHandle<dyn Cleaner>, matcher: ModelHandle<dyn Matcher>) -> AppState {
        let config = ServiceConfig {
            placeholder: PlaceholderConfig {
                clean_delay_ms: 0,
                match_delay_ms: 0,
            },
            ..ServiceConfig::default()
        };
        AppState::new(cleaner, matcher, &config)
    }

    fn bypass_state() -> AppState {
        state(ModelHandle::Absent, ModelHandle::Absent)
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .app_data(json_config(1 << 20))
                    .configure(configure_routes),
            )
            .await
        };
    }

    fn payload(id: &str, data: String) -> Value {
        json!({ "id": id, "data": data })
    }

    #[actix_web::test]
    async fn root_reports_status() {
        let app = app!(bypass_state());
        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: StatusResponse = test::read_body_json(resp).await;
        assert_eq!(body.status, "Signature Verification API is running");
    }

    #[actix_web::test]
    async fn bypass_clean_returns_identical_image() {
        let app = app!(bypass_state());
        let original = sample_png_base64(12, 7);
        let req = test::TestRequest::post()
            .uri("/clean")
            .set_json(json!({ "images": [payload("a", original.clone())] }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: CleanResponse = test::read_body_json(resp).await;
        assert!(body.bypass);
        assert_eq!(body.cleaned_images.len(), 1);
        assert_eq!(body.cleaned_images[0].id, "a");

        let returned = codec::decode(&body.cleaned_images[0].data).unwrap();
        let sent = codec::decode(&original).unwrap();
        assert_eq!(returned.to_rgba8(), sent.to_rgba8());

        assert!(body.processing_times.contains_key("a"));
        assert!(body.processing_times.contains_key("total"));
        assert!(body.processing_times.values().all(|secs| *secs >= 0.0));
    }

    #[actix_web::test]
    async fn clean_preserves_order_and_ids() {
        let app = app!(bypass_state());
        let ids = ["third", "first", "second", "first-again"];
        let images: Vec<Value> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| payload(id, sample_png_base64(3 + i as u32, 2)))
            .collect();
        let req = test::TestRequest::post()
            .uri("/clean")
            .set_json(json!({ "images": images }))
            .to_request();
        let body: CleanResponse = test::call_and_read_body_json(&app, req).await;

        let returned: Vec<&str> = body.cleaned_images.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(returned, ids);
        for (i, image) in body.cleaned_images.iter().enumerate() {
            assert_eq!(codec::decode(&image.data).unwrap().width(), 3 + i as u32);
        }
        assert_eq!(body.processing_times.len(), ids.len() + 1);
    }

    #[actix_web::test]
    async fn one_malformed_image_fails_the_batch() {
        let app = app!(bypass_state());
        let req = test::TestRequest::post()
            .uri("/clean")
            .set_json(json!({
                "images": [
                    payload("good", sample_png_base64(4, 4)),
                    payload("bad", "data:image/png;base64,!!!".to_string()),
                    payload("also-good", sample_png_base64(4, 4)),
                ]
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body: Value = test::read_body_json(resp).await;
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.starts_with("Failed to process image bad:"), "{detail}");
        assert!(body.get("cleaned_images").is_none());
    }

    #[actix_web::test]
    async fn empty_batch_is_rejected() {
        let app = app!(bypass_state());
        let req = test::TestRequest::post()
            .uri("/clean")
            .set_json(json!({ "images": [] }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["detail"], "images: must contain at least one image");
    }

    #[actix_web::test]
    async fn malformed_body_is_unprocessable() {
        let app = app!(bypass_state());
        let req = test::TestRequest::post()
            .uri("/match")
            .insert_header(ContentType::json())
            .set_payload(r#"{"image1": {"id": "a"}}"#)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["detail"].is_string());
    }

    #[actix_web::test]
    async fn oversized_body_is_payload_too_large() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(bypass_state()))
                .app_data(json_config(256))
                .configure(configure_routes),
        )
        .await;
        let req = test::TestRequest::post()
            .uri("/clean")
            .set_json(json!({ "images": [payload("big", sample_png_base64(32, 32))] }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["detail"].is_string());
    }

    #[actix_web::test]
    async fn present_cleaner_transforms_images() {
        let app = app!(state(ModelHandle::Present(Arc::new(Invert)), ModelHandle::Absent));
        let req = test::TestRequest::post()
            .uri("/clean")
            .set_json(json!({ "images": [payload("sig", sample_png_base64(5, 5))] }))
            .to_request();
        let body: CleanResponse = test::call_and_read_body_json(&app, req).await;
        assert!(!body.bypass);

        let mut expected = sample_image(5, 5);
        expected.invert();
        let returned = codec::decode(&body.cleaned_images[0].data).unwrap();
        assert_eq!(returned.to_rgba8(), expected.to_rgba8());
    }

    #[actix_web::test]
    async fn inference_failure_names_the_image() {
        let app = app!(state(ModelHandle::Present(Arc::new(Broken)), ModelHandle::Absent));
        let req = test::TestRequest::post()
            .uri("/clean")
            .set_json(json!({ "images": [payload("x-17", sample_png_base64(2, 2))] }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(
            body["detail"],
            "Failed to process image x-17: Model forward pass failed: CUDA out of memory"
        );
    }

    #[actix_web::test]
    async fn bypass_match_is_consistent_with_its_score() {
        let app = app!(bypass_state());
        let image = sample_png_base64(6, 6);
        for _ in 0..10 {
            let req = test::TestRequest::post()
                .uri("/match")
                .set_json(json!({
                    "image1": payload("left", image.clone()),
                    "image2": payload("right", image.clone()),
                }))
                .to_request();
            let body: MatchResponse = test::call_and_read_body_json(&app, req).await;
            assert!(body.bypass);
            assert!((0.0..1.0).contains(&body.similarity_score));
            assert!(body.processing_time >= 0.0);
            let expected = if body.similarity_score > 0.6 {
                MatchVerdict::Match
            } else {
                MatchVerdict::NoMatch
            };
            assert_eq!(body.verdict, expected);
        }
    }

    #[actix_web::test]
    async fn present_matcher_uses_threshold() {
        for (score, verdict) in [(0.9, "match"), (0.6, "no match"), (0.1, "no match")] {
            let app = app!(state(ModelHandle::Absent, ModelHandle::Present(Arc::new(Fixed(score)))));
            let req = test::TestRequest::post()
                .uri("/match")
                .set_json(json!({
                    "image1": payload("a", sample_png_base64(3, 3)),
                    "image2": payload("b", sample_png_base64(4, 4)),
                }))
                .to_request();
            let body: Value = test::call_and_read_body_json(&app, req).await;
            assert_eq!(body["match"], verdict);
            assert_eq!(body["bypass"], false);
            assert!((body["similarity_score"].as_f64().unwrap() - score as f64).abs() < 1e-6);
        }
    }

    #[actix_web::test]
    async fn undecodable_match_input_is_a_server_error() {
        let app = app!(bypass_state());
        let req = test::TestRequest::post()
            .uri("/match")
            .set_json(json!({
                "image1": payload("a", sample_png_base64(3, 3)),
                "image2": payload("b", "aGVsbG8gd29ybGQ=".to_string()),
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(
            body["detail"],
            "Failed to match signatures: Unsupported image format"
        );
    }

    #[actix_web::test]
    async fn models_endpoint_reports_bypass() {
        let app = app!(state(ModelHandle::Present(Arc::new(Invert)), ModelHandle::Absent));
        let req = test::TestRequest::get().uri("/models").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["cleaner"]["loaded"], true);
        assert_eq!(body["matcher"]["loaded"], false);
        assert_eq!(body["matcher"]["path"], "models_weights/siamese_transformer.pth");
    }
}
