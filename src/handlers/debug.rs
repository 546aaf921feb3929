//! Debug endpoints for exercising the pipeline without a WebSocket client.
//!
//! `classify` pushes one frame through the same path a WebSocket frame takes
//! (session state, fallback included). `framewise` runs a whole uploaded WAV
//! file through the model with a fresh state and reports per-window
//! probabilities, which is handy for checking a model artifact against
//! known recordings.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::audio::decoder::decode_wav;
use crate::error::AppError;
use crate::pipeline::{AudioFramePayload, OutboundMessage};
use crate::state::AppState;

/// Largest accepted upload for framewise analysis.
const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;

/// Body of `POST /api/v1/debug/classify`.
#[derive(Debug, Deserialize)]
pub struct ClassifyRequest {
    /// Session to classify for; a fresh id is generated when absent.
    pub session_id: Option<String>,
    /// Same shape as the `data` object of an `audio_frame` message.
    #[serde(default)]
    pub data: AudioFramePayload,
}

/// Classify one frame for a session.
///
/// ## Endpoint: `POST /api/v1/debug/classify`
///
/// ## Request:
/// ```json
/// { "session_id": "optional-id", "data": { "audio": "<base64 PCM16>", "timestamp": 1700000000000 } }
/// ```
///
/// ## Response:
/// The `noise_detection` message a WebSocket client would receive, plus the
/// session id and whether the model or the fallback produced it.
pub async fn classify_frame(
    state: web::Data<AppState>,
    req: web::Json<ClassifyRequest>,
) -> Result<HttpResponse, AppError> {
    let req = req.into_inner();
    let session_id = req
        .session_id
        .unwrap_or_else(|| format!("debug-{}", uuid::Uuid::new_v4()));

    tracing::debug!(session_id = %session_id, "Debug: classifying frame");

    let result = state.pipeline.process_frame(&session_id, &req.data).await?;

    Ok(HttpResponse::Ok().json(json!({
        "session_id": session_id,
        "source": result.source,
        "message": OutboundMessage::from(&result)
    })))
}

/// Framewise VAD over an uploaded WAV file.
///
/// ## Endpoint: `POST /api/v1/debug/framewise`
///
/// ## Request:
/// Multipart form data with a WAV file field named "audio". Any sample rate and
/// channel count is accepted; audio is mixed to mono and resampled to 16kHz.
///
/// ## Errors:
/// - 400 when the field is missing, too large or not a WAV file
/// - 503 when the model cannot be loaded (there is no fallback here)
pub async fn framewise_analysis(
    state: web::Data<AppState>,
    mut payload: actix_multipart::Multipart,
) -> Result<HttpResponse, AppError> {
    use actix_multipart::Field;
    use futures_util::stream::StreamExt;

    let start_time = std::time::Instant::now();

    let mut audio_data: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;

    while let Some(item) = payload.next().await {
        let mut field: Field = item.map_err(|e| AppError::ValidationError(format!("Multipart error: {}", e)))?;

        let content_disposition = field
            .content_disposition()
            .ok_or_else(|| AppError::ValidationError("Missing content disposition".to_string()))?;

        let field_name = content_disposition
            .get_name()
            .ok_or_else(|| AppError::ValidationError("Missing field name".to_string()))?;

        if field_name != "audio" {
            continue;
        }
        filename = content_disposition.get_filename().map(|s| s.to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
            if bytes.len() + chunk.len() > MAX_FILE_SIZE {
                return Err(AppError::ValidationError(format!(
                    "File too large (max: {} bytes)",
                    MAX_FILE_SIZE
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        audio_data = Some(bytes);
    }

    let audio_bytes = audio_data.ok_or_else(|| AppError::ValidationError("No audio file provided".to_string()))?;
    let filename = filename.unwrap_or_else(|| "unknown".to_string());

    let recording = decode_wav(&audio_bytes)?;
    let report = state.pipeline.analyze_framewise(&recording.samples).await?;

    tracing::info!(
        "Debug: framewise analysis of {} ({} frames, speech ratio {:.2}) in {}ms",
        filename,
        report.stats.count,
        report.stats.speech_ratio,
        start_time.elapsed().as_millis()
    );

    Ok(HttpResponse::Ok().json(json!({
        "file_info": {
            "filename": filename,
            "size_bytes": audio_bytes.len(),
            "source_sample_rate": recording.source_sample_rate,
            "source_channels": recording.source_channels
        },
        "model": state.pipeline.engine().family().as_str(),
        "processing_time_ms": start_time.elapsed().as_millis() as u64,
        "report": report
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decoder::encode_pcm16;
    use crate::state::tests::{test_state, unloadable_state};
    use actix_web::{test, App};
    use std::io::Cursor;

    const BOUNDARY: &str = "noise-detection-boundary";

    fn wav_upload(seconds: usize) -> Vec<u8> {
        let samples: Vec<i16> = (0..16_000 * seconds)
            .map(|i| ((i as f32 * 0.05).sin() * 8_000.0) as i16)
            .collect();
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, 16_000, 16);
        let mut wav_bytes = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(samples), &mut wav_bytes).unwrap();

        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"audio\"; filename=\"clip.wav\"\r\nContent-Type: audio/wav\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(&wav_bytes.into_inner());
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/debug/framewise")
            .insert_header((
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(body)
    }

    #[actix_web::test]
    async fn test_classify_keeps_session_state() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/debug/classify", web::post().to(classify_frame)),
        )
        .await;

        let audio = encode_pcm16(&vec![0.2; 512]);
        let req = test::TestRequest::post()
            .uri("/debug/classify")
            .set_json(json!({"session_id": "dbg", "data": {"audio": audio}}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["session_id"], "dbg");
        assert_eq!(body["source"], "model");
        assert_eq!(body["message"]["type"], "noise_detection");
        assert!(state.pipeline.store().contains("dbg").await);
    }

    #[actix_web::test]
    async fn test_classify_rejects_bad_base64() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/debug/classify", web::post().to(classify_frame)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/debug/classify")
            .set_json(json!({"data": {"audio": "%%% not base64 %%%"}}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), 400);
    }

    #[actix_web::test]
    async fn test_classify_without_model_uses_fallback() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(unloadable_state()))
                .route("/debug/classify", web::post().to(classify_frame)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/debug/classify")
            .set_json(json!({"data": {"audio": encode_pcm16(&[0.1; 512])}}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["source"], "fallback");
    }

    #[actix_web::test]
    async fn test_framewise_upload() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/debug/framewise", web::post().to(framewise_analysis)),
        )
        .await;

        let body: serde_json::Value = test::call_and_read_body_json(&app, upload_request(wav_upload(1)).to_request()).await;

        assert_eq!(body["file_info"]["filename"], "clip.wav");
        assert_eq!(body["file_info"]["source_sample_rate"], 16_000);
        assert_eq!(body["report"]["hop"], 256);
        // (16000 - 512) / 256 rounded up
        assert_eq!(body["report"]["stats"]["count"], 61);
        assert_eq!(body["report"]["frames"].as_array().unwrap().len(), 61);
    }

    #[actix_web::test]
    async fn test_framewise_without_model_is_unavailable() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(unloadable_state()))
                .route("/debug/framewise", web::post().to(framewise_analysis)),
        )
        .await;

        let resp = test::call_service(&app, upload_request(wav_upload(1)).to_request()).await;
        assert_eq!(resp.status(), 503);
    }
}
