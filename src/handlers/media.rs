//! Serves synthesized replies to the messaging gateway.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{http::header, web, HttpResponse};

/// Media ids are SHA-256 digests in lowercase hex.
fn is_media_key(key: &str) -> bool {
    key.len() == 64 && key.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

pub async fn get_audio(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let key = path.into_inner();
    if !is_media_key(&key) {
        return Err(AppError::NotFound(format!("unknown media id '{}'", key)));
    }

    let audio = state
        .pipeline
        .audio_cache()
        .get_by_key(&key)
        .ok_or_else(|| AppError::NotFound(format!("audio '{}' is not cached", key)))?;

    Ok(HttpResponse::Ok()
        .content_type(audio.content_type.as_str())
        .insert_header((
            header::CACHE_CONTROL,
            format!("public, max-age={}", state.config.cache.audio_ttl_secs),
        ))
        .body(audio.bytes.as_ref().clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedAudio;
    use crate::state::test_support;
    use actix_web::{http::StatusCode, test as web_test, App};
    use std::sync::Arc;

    #[test]
    fn test_media_key_shape() {
        assert!(is_media_key(&"ab12".repeat(16)));
        assert!(!is_media_key("../../etc/passwd"));
        assert!(!is_media_key(&"AB12".repeat(16)));
    }

    #[actix_web::test]
    async fn test_serves_cached_audio() {
        let (state, _) = test_support::app_state();
        let key = state.pipeline.audio_cache().put(
            "en-US",
            "Hi there",
            CachedAudio {
                bytes: Arc::new(b"ID3-bytes".to_vec()),
                content_type: "audio/mpeg".to_string(),
            },
        );
        let app = web_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/audio/{key}", web::get().to(get_audio)),
        )
        .await;

        let req = web_test::TestRequest::get().uri(&format!("/audio/{}", key)).to_request();
        let resp = web_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "audio/mpeg");
        let body = web_test::read_body(resp).await;
        assert_eq!(&body[..], b"ID3-bytes");

        let missing = web_test::TestRequest::get()
            .uri(&format!("/audio/{}", "0".repeat(64)))
            .to_request();
        let resp = web_test::call_service(&app, missing).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
