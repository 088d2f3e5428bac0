//! Inbound message webhook.
//!
//! The gateway posts form-encoded parameters; JSON bodies with the same keys
//! are accepted for local testing. The handler returns once the reply text is
//! delivered; the voice reply is still being produced in the background.

use crate::error::{AppError, AppResult};
use crate::messaging::InboundMessage;
use crate::pipeline::TurnOutcome;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use std::collections::HashMap;
use tracing::warn;

/// Empty TwiML document: replies go out through the REST API, not the
/// webhook response.
const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;

/// Decode a webhook body into string parameters.
fn parse_params(req: &HttpRequest, body: &[u8]) -> AppResult<HashMap<String, String>> {
    let is_json = req
        .headers()
        .get(actix_web::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().starts_with("application/json"));

    if is_json {
        let values: HashMap<String, serde_json::Value> = serde_json::from_slice(body)?;
        return Ok(values
            .into_iter()
            .map(|(key, value)| match value {
                serde_json::Value::String(text) => (key, text),
                other => (key, other.to_string()),
            })
            .collect());
    }

    let text = std::str::from_utf8(body).map_err(|e| AppError::BadRequest(format!("body is not UTF-8: {}", e)))?;
    web::Query::<HashMap<String, String>>::from_query(text)
        .map(web::Query::into_inner)
        .map_err(|e| AppError::BadRequest(format!("malformed form body: {}", e)))
}

pub async fn receive_message(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> AppResult<HttpResponse> {
    let params = parse_params(&req, &body)?;
    let message = InboundMessage::from_params(&params).map_err(|e| {
        warn!(error = %e, "Rejected webhook payload");
        AppError::BadRequest(e)
    })?;

    let report = state.pipeline.handle(message).await;
    if report.outcome == TurnOutcome::Overloaded {
        return Err(AppError::Overloaded("too many turns in progress".to_string()));
    }

    Ok(HttpResponse::Ok()
        .content_type("text/xml")
        .insert_header(("X-Turn-Outcome", report.outcome.label()))
        .body(EMPTY_TWIML))
}

/// Some gateway consoles send a GET to the URL before saving it.
pub async fn verify() -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain").body("OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support;
    use actix_web::{http::StatusCode, test, App};

    macro_rules! init_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .route("/webhook", web::post().to(receive_message))
                    .route("/webhook", web::get().to(verify)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_form_text_message_is_answered() {
        let (state, echo) = test_support::app_state();
        let app = init_app!(state);

        let req = test::TestRequest::post()
            .uri("/webhook")
            .insert_header(("content-type", "application/x-www-form-urlencoded"))
            .set_payload("From=whatsapp%3A%2B201234567890&Body=Hello+there&MessageSid=SM1&NumMedia=0")
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("X-Turn-Outcome").unwrap(), "replied");
        assert_eq!(*echo.sent.lock().unwrap(), vec!["echo: Hello there"]);
    }

    #[actix_web::test]
    async fn test_json_payload_is_accepted() {
        let (state, echo) = test_support::app_state();
        let app = init_app!(state);

        let req = test::TestRequest::post()
            .uri("/webhook")
            .set_json(serde_json::json!({
                "From": "whatsapp:+15550109999",
                "Body": "Hi",
                "NumMedia": 0
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(*echo.sent.lock().unwrap(), vec!["echo: Hi"]);
    }

    #[actix_web::test]
    async fn test_missing_sender_is_bad_request() {
        let (state, echo) = test_support::app_state();
        let app = init_app!(state);

        let req = test::TestRequest::post()
            .uri("/webhook")
            .insert_header(("content-type", "application/x-www-form-urlencoded"))
            .set_payload("Body=Hello")
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(echo.sent.lock().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn test_get_verification() {
        let (state, _) = test_support::app_state();
        let app = init_app!(state);

        let req = test::TestRequest::get().uri("/webhook").to_request();
        let body = test::call_and_read_body(&app, req).await;
        assert_eq!(&body[..], b"OK");
    }
}
