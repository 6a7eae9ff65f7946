use crate::{error::BridgeError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /config`; secrets are reported only as configured or not.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, BridgeError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config.redacted()
    })))
}

/// `PUT /config` with a partial document of runtime tunables.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, BridgeError> {
    let json_str = serde_json::to_string(&body.into_inner())?;
    let updated = state.update_config(&json_str)?;

    tracing::info!("Configuration updated; applies to calls started from now on");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": updated.redacted()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::testing::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_get_config_never_echoes_api_key() {
        let mut config = AppConfig::default();
        config.realtime.api_key = Some("sk-live-123".to_string());
        let (state, _peers) = test_state(config);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8_lossy(&body);
        assert!(!text.contains("sk-live-123"));

        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["config"]["realtime"]["api_key_configured"], true);
    }

    #[actix_web::test]
    async fn test_update_config() {
        let (state, _peers) = test_state(AppConfig::default());
        let data = web::Data::new(state);
        let app = test::init_service(
            App::new()
                .app_data(data.clone())
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"realtime": {"barge_in": false}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert!(!data.get_config().realtime.barge_in);

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"server": {"port": 1}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
        assert_eq!(data.get_config().server.port, 5050);
    }
}
