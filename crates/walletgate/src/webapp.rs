use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use gatecore::auth::{self, InitDataError, PinError, PinPolicy};
use gatecore::core::config;
use gatecore::storage::db::{self, DbPool, WalletAccount};
use gatecore::AppError;

// ============================================================================
// СТРУКТУРЫ ДАННЫХ ДЛЯ API
// ============================================================================

/// Запрос на вход через Telegram init data
#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    #[serde(rename = "initData")]
    pub init_data: String,
}

/// Ответ на вход: флаг валидности плюс данные аккаунта
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    #[serde(rename = "isValid")]
    pub is_valid: bool,
    #[serde(rename = "userData", skip_serializing_if = "Option::is_none")]
    pub user_data: Option<WalletAccount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Запрос на установку или замену PIN-кода
#[derive(Debug, Deserialize)]
pub struct SetPinRequest {
    pub telegram_user_id: i64,
    pub pin_code: String,
}

/// Запрос на проверку наличия PIN-кода
#[derive(Debug, Deserialize)]
pub struct CheckPinRequest {
    pub telegram_user_id: i64,
}

/// Запрос на проверку PIN-кода
#[derive(Debug, Deserialize)]
pub struct VerifyPinRequest {
    pub telegram_user_id: i64,
    pub pin_code: String,
}

/// Общий ответ PIN-операций
#[derive(Debug, Serialize)]
pub struct PinResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ответ на проверку наличия PIN-кода
#[derive(Debug, Serialize)]
pub struct CheckPinResponse {
    pub success: bool,
    #[serde(rename = "hasPin")]
    pub has_pin: bool,
}

// ============================================================================
// СОСТОЯНИЕ ПРИЛОЖЕНИЯ
// ============================================================================

/// Shared state для всех endpoints
#[derive(Clone)]
pub struct WalletApiState {
    pub db_pool: Arc<DbPool>,
    pub bot_token: String,
    pub pin_policy: PinPolicy,
}

// ============================================================================
// РОУТЕР
// ============================================================================

/// Создает роутер Mini App API
pub fn create_wallet_router(db_pool: Arc<DbPool>, bot_token: String) -> Router {
    let state = WalletApiState {
        db_pool,
        bot_token,
        pin_policy: config::pin::policy(),
    };

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/auth", post(handle_auth))
        .route("/api/pin/set", post(handle_set_pin))
        .route("/api/pin/check", post(handle_check_pin))
        .route("/api/pin/verify", post(handle_verify_pin))
        .layer(cors_layer())
        .with_state(Arc::new(state))
}

/// CORS для Mini App: конкретный origin из конфигурации или любой
fn cors_layer() -> CorsLayer {
    let origin = config::CORS_ORIGIN.as_str();
    if origin != "*" {
        if let Ok(value) = origin.parse::<HeaderValue>() {
            return CorsLayer::new()
                .allow_origin(value)
                .allow_methods(Any)
                .allow_headers(Any);
        }
        log::warn!("Invalid CORS_ORIGIN '{}', falling back to any origin", origin);
    }

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Запускает веб-сервер Mini App API
pub async fn run_webapp_server(port: u16, db_pool: Arc<DbPool>, bot_token: String) -> anyhow::Result<()> {
    let app = create_wallet_router(db_pool, bot_token);

    let addr = format!("0.0.0.0:{}", port);
    log::info!("Starting wallet API server on http://{}", addr);
    log::info!("  POST /api/auth       - Init data login");
    log::info!("  POST /api/pin/set    - Set or replace PIN");
    log::info!("  POST /api/pin/check  - Check PIN existence");
    log::info!("  POST /api/pin/verify - Verify PIN");
    log::info!("  GET  /api/health     - Health check");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// API HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "walletgate"
    }))
}

/// POST /api/auth - Вход через подписанный init data
///
/// Невалидная подпись и устаревший payload — не сбой сервера: ответ
/// 200 с isValid=false, чтобы клиент различал «не аутентифицирован» и
/// «сломанный запрос» (400).
async fn handle_auth(State(state): State<Arc<WalletApiState>>, Json(req): Json<AuthRequest>) -> Response {
    let now = Utc::now();

    let verified = match auth::verify_init_data(
        &req.init_data,
        &state.bot_token,
        now.timestamp(),
        *config::auth::MAX_AGE,
    ) {
        Ok(user) => user,
        Err(e) => {
            log::warn!("Init data rejected: {}", e);
            let status = match e {
                InitDataError::MalformedInput(_) => StatusCode::BAD_REQUEST,
                InitDataError::SignatureInvalid | InitDataError::PayloadExpired { .. } => StatusCode::OK,
            };
            return (
                status,
                Json(AuthResponse {
                    is_valid: false,
                    user_data: None,
                    error: Some(e.to_string()),
                }),
            )
                .into_response();
        }
    };

    if let Some(ref code) = verified.referral_code {
        log::info!("User {} arrived with referral code {}", verified.telegram_user_id, code);
    }

    let conn = match db::get_connection(&state.db_pool) {
        Ok(conn) => conn,
        Err(e) => return auth_store_failure(e.into()),
    };

    match auth::resolve_account(&conn, &verified, now) {
        Ok(account) => {
            log::info!("Authenticated user {}", account.telegram_user_id);
            Json(AuthResponse {
                is_valid: true,
                user_data: Some(account),
                error: None,
            })
            .into_response()
        }
        Err(e) => auth_store_failure(e),
    }
}

fn auth_store_failure(err: AppError) -> Response {
    log::error!("Failed to resolve wallet account: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(AuthResponse {
            is_valid: false,
            user_data: None,
            error: Some("Failed to resolve wallet account".to_string()),
        }),
    )
        .into_response()
}

/// POST /api/pin/set - Установить или заменить PIN-код
async fn handle_set_pin(State(state): State<Arc<WalletApiState>>, Json(req): Json<SetPinRequest>) -> Response {
    let conn = match db::get_connection(&state.db_pool) {
        Ok(conn) => conn,
        Err(e) => return pin_failure(e.into()),
    };

    match auth::set_pin(&conn, req.telegram_user_id, &req.pin_code, Utc::now()) {
        Ok(()) => Json(PinResponse {
            success: true,
            error: None,
        })
        .into_response(),
        Err(e) => pin_failure(e),
    }
}

/// POST /api/pin/check - Есть ли у аккаунта PIN-код
async fn handle_check_pin(State(state): State<Arc<WalletApiState>>, Json(req): Json<CheckPinRequest>) -> Response {
    let conn = match db::get_connection(&state.db_pool) {
        Ok(conn) => conn,
        Err(e) => return pin_failure(e.into()),
    };

    match auth::has_pin(&conn, req.telegram_user_id) {
        Ok(has_pin) => Json(CheckPinResponse {
            success: true,
            has_pin,
        })
        .into_response(),
        Err(e) => pin_failure(e),
    }
}

/// POST /api/pin/verify - Проверить PIN-код
///
/// Текст ошибки несёт либо число оставшихся попыток, либо секунды до
/// окончания блокировки.
async fn handle_verify_pin(State(state): State<Arc<WalletApiState>>, Json(req): Json<VerifyPinRequest>) -> Response {
    let mut conn = match db::get_connection(&state.db_pool) {
        Ok(conn) => conn,
        Err(e) => return pin_failure(e.into()),
    };

    match auth::verify_pin(
        &mut conn,
        req.telegram_user_id,
        &req.pin_code,
        Utc::now(),
        &state.pin_policy,
    ) {
        Ok(()) => Json(PinResponse {
            success: true,
            error: None,
        })
        .into_response(),
        Err(e) => pin_failure(e),
    }
}

/// Маппинг ошибок PIN-операций в статус и тело {success:false, error}
fn pin_failure(err: AppError) -> Response {
    let status = match &err {
        AppError::Pin(PinError::InvalidFormat) | AppError::Pin(PinError::NotSet) => StatusCode::BAD_REQUEST,
        AppError::Pin(PinError::Mismatch { .. }) => StatusCode::UNAUTHORIZED,
        AppError::Pin(PinError::Locked { .. }) => StatusCode::TOO_MANY_REQUESTS,
        AppError::AccountNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        log::error!("PIN operation failed: {}", err);
    }

    (
        status,
        Json(PinResponse {
            success: false,
            error: Some(err.to_string()),
        }),
    )
        .into_response()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_auth_response_uses_boundary_field_names() {
        let json = serde_json::to_value(AuthResponse {
            is_valid: false,
            user_data: None,
            error: Some("Hash mismatch".to_string()),
        })
        .unwrap();

        assert_eq!(json, serde_json::json!({"isValid": false, "error": "Hash mismatch"}));
    }

    #[test]
    fn test_check_pin_response_shape() {
        let json = serde_json::to_value(CheckPinResponse {
            success: true,
            has_pin: false,
        })
        .unwrap();

        assert_eq!(json, serde_json::json!({"success": true, "hasPin": false}));
    }

    #[test]
    fn test_auth_request_accepts_camel_case() {
        let req: AuthRequest = serde_json::from_str(r#"{"initData": "user=x"}"#).unwrap();
        assert_eq!(req.init_data, "user=x");
    }
}
