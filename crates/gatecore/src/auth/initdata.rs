use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Причины отказа при проверке init data.
///
/// Таксономия полная: каждый путь отказа различим, чтобы граница могла
/// отделить сломанный запрос клиента от подделки подписи и от
/// устаревшей, но в остальном корректной сессии.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InitDataError {
    /// Нечитаемый payload или отсутствующие обязательные поля
    #[error("{0}")]
    MalformedInput(String),

    /// Подпись не сходится (подделка или чужой bot token)
    #[error("Hash mismatch")]
    SignatureInvalid,

    /// Подпись верна, но auth_date старше окна свежести
    #[error("Init data expired ({age_secs} seconds old)")]
    PayloadExpired { age_secs: i64 },
}

/// Проверенная личность пользователя из init data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUser {
    pub telegram_user_id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    /// Реферальный код из start_param (без префикса `ref_`)
    pub referral_code: Option<String>,
}

/// Парсит query string в упорядоченный список пар ключ/значение.
///
/// Значения URL-декодируются; пары без `=` и с нечитаемым значением
/// пропускаются.
fn parse_pairs(init_data: &str) -> Vec<(String, String)> {
    init_data
        .split('&')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some(key), Some(value)) => {
                    let decoded_value = urlencoding::decode(value).ok()?;
                    Some((key.to_string(), decoded_value.to_string()))
                }
                _ => None,
            }
        })
        .collect()
}

fn find<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

/// Каноническая check string: все пары кроме `hash`, отсортированные
/// побайтово по ключу, соединённые через `\n` как `key=value`.
fn build_check_string(pairs: &[(String, String)]) -> String {
    let mut check_pairs: Vec<String> = pairs
        .iter()
        .filter(|(key, _)| key.as_str() != "hash")
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();

    check_pairs.sort();
    check_pairs.join("\n")
}

/// Валидация Telegram Web App init data
///
/// Telegram подписывает данные с помощью HMAC-SHA256.
/// Ключ для HMAC создаётся из bot token: HMAC_SHA256("WebAppData", bot_token)
///
/// # Аргументы
/// * `init_data` - Строка с параметрами от Telegram (query string format)
/// * `bot_token` - Токен бота
/// * `now_unix` - Текущее время (unix seconds)
/// * `max_age_secs` - Окно свежести auth_date
///
/// # Возвращает
/// `Ok(VerifiedUser)` если подпись сходится и payload свежий, иначе
/// структурированную ошибку [`InitDataError`].
pub fn verify_init_data(
    init_data: &str,
    bot_token: &str,
    now_unix: i64,
    max_age_secs: i64,
) -> Result<VerifiedUser, InitDataError> {
    if init_data.trim().is_empty() {
        return Err(InitDataError::MalformedInput("initData is empty".to_string()));
    }

    let pairs = parse_pairs(init_data);
    if pairs.is_empty() {
        return Err(InitDataError::MalformedInput("initData is unparsable".to_string()));
    }

    let user_json = find(&pairs, "user");
    let auth_date_str = find(&pairs, "auth_date");
    let received_hash = find(&pairs, "hash");

    let (user_json, auth_date_str, received_hash) = match (user_json, auth_date_str, received_hash) {
        (Some(u), Some(a), Some(h)) => (u, a, h),
        _ => {
            return Err(InitDataError::MalformedInput(
                "Missing user, auth_date, or hash in initData".to_string(),
            ))
        }
    };

    let data_check_string = build_check_string(&pairs);

    // Ключ подписи: HMAC_SHA256("WebAppData", bot_token)
    let mut secret_key_mac =
        HmacSha256::new_from_slice(b"WebAppData").expect("HMAC can take key of any size");
    secret_key_mac.update(bot_token.as_bytes());
    let secret_key = secret_key_mac.finalize().into_bytes();

    // Сверка подписи за константное время (verify_slice)
    let expected = hex::decode(received_hash).map_err(|_| InitDataError::SignatureInvalid)?;
    let mut mac = HmacSha256::new_from_slice(&secret_key).expect("HMAC can take key of any size");
    mac.update(data_check_string.as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| InitDataError::SignatureInvalid)?;

    // Окно свежести: строго старше max_age — отказ, ровно max_age — проходит
    let auth_date: i64 = auth_date_str
        .parse()
        .map_err(|_| InitDataError::MalformedInput("auth_date is not a number".to_string()))?;
    let age_secs = now_unix - auth_date;
    if age_secs > max_age_secs {
        return Err(InitDataError::PayloadExpired { age_secs });
    }

    let user: serde_json::Value = serde_json::from_str(user_json)
        .map_err(|e| InitDataError::MalformedInput(format!("Failed to parse user JSON: {}", e)))?;

    let telegram_user_id = user
        .get("id")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| InitDataError::MalformedInput("Missing user id in user JSON".to_string()))?;

    let field = |name: &str| {
        user.get(name)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };

    // start_param несёт реферальный код вида "ref_<code>"
    let referral_code = find(&pairs, "start_param")
        .map(|sp| sp.strip_prefix("ref_").unwrap_or(sp).to_string())
        .filter(|code| !code.is_empty());

    Ok(VerifiedUser {
        telegram_user_id,
        first_name: field("first_name"),
        last_name: field("last_name"),
        username: field("username"),
        avatar_url: field("photo_url"),
        referral_code,
    })
}
