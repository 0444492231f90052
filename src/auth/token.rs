use serde::Deserialize;

use super::{AuthError, ClientKeys, Credential};

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: String,
}

/// Error body of the token endpoint, see RFC 6749 section 5.2.
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Trades the refresh token of `credential` for a new access token.
pub(super) async fn refresh_access_token(
    http: &reqwest::Client,
    token_uri: &str,
    credential: &Credential,
) -> Result<TokenResponse, AuthError> {
    let params = [
        ("client_id", credential.client_id.as_str()),
        ("client_secret", credential.client_secret.as_str()),
        ("refresh_token", credential.refresh_token.as_str()),
        ("grant_type", "refresh_token"),
    ];
    token_request(http, token_uri, &params).await
}

/// Trades an authorization code of the consent flow for tokens.
pub(super) async fn exchange_code(
    http: &reqwest::Client,
    token_uri: &str,
    keys: &ClientKeys,
    code: &str,
    redirect_uri: &str,
) -> Result<TokenResponse, AuthError> {
    let params = [
        ("client_id", keys.client_id.as_str()),
        ("client_secret", keys.client_secret.as_str()),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("grant_type", "authorization_code"),
    ];
    let token = token_request(http, token_uri, &params).await?;

    if token.refresh_token.is_none() {
        log::warn!(
            target: "auth",
            "Token endpoint returned no refresh token, the app may have been authorized before"
        );
    }

    Ok(token)
}

async fn token_request(
    http: &reqwest::Client,
    token_uri: &str,
    params: &[(&str, &str)],
) -> Result<TokenResponse, AuthError> {
    let response = http.post(token_uri).form(params).send().await?;
    let status = response.status();

    if status.is_success() {
        return Ok(response.json::<TokenResponse>().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let error = match serde_json::from_str::<TokenErrorResponse>(&body) {
        Ok(TokenErrorResponse {
            error,
            error_description: Some(description),
        }) => format!("{error}: {description}"),
        Ok(TokenErrorResponse { error, .. }) => error,
        Err(_) => body,
    };

    Err(AuthError::TokenRejected {
        status: status.as_u16(),
        error,
    })
}
