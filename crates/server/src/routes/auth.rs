use axum::{
    Json, Router,
    extract::State,
    http::{
        HeaderMap, HeaderName,
        header::{SET_COOKIE, USER_AGENT},
    },
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::user::User;
use deployment::Deployment;
use rpc::{
    AuthSession,
    api::auth::{SignIn, SignUp},
};
use utils::response::ApiResponse;

use crate::{error::ApiError, middleware::Scope};

type WithCookie<T> = ([(HeaderName, String); 1], ResponseJson<ApiResponse<T>>);

/// GET /api/auth/session
/// The signed-in principal, or null
pub async fn get_session(Scope(scope): Scope) -> ResponseJson<ApiResponse<Option<AuthSession>>> {
    ResponseJson(ApiResponse::success(scope.session().await))
}

/// POST /api/auth/sign-up
pub async fn sign_up(
    State(deployment): State<Deployment>,
    headers: HeaderMap,
    Json(input): Json<SignUp>,
) -> Result<WithCookie<User>, ApiError> {
    let (ip, user_agent) = client_meta(&headers);
    let (user, signed) = deployment.auth().sign_up(&input, ip, user_agent).await?;
    Ok((
        [(SET_COOKIE, deployment.auth().session_cookie(&signed))],
        ResponseJson(ApiResponse::success(user)),
    ))
}

/// POST /api/auth/sign-in
pub async fn sign_in(
    State(deployment): State<Deployment>,
    headers: HeaderMap,
    Json(input): Json<SignIn>,
) -> Result<WithCookie<User>, ApiError> {
    let (ip, user_agent) = client_meta(&headers);
    let (user, signed) = deployment.auth().sign_in(&input, ip, user_agent).await?;
    Ok((
        [(SET_COOKIE, deployment.auth().session_cookie(&signed))],
        ResponseJson(ApiResponse::success(user)),
    ))
}

/// POST /api/auth/sign-out
pub async fn sign_out(
    State(deployment): State<Deployment>,
    headers: HeaderMap,
) -> Result<WithCookie<bool>, ApiError> {
    let revoked = deployment.auth().revoke_session(&headers).await?;
    Ok((
        [(SET_COOKIE, deployment.auth().clear_session_cookie())],
        ResponseJson(ApiResponse::success(revoked)),
    ))
}

/// First `X-Forwarded-For` hop and the user agent, recorded on the session row.
fn client_meta(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let ip = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    let user_agent = header_str(headers, USER_AGENT.as_str()).map(str::to_string);
    (ip, user_agent)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn router(_deployment: &Deployment) -> Router<Deployment> {
    Router::new().nest(
        "/auth",
        Router::new()
            .route("/session", get(get_session))
            .route("/sign-up", post(sign_up))
            .route("/sign-in", post(sign_in))
            .route("/sign-out", post(sign_out)),
    )
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn client_meta_takes_the_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"));
        headers.insert(USER_AGENT, HeaderValue::from_static("curl/8.0"));
        assert_eq!(
            client_meta(&headers),
            (Some("203.0.113.7".to_string()), Some("curl/8.0".to_string()))
        );
        assert_eq!(client_meta(&HeaderMap::new()), (None, None));
    }
}
