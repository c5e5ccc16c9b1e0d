//! Server-rendered page shells. Each protected page prefetches the queries its client
//! code reads first and embeds them as hydration state.

use axum::{
    Router,
    extract::State,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use deployment::Deployment;
use rpc::{
    ServerPrefetcher,
    api::post::{self, ListPosts},
    hydration,
};

use crate::{
    error::ApiError,
    middleware::{SIGN_IN_PATH, Scope},
};

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn shell(title: &str, body: &str) -> Html<String> {
    Html(format!(
        r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>{} | Postboard</title></head>
<body>
{}
</body>
</html>"#,
        escape(title),
        body
    ))
}

/// GET /dashboard
pub async fn dashboard(
    State(deployment): State<Deployment>,
    Scope(scope): Scope,
) -> Result<Response, ApiError> {
    let ctx = scope.context().await;
    let Some(session) = ctx.session.clone() else {
        return Ok(Redirect::to(SIGN_IN_PATH).into_response());
    };

    let prefetcher = ServerPrefetcher::new(deployment.registry().clone(), ctx);
    prefetcher.prefetch(post::LIST, &ListPosts::default());
    let state = prefetcher.dehydrate().await;
    let script = hydration::render_state_script(&state)?;

    let body = format!(
        r#"<main id="dashboard" data-user="{}">
<h1>Welcome back, {}</h1>
<section id="posts"></section>
</main>
{}"#,
        session.user.id,
        escape(&session.user.name),
        script
    );
    Ok(shell("Dashboard", &body).into_response())
}

/// GET /settings
pub async fn settings(Scope(scope): Scope) -> Response {
    let Some(session) = scope.session().await else {
        return Redirect::to(SIGN_IN_PATH).into_response();
    };
    let body = format!(
        r#"<main id="settings"><h1>Settings</h1><p>{}</p><p>{}</p></main>"#,
        escape(&session.user.name),
        escape(&session.user.email)
    );
    shell("Settings", &body).into_response()
}

const SIGN_UP_PATH: &str = "/sign-up";

/// Form posting its fields as JSON to `endpoint`, then loading the dashboard.
fn credentials_form(id: &str, heading: &str, endpoint: &str, with_name: bool) -> Html<String> {
    let name_field = if with_name {
        r#"<label>Name <input name="name" required minlength="2"></label>"#
    } else {
        ""
    };
    let body = format!(
        r#"<main id="{id}"><h1>{heading}</h1>
<form data-endpoint="{endpoint}">
{name_field}
<label>Email <input name="email" type="email" required></label>
<label>Password <input name="password" type="password" required minlength="8" maxlength="128"></label>
<button type="submit">{heading}</button>
<p role="alert"></p>
</form>
</main>
<script>
document.querySelector("form").addEventListener("submit", async (event) => {{
  event.preventDefault();
  const form = event.currentTarget;
  const res = await fetch(form.dataset.endpoint, {{
    method: "POST",
    headers: {{ "content-type": "application/json" }},
    body: JSON.stringify(Object.fromEntries(new FormData(form))),
  }});
  if (res.ok) {{ window.location.assign("/dashboard"); return; }}
  const body = await res.json().catch(() => ({{}}));
  form.querySelector("[role=alert]").textContent = body.message ?? "Something went wrong";
}});
</script>"#
    );
    shell(heading, &body)
}

/// GET /sign-in
pub async fn sign_in() -> Html<String> {
    credentials_form("sign-in", "Sign in", "/api/auth/sign-in", false)
}

/// GET /sign-up
pub async fn sign_up() -> Html<String> {
    credentials_form("sign-up", "Sign up", "/api/auth/sign-up", true)
}

/// Pages that need a session cookie.
pub fn protected_router(_deployment: &Deployment) -> Router<Deployment> {
    Router::new()
        .route("/dashboard", get(dashboard))
        .route("/settings", get(settings))
}

pub fn public_router(_deployment: &Deployment) -> Router<Deployment> {
    Router::new()
        .route(SIGN_IN_PATH, get(sign_in))
        .route(SIGN_UP_PATH, get(sign_up))
}
