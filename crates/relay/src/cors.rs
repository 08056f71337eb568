// Browser access policy for the REST API and the `/ws` handshake.
//
// `EASEL_RELAY_CORS_ORIGINS` is either `*` or a comma-separated origin list.
// When it is unset the canvas front-end dev servers on localhost are allowed.

use std::time::Duration;

use axum::http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    HeaderName, HeaderValue, Method,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::REQUEST_ID_HEADER;

const LOCAL_FRONTEND_ORIGINS: [&str; 4] = [
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
enum OriginPolicy {
    /// Any origin, without cookies or credentials.
    Any,
    List(Vec<HeaderValue>),
}

impl OriginPolicy {
    fn from_setting(setting: Option<&str>) -> Self {
        match setting.map(str::trim) {
            Some("*") => Self::Any,
            Some(list) if !list.is_empty() => Self::List(origin_list(list.split(','))),
            _ => Self::List(origin_list(LOCAL_FRONTEND_ORIGINS)),
        }
    }
}

fn origin_list<'a>(origins: impl IntoIterator<Item = &'a str>) -> Vec<HeaderValue> {
    origins
        .into_iter()
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin, "ignoring malformed CORS origin");
                None
            }
        })
        .collect()
}

pub fn cors_layer(configured_origins: Option<&str>) -> CorsLayer {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION, request_id.clone()])
        .expose_headers([request_id])
        .max_age(PREFLIGHT_MAX_AGE);

    match OriginPolicy::from_setting(configured_origins) {
        OriginPolicy::Any => layer.allow_origin(AllowOrigin::any()),
        OriginPolicy::List(origins) => {
            layer.allow_origin(AllowOrigin::list(origins)).allow_credentials(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{cors_layer, OriginPolicy, LOCAL_FRONTEND_ORIGINS};
    use axum::{
        body::Body,
        http::{HeaderValue, Method, Request},
        response::Response,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    async fn preflight(origins: Option<&str>, origin: &str, method: &str) -> Response {
        Router::new()
            .route("/canvas/getlist", get(|| async { "[]" }))
            .layer(cors_layer(origins))
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/canvas/getlist")
                    .header("origin", origin)
                    .header("access-control-request-method", method)
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response")
    }

    fn allowed_origin(response: &Response) -> Option<&str> {
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|value| value.to_str().ok())
    }

    #[test]
    fn setting_is_parsed_into_a_policy() {
        assert_eq!(OriginPolicy::from_setting(Some(" * ")), OriginPolicy::Any);
        assert_eq!(
            OriginPolicy::from_setting(Some("https://a.easel.dev, ,https://b.easel.dev")),
            OriginPolicy::List(vec![
                HeaderValue::from_static("https://a.easel.dev"),
                HeaderValue::from_static("https://b.easel.dev"),
            ])
        );
        match OriginPolicy::from_setting(Some("   ")) {
            OriginPolicy::List(origins) => assert_eq!(origins.len(), LOCAL_FRONTEND_ORIGINS.len()),
            OriginPolicy::Any => panic!("blank setting should fall back to local origins"),
        }
    }

    #[tokio::test]
    async fn local_frontend_is_allowed_with_credentials_by_default() {
        let response = preflight(None, "http://localhost:5173", "PUT").await;
        assert_eq!(allowed_origin(&response), Some("http://localhost:5173"));
        assert_eq!(
            response.headers().get("access-control-allow-credentials").expect("credentials"),
            "true"
        );

        let response = preflight(None, "https://evil.example.com", "PUT").await;
        assert_eq!(allowed_origin(&response), None);
    }

    #[tokio::test]
    async fn configured_list_replaces_local_defaults() {
        let origins = Some("https://app.easel.dev,https://staging.easel.dev");
        let response = preflight(origins, "https://staging.easel.dev", "DELETE").await;
        assert_eq!(allowed_origin(&response), Some("https://staging.easel.dev"));

        let response = preflight(origins, "http://localhost:3000", "GET").await;
        assert_eq!(allowed_origin(&response), None);
    }

    #[tokio::test]
    async fn wildcard_allows_any_origin_without_credentials() {
        let response = preflight(Some("*"), "https://anything.example.com", "GET").await;
        assert_eq!(allowed_origin(&response), Some("*"));
        assert!(response.headers().get("access-control-allow-credentials").is_none());
    }
}
