use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

mod config;
mod interpret;
mod models;
mod stylist;
mod upload;

use config::Config;
use interpret::{Interpreter, InterpreterError, LinkSource, ParsedResult};
use models::AnalyzeResponse;
use stylist::{StylistClient, StylistError};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Interpreter(#[from] InterpreterError),
    #[error(transparent)]
    Stylist(#[from] StylistError),
}

#[derive(Clone)]
struct AppState {
    interpreter: Arc<Interpreter>,
    stylist: StylistClient,
    max_images: usize,
    product_lookup: bool,
}

impl AppState {
    fn from_config(config: &Config) -> Result<Self, StartupError> {
        Ok(Self {
            interpreter: Arc::new(Interpreter::new(config.interpreter.clone())?),
            stylist: StylistClient::new(config)?,
            max_images: config.max_images,
            product_lookup: config.product_lookup,
        })
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    if config.api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY is not set; /analyze will fail until it is");
    }

    let state = match AppState::from_config(&config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };
    let app = router(state, config.max_body_bytes);

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("cannot bind {}: {}", config.bind_addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        "listening on {} (model {}, max {} images)",
        config.bind_addr,
        config.model,
        config.max_images
    );
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("server error: {}", e);
        std::process::exit(1);
    }
}

fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/analyze", post(analyze_endpoint))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> impl IntoResponse {
    Json(json!({"message": "StyleSync backend is running 🚀"}))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn analyze_endpoint(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let multipart = match multipart {
        Ok(multipart) => multipart,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.body_text()),
    };

    let request = match upload::collect_images(multipart, state.max_images).await {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("rejected upload: {}", e);
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };
    tracing::info!("analyzing {} image(s)", request.images.len());

    let reply = match state.stylist.analyze_outfit(&request).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!("outfit analysis failed: {}", e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error: {}", e),
            );
        }
    };

    let mut result = state.interpreter.extract_result(&reply);
    if result.link_source == LinkSource::SearchFallback && state.product_lookup {
        lookup_product_link(&state, &mut result).await;
    }
    tracing::debug!(
        "verdict {:?}, item {:?}, link via {:?}",
        result.match_status,
        result.highlighted_item,
        result.link_source
    );

    let response = AnalyzeResponse {
        result: result.display_text,
        match_status: result.match_status,
        highlighted_item: result.highlighted_item,
        affiliate_url: result.affiliate_url,
    };
    (StatusCode::OK, Json(response)).into_response()
}

/// Replaces the search fallback with a product link from a follow-up model
/// call. Failures keep the fallback.
async fn lookup_product_link(state: &AppState, result: &mut ParsedResult) {
    match state.stylist.lookup_product(&result.highlighted_item).await {
        Ok(reply) => match state.interpreter.resolve_product_link(&reply) {
            Some(url) => {
                result.affiliate_url = url;
                result.link_source = LinkSource::Lookup;
            }
            None => tracing::warn!("product lookup returned no marketplace URL"),
        },
        Err(e) => tracing::warn!("product lookup failed: {}", e),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({"result": message}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::header, http::Request};
    use serde_json::Value;
    use std::sync::Mutex;
    use tower::ServiceExt;

    const BOUNDARY: &str = "stylesync-test-boundary";

    async fn spawn_model(analysis: &'static str, lookup: &'static str) -> String {
        let app = Router::new().route(
            "/chat/completions",
            post(move |Json(body): Json<Value>| async move {
                let text = if body["max_tokens"] == 100 { lookup } else { analysis };
                Json(json!({"choices": [{"message": {"role": "assistant", "content": text}}]}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    async fn spawn_recording_model(reply: &'static str) -> (String, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let app = Router::new().route(
            "/chat/completions",
            post(move |Json(body): Json<Value>| {
                let recorded = recorded.clone();
                async move {
                    recorded.lock().unwrap().push(body);
                    Json(json!({"choices": [{"message": {"content": reply}}]}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{}", addr), seen)
    }

    fn app_with(pairs: &[(&str, &str)]) -> Router {
        let env: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = Config::from_lookup(|name| {
            env.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        })
        .unwrap();
        let state = AppState::from_config(&config).unwrap();
        router(state, config.max_body_bytes)
    }

    fn multipart_request(image_count: usize) -> Request<Body> {
        multipart_request_with(image_count, Some("image/png"))
    }

    fn multipart_request_with(image_count: usize, content_type: Option<&str>) -> Request<Body> {
        let part_type = content_type
            .map(|t| format!("\r\nContent-Type: {}", t))
            .unwrap_or_default();
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n",
                b = BOUNDARY
            )
            .as_bytes(),
        );
        for i in 0..image_count {
            body.extend_from_slice(
                format!(
                    "--{b}\r\nContent-Disposition: form-data; name=\"images\"; \
                     filename=\"look{i}.png\"{t}\r\n\r\n",
                    b = BOUNDARY,
                    i = i,
                    t = part_type
                )
                .as_bytes(),
            );
            body.extend_from_slice(&[0x89, b'P', b'N', b'G']);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri("/analyze")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_root_message() {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let (status, body) = send(app_with(&[]), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "StyleSync backend is running 🚀");
    }

    #[tokio::test]
    async fn test_health() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(app_with(&[]), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_analyze_without_images() {
        let (status, body) = send(app_with(&[]), multipart_request(0)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["result"], "No images received.");
    }

    #[tokio::test]
    async fn test_analyze_too_many_images() {
        let (status, body) = send(app_with(&[]), multipart_request(6)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["result"], "You can upload up to 5 images only.");
    }

    #[tokio::test]
    async fn test_analyze_respects_configured_limit() {
        let app = app_with(&[("STYLESYNC_MAX_IMAGES", "3")]);
        let (status, body) = send(app, multipart_request(4)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["result"], "You can upload up to 3 images only.");
    }

    #[tokio::test]
    async fn test_analyze_not_multipart() {
        let request = Request::builder()
            .method("POST")
            .uri("/analyze")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send(app_with(&[]), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["result"].is_string());
    }

    #[tokio::test]
    async fn test_analyze_without_api_key() {
        let (status, body) = send(app_with(&[]), multipart_request(1)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["result"].as_str().unwrap().starts_with("Error: "));
    }

    #[tokio::test]
    async fn test_analyze_with_link_in_reply() {
        let base = spawn_model(
            "These items match great! Try a navy blazer: https://www.amazon.com/dp/ABC123",
            "https://www.amazon.com/dp/UNUSED",
        )
        .await;
        let app = app_with(&[("OPENAI_API_KEY", "sk-test"), ("OPENAI_BASE_URL", base.as_str())]);

        let (status, body) = send(app, multipart_request(2)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "These items match great! Try a navy blazer.");
        assert_eq!(body["matchStatus"], "matched");
        assert_eq!(body["highlightedItem"], "blazer");
        assert_eq!(
            body["affiliateUrl"],
            "https://www.amazon.com/dp/ABC123?tag=stylesyncapp-20"
        );
    }

    #[tokio::test]
    async fn test_analyze_uses_product_lookup() {
        let base = spawn_model(
            "They don\u{2019}t match. Swap the sneakers for loafers.",
            "https://www.amazon.com/dp/B0SNEAK?th=1",
        )
        .await;
        let app = app_with(&[("OPENAI_API_KEY", "sk-test"), ("OPENAI_BASE_URL", base.as_str())]);

        let (status, body) = send(app, multipart_request(1)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["matchStatus"], "not matched");
        assert_eq!(body["highlightedItem"], "sneakers");
        assert_eq!(
            body["affiliateUrl"],
            "https://www.amazon.com/dp/B0SNEAK?th=1&tag=stylesyncapp-20"
        );
    }

    #[tokio::test]
    async fn test_analyze_lookup_without_url_keeps_search() {
        let base = spawn_model(
            "They don\u{2019}t match. Add a coat.",
            "Sorry, I cannot browse the web.",
        )
        .await;
        let app = app_with(&[("OPENAI_API_KEY", "sk-test"), ("OPENAI_BASE_URL", base.as_str())]);

        let (status, body) = send(app, multipart_request(1)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["highlightedItem"], "coat");
        assert_eq!(
            body["affiliateUrl"],
            "https://www.amazon.com/s?k=coat&tag=stylesyncapp-20"
        );
    }

    #[tokio::test]
    async fn test_analyze_lookup_disabled() {
        let base = spawn_model(
            "Add a dress.",
            "https://www.amazon.com/dp/SHOULD-NOT-BE-USED",
        )
        .await;
        let app = app_with(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_BASE_URL", base.as_str()),
            ("STYLESYNC_PRODUCT_LOOKUP", "false"),
        ]);

        let (status, body) = send(app, multipart_request(1)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["matchStatus"], "not matched");
        assert_eq!(
            body["affiliateUrl"],
            "https://www.amazon.com/s?k=dress&tag=stylesyncapp-20"
        );
    }

    #[tokio::test]
    async fn test_analyze_non_image_parts_sent_as_jpeg() {
        let (base, seen) = spawn_recording_model("These match: https://www.amazon.com/dp/J1").await;
        let app = app_with(&[("OPENAI_API_KEY", "sk-test"), ("OPENAI_BASE_URL", base.as_str())]);

        let (status, _) = send(app.clone(), multipart_request_with(1, Some("application/octet-stream"))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(app, multipart_request_with(1, None)).await;
        assert_eq!(status, StatusCode::OK);

        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 2);
        for body in requests.iter() {
            let url = body["messages"][0]["content"][1]["image_url"]["url"]
                .as_str()
                .unwrap();
            assert_eq!(url, "data:image/jpeg;base64,iVBORw==");
        }
    }

    #[tokio::test]
    async fn test_analyze_body_over_limit() {
        let app = app_with(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("STYLESYNC_MAX_BODY_BYTES", "32"),
        ]);
        let (status, body) = send(app, multipart_request(2)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["result"].is_string());
    }
}
