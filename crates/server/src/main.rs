use std::net::SocketAddr;

use axum::{middleware as axum_middleware, routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod db;
mod error;
mod handlers;
mod middleware;
mod routes;

use handlers::ws::{create_feed_registry, FeedRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "canteiro_server=debug,canteiro_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::from_env();

    // Initialize database
    let db = db::Database::connect(&config.database_url).await?;
    db.run_migrations().await?;

    if let (Some(email), Some(password)) = (&config.superadmin_email, &config.superadmin_password) {
        let hash = routes::auth::hash_password(password)?;
        if db.seed_superadmin(email, &hash).await? {
            tracing::info!(email = %email, "Seeded superadmin");
        }
    }

    let state = AppState {
        db,
        config: config.clone(),
        feeds: create_feed_registry(),
    };

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}

pub fn app(state: AppState) -> Router {
    // Every business route is scoped to the tenant in the caller's token
    let protected_routes = Router::new()
        .nest("/tenants", routes::tenants::router())
        .nest("/data", routes::data::router())
        .nest("/projects", routes::projects::router())
        .nest("/tasks", routes::tasks::router())
        .nest("/resources", routes::resources::router())
        .nest("/daily-logs", routes::daily_logs::router())
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::auth_middleware,
        ));

    let api_router = Router::new()
        .nest("/auth", routes::auth::router(state.clone()))
        .merge(protected_routes);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(handlers::ws::ws_handler))
        .nest("/api", api_router)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Clone)]
pub struct AppState {
    pub db: db::Database,
    pub config: config::Config,
    pub feeds: FeedRegistry,
}

#[cfg(test)]
mod api_tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use chrono::Utc;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;

    async fn test_app() -> (Router, AppState) {
        let db = db::Database::connect("sqlite::memory:").await.unwrap();
        db.run_migrations().await.unwrap();
        let state = AppState {
            db,
            config: config::Config {
                port: 0,
                database_url: "sqlite::memory:".to_string(),
                jwt_secret: "test-secret".to_string(),
                superadmin_email: None,
                superadmin_password: None,
            },
            feeds: create_feed_registry(),
        };
        (app(state.clone()), state)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    /// Registers a company and returns (token, tenant id).
    async fn register(app: &Router, email: &str) -> (String, String) {
        let (status, body) = send(
            app,
            "POST",
            "/api/auth/register",
            None,
            Some(json!({
                "companyName": "Construtora Alfa",
                "email": email,
                "name": "Ana",
                "password": "senha-segura"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        (
            body["token"].as_str().unwrap().to_string(),
            body["tenant"]["id"].as_str().unwrap().to_string(),
        )
    }

    fn project(id: &str, name: &str) -> Value {
        json!({
            "id": id,
            "name": name,
            "status": "PLANNING",
            "startDate": "2024-03-01",
            "endDate": "2024-09-30"
        })
    }

    #[tokio::test]
    async fn health_is_public() {
        let (app, _) = test_app().await;
        let (status, _) = send(&app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn data_routes_require_a_token() {
        let (app, _) = test_app().await;
        let (status, _) = send(&app, "GET", "/api/data", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, "GET", "/api/data", Some("not-a-token"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn registered_admin_can_log_in() {
        let (app, _) = test_app().await;
        let (_, tenant_id) = register(&app, "ana@alfa.com").await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/auth/login",
            None,
            Some(json!({ "email": "ana@alfa.com", "password": "senha-segura" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["role"], "ADMIN");
        assert_eq!(body["user"]["tenantId"], tenant_id.as_str());

        let (status, _) = send(
            &app,
            "POST",
            "/api/auth/login",
            None,
            Some(json!({ "email": "ana@alfa.com", "password": "errada-demais" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = body["token"].as_str().unwrap();
        let (status, body) = send(&app, "GET", "/api/auth/validate", Some(token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], true);
    }

    #[tokio::test]
    async fn sync_maps_only_temporary_ids() {
        let (app, _) = test_app().await;
        let (token, tenant_id) = register(&app, "ana@alfa.com").await;
        let stable = Uuid::new_v4().to_string();

        let (status, body) = send(
            &app,
            "POST",
            "/api/projects/sync",
            Some(&token),
            Some(json!({ "items": [project("p-1700000000000", "Torre A"), project(&stable, "Torre B")] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");

        let mappings = body["mappings"].as_object().unwrap();
        assert_eq!(mappings.len(), 1);
        let mapped = mappings["p-1700000000000"].as_str().unwrap();
        assert!(!mapped.starts_with("p-"));

        let (_, data) = send(&app, "GET", "/api/data", Some(&token), None).await;
        let projects = data["projects"].as_array().unwrap();
        assert_eq!(projects.len(), 2);
        assert!(projects.iter().all(|p| p["tenantId"] == tenant_id.as_str()));
        assert!(projects.iter().any(|p| p["id"] == mapped));
        assert!(projects.iter().any(|p| p["id"] == stable.as_str()));
    }

    #[tokio::test]
    async fn tenants_cannot_touch_each_others_rows() {
        let (app, _) = test_app().await;
        let (alfa, _) = register(&app, "ana@alfa.com").await;
        let (beta, _) = register(&app, "bruno@beta.com").await;
        let shared = Uuid::new_v4().to_string();

        send(
            &app,
            "POST",
            "/api/projects/sync",
            Some(&alfa),
            Some(json!({ "items": [project(&shared, "Torre A")] })),
        )
        .await;

        let (status, _) = send(
            &app,
            "POST",
            "/api/projects/sync",
            Some(&beta),
            Some(json!({ "items": [project(&shared, "Sequestrada")] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, data) = send(&app, "GET", "/api/data", Some(&alfa), None).await;
        assert_eq!(data["projects"][0]["name"], "Torre A");

        let (_, data) = send(&app, "GET", "/api/data", Some(&beta), None).await;
        assert!(data["projects"].as_array().unwrap().is_empty());

        let (status, _) = send(&app, "DELETE", &format!("/api/projects/{shared}"), Some(&beta), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn project_limit_of_the_plan_is_enforced() {
        let (app, _) = test_app().await;
        let (token, _) = register(&app, "ana@alfa.com").await;

        let (status, _) = send(
            &app,
            "POST",
            "/api/projects/sync",
            Some(&token),
            Some(json!({ "items": [
                project("p-1", "Torre A"),
                project("p-2", "Torre B"),
                project("p-3", "Torre C")
            ] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // The batch is rolled back as a whole
        let (_, data) = send(&app, "GET", "/api/data", Some(&token), None).await;
        assert!(data["projects"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_only_users_cannot_write() {
        let (app, state) = test_app().await;
        let (_, tenant_id) = register(&app, "ana@alfa.com").await;

        let hash = routes::auth::hash_password("somente-leitura").unwrap();
        sqlx::query(
            "INSERT INTO users (id, tenant_id, email, name, password_hash, role, active, created_at) \
             VALUES (?, ?, 'leitor@alfa.com', 'Leitor', ?, 'READ_ONLY', 1, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&tenant_id)
        .bind(&hash)
        .bind(Utc::now().to_rfc3339())
        .execute(&state.db.pool)
        .await
        .unwrap();

        let (_, body) = send(
            &app,
            "POST",
            "/api/auth/login",
            None,
            Some(json!({ "email": "leitor@alfa.com", "password": "somente-leitura" })),
        )
        .await;
        let token = body["token"].as_str().unwrap();

        let (status, _) = send(
            &app,
            "POST",
            "/api/projects/sync",
            Some(token),
            Some(json!({ "items": [project("p-1", "Torre A")] })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(&app, "GET", "/api/data", Some(token), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn deleting_a_project_removes_its_daily_logs() {
        let (app, _) = test_app().await;
        let (token, _) = register(&app, "ana@alfa.com").await;

        let (_, body) = send(
            &app,
            "POST",
            "/api/projects/sync",
            Some(&token),
            Some(json!({ "items": [project("p-1", "Torre A")] })),
        )
        .await;
        let project_id = body["mappings"]["p-1"].as_str().unwrap().to_string();

        let (status, _) = send(
            &app,
            "POST",
            "/api/daily-logs/sync",
            Some(&token),
            Some(json!({ "items": [{
                "id": "log-1",
                "projectId": project_id,
                "date": "2024-03-04",
                "notes": "Concretagem da laje",
                "progress": [],
                "photos": []
            }] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, "DELETE", &format!("/api/projects/{project_id}"), Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, data) = send(&app, "GET", "/api/data", Some(&token), None).await;
        assert!(data["projects"].as_array().unwrap().is_empty());
        assert!(data["dailyLogs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_a_resource_strips_it_from_tasks() {
        let (app, _) = test_app().await;
        let (token, _) = register(&app, "ana@alfa.com").await;

        let (_, body) = send(
            &app,
            "POST",
            "/api/resources/sync",
            Some(&token),
            Some(json!({ "items": [
                { "id": "r-1", "name": "Pedreiro", "kind": "HUMAN" },
                { "id": "r-2", "name": "Servente", "kind": "HUMAN" }
            ] })),
        )
        .await;
        let mason = body["mappings"]["r-1"].as_str().unwrap().to_string();
        let helper = body["mappings"]["r-2"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            "POST",
            "/api/tasks/sync",
            Some(&token),
            Some(json!({ "items": [{
                "id": "task-1",
                "projectId": Uuid::new_v4().to_string(),
                "name": "Alvenaria",
                "wbs": "1.1",
                "plannedStart": "2024-03-04",
                "plannedEnd": "2024-03-08",
                "allocations": [
                    { "resourceId": mason, "quantity": 2 },
                    { "resourceId": helper, "quantity": 1 }
                ]
            }] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");

        let (status, _) = send(&app, "DELETE", &format!("/api/resources/{mason}"), Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, data) = send(&app, "GET", "/api/data", Some(&token), None).await;
        let allocations = data["tasks"][0]["allocations"].as_array().unwrap();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0]["resourceId"], helper.as_str());

        let (status, histogram) =
            send(&app, "GET", "/api/resources/histogram?step=daily", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(histogram["roles"], json!(["Servente"]));
        assert_eq!(histogram["buckets"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn dependencies_on_new_tasks_of_the_same_batch_are_remapped() {
        let (app, _) = test_app().await;
        let (token, _) = register(&app, "ana@alfa.com").await;
        let project_id = Uuid::new_v4().to_string();
        let task = |id: &str, dependencies: Value| {
            json!({
                "id": id,
                "projectId": project_id,
                "name": "Fundação",
                "wbs": "1.1",
                "plannedStart": "2024-03-04",
                "plannedEnd": "2024-03-08",
                "dependencies": dependencies
            })
        };

        let (status, body) = send(
            &app,
            "POST",
            "/api/tasks/sync",
            Some(&token),
            Some(json!({ "items": [task("task-2", json!(["task-1"])), task("task-1", json!([]))] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let first = body["mappings"]["task-1"].as_str().unwrap().to_string();
        let second = body["mappings"]["task-2"].as_str().unwrap().to_string();

        let (_, data) = send(&app, "GET", "/api/data", Some(&token), None).await;
        let stored = data["tasks"]
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["id"] == second.as_str())
            .unwrap()
            .clone();
        assert_eq!(stored["dependencies"], json!([first]));
    }

    #[tokio::test]
    async fn histogram_rejects_ranges_with_too_many_buckets() {
        let (app, _) = test_app().await;
        let (token, _) = register(&app, "ana@alfa.com").await;

        let (status, body) = send(
            &app,
            "GET",
            "/api/resources/histogram?step=daily&start=1000-01-01&end=9999-12-31",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

        let (status, _) = send(
            &app,
            "GET",
            "/api/resources/histogram?step=weekly&start=2024-01-01&end=2026-12-31",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
}
