// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

//! HTTP front server
//!
//! Accepts build requests, reports build statuses, and performs the
//! startup handshake with the catalog: once the listener is open, the
//! catalog is asked exactly once to resend any builds queued while this
//! service was down.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use thiserror::Error;
use tokio::{net::TcpListener, time};
use tracing::{error, info};

use crate::{
    builder::{self, BuildStatus, Builder},
    catalog::{self, Catalog},
    environment::{Definition, Request},
};

/// Window granted to in-flight requests after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Service {
    pub builder: Arc<Builder>,
    pub catalog: Arc<Catalog>,
}

pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/environments/build", post(build))
        .route("/environments/status", get(statuses))
        .with_state(service)
}

/// Bind, handshake with the catalog, then serve until `shutdown` resolves.
/// Open connections get a 10 s drain; background build phases are not
/// awaited.
pub async fn serve(
    service: Arc<Service>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);

    let resent = service.catalog.resend_pending_builds().await?;
    if resent > 0 {
        info!("catalog resent {resent} pending builds");
    }

    let (drained_tx, drained_rx) = tokio::sync::oneshot::channel();
    let graceful = axum::serve(listener, router(service)).with_graceful_shutdown(async move {
        shutdown.await;
        let _ = drained_tx.send(());
    });

    let mut handle = tokio::spawn(graceful.into_future());

    tokio::select! {
        result = &mut handle => {
            result.expect("server task")?;
        }
        _ = drained_rx => {
            if time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                info!("shutdown grace period elapsed, dropping open connections");
                handle.abort();
            }
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct Message {
    message: &'static str,
}

#[derive(Serialize)]
struct Failure {
    error: String,
}

fn failure(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(Failure {
            error: error.to_string(),
        }),
    )
        .into_response()
}

async fn build(
    State(service): State<Arc<Service>>,
    payload: Result<Json<Request>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return failure(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    let definition = match Definition::try_from(request) {
        Ok(definition) => definition,
        Err(invalid) => return failure(StatusCode::BAD_REQUEST, invalid),
    };

    match service.builder.build(definition).await {
        Ok(()) => (StatusCode::OK, Json(Message { message: "build queued" })).into_response(),
        Err(refused @ builder::Error::AlreadyBuilding(_)) => failure(StatusCode::CONFLICT, refused),
        Err(failed) => {
            error!("build request refused: {failed}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, failed)
        }
    }
}

async fn statuses(State(service): State<Arc<Service>>) -> Json<Vec<BuildStatus>> {
    Json(service.builder.statuses())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("catalog handshake")]
    Catalog(#[from] catalog::Error),
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    use super::*;
    use crate::builder::testing::{ScriptedQueue, definition, fixture};
    use crate::queue::JobState;

    async fn app() -> (crate::builder::testing::Fixture, Router) {
        let queue = Arc::new(ScriptedQueue::new([JobState::Pending]));
        let fix = fixture(queue).await;
        let router = router(Arc::new(Service {
            builder: fix.builder.clone(),
            catalog: Arc::new(Catalog::new(url::Url::parse(&fix.server.uri()).unwrap())),
        }));
        (fix, router)
    }

    fn build_request(body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/environments/build")
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    fn wire_body() -> String {
        serde_json::to_string(&Request::from(&definition())).unwrap()
    }

    #[tokio::test]
    async fn accepted_build_returns_200() {
        let (_fix, app) = app().await;

        let response = app.oneshot(build_request(&wire_body())).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_json_is_400() {
        let (_fix, app) = app().await;

        let response = app.oneshot(build_request("{not json")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_request_is_400() {
        let (_fix, app) = app().await;
        let body = r#"{"name": "groups/hgi/xxhash", "version": "1", "model": {"packages": []}}"#;

        let response = app.oneshot(build_request(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let failure: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(failure["error"].as_str().unwrap().contains("packages"));
    }

    #[tokio::test]
    async fn duplicate_build_is_409() {
        let (_fix, app) = app().await;

        let first = app.clone().oneshot(build_request(&wire_body())).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(build_request(&wire_body())).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn status_lists_builds_on_the_wire_shape() {
        let (_fix, app) = app().await;

        app.clone().oneshot(build_request(&wire_body())).await.unwrap();

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/environments/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let statuses: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        let entry = &statuses.as_array().unwrap()[0];
        assert_eq!(entry["Name"], "groups/hgi/xxhash-0.8.1");
        assert!(entry.get("Requested").is_some());
        // the job never started: BuildStart is omitted
        assert!(entry.get("BuildStart").is_none());
    }

    #[tokio::test]
    async fn serve_performs_resend_handshake() {
        let queue = Arc::new(ScriptedQueue::new([JobState::Pending]));
        let fix = fixture(queue).await;
        Mock::given(method("POST"))
            .and(path("/resend-pending-builds"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"message": "ok", "successes": 0, "failures": 0}),
            ))
            .expect(1)
            .mount(&fix.server)
            .await;

        let service = Arc::new(Service {
            builder: fix.builder.clone(),
            catalog: Arc::new(Catalog::new(url::Url::parse(&fix.server.uri()).unwrap())),
        });

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(service, "127.0.0.1:0".parse().unwrap(), async move {
            let _ = stop_rx.await;
        }));

        // give the handshake a moment, then shut down
        time::sleep(Duration::from_millis(100)).await;
        drop(stop_tx);

        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_handshake_aborts_startup() {
        let queue = Arc::new(ScriptedQueue::new([JobState::Pending]));
        let fix = fixture(queue).await;
        Mock::given(method("POST"))
            .and(path("/resend-pending-builds"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"message": "partial", "successes": 1, "failures": 2}),
            ))
            .mount(&fix.server)
            .await;

        let service = Arc::new(Service {
            builder: fix.builder.clone(),
            catalog: Arc::new(Catalog::new(url::Url::parse(&fix.server.uri()).unwrap())),
        });

        let error = serve(service, "127.0.0.1:0".parse().unwrap(), std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            Error::Catalog(catalog::Error::PartialResend { failures: 2, .. })
        ));
    }
}
