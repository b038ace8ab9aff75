use bus_tracker_lib::{
    live_state::LiveTripState,
    trip::{EndTripRequest, ErrorBody, PositionReport, SessionStatus, StartTripRequest, StartTripResponse, TripId},
};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use crate::error::BackendError;

/// The trip backend, reached through an already-authorized fetch.
#[async_trait::async_trait]
pub trait TrackerBackend: Send + Sync {
    /// The caller's active trip, if any.
    async fn current_session(&self) -> Result<SessionStatus, BackendError>;

    async fn start_trip(&self, request: &StartTripRequest) -> Result<StartTripResponse, BackendError>;

    async fn report_position(&self, report: &PositionReport) -> Result<(), BackendError>;

    async fn end_trip(&self, trip_id: &TripId) -> Result<(), BackendError>;

    /// Full live state of a trip.
    async fn trip_snapshot(&self, trip_id: &TripId) -> Result<LiveTripState, BackendError>;
}

/// JSON over HTTP, with an optional bearer token on every request.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, BackendError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|body| body.message)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());

        Err(BackendError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn fetch<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, BackendError> {
        let response = self.send(builder).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait::async_trait]
impl TrackerBackend for HttpBackend {
    async fn current_session(&self) -> Result<SessionStatus, BackendError> {
        self.fetch(self.request(Method::GET, "/api/trips/user-status/")).await
    }

    async fn start_trip(&self, request: &StartTripRequest) -> Result<StartTripResponse, BackendError> {
        self.fetch(self.request(Method::POST, "/api/trips/start").json(request))
            .await
    }

    async fn report_position(&self, report: &PositionReport) -> Result<(), BackendError> {
        let path = format!("/api/trips/{}/position", report.trip_id);
        self.send(self.request(Method::PATCH, &path).json(report)).await?;
        Ok(())
    }

    async fn end_trip(&self, trip_id: &TripId) -> Result<(), BackendError> {
        let path = format!("/api/trips/{trip_id}/end");
        let body = EndTripRequest {
            trip_id: trip_id.clone(),
        };
        self.send(self.request(Method::PATCH, &path).json(&body)).await?;
        Ok(())
    }

    async fn trip_snapshot(&self, trip_id: &TripId) -> Result<LiveTripState, BackendError> {
        self.fetch(self.request(Method::GET, &format!("/api/trips/{trip_id}/track")))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        routing::{get, patch, post},
        Json, Router,
    };
    use serde_json::{json, Value};

    use super::*;

    #[derive(Default)]
    struct Seen {
        auth: Vec<String>,
        reports: Vec<Value>,
    }

    type Shared = Arc<Mutex<Seen>>;

    fn record_auth(seen: &Shared, headers: &HeaderMap) {
        if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
            seen.lock().unwrap().auth.push(value.to_string());
        }
    }

    async fn serve(seen: Shared) -> String {
        let app = Router::new()
            .route(
                "/api/trips/user-status/",
                get(|State(seen): State<Shared>, headers: HeaderMap| async move {
                    record_auth(&seen, &headers);
                    Json(json!({"message": "User has an active trip", "tripId": "t-1"}))
                }),
            )
            .route(
                "/api/trips/start",
                post(|Json(body): Json<Value>| async move {
                    if body["routeId"] == "closed-line" {
                        return (StatusCode::CONFLICT, Json(json!({"message": "Line is not operating"})));
                    }
                    (
                        StatusCode::CREATED,
                        Json(json!({
                            "tripId": "t-2",
                            "route": {
                                "_id": body["routeId"],
                                "lineNumber": "7",
                                "name": "Centro",
                                "stops": [],
                                "routePath": {"type": "LineString", "coordinates": [[-44.3, -23.0], [-44.2, -23.1]]}
                            }
                        })),
                    )
                }),
            )
            .route(
                "/api/trips/{id}/position",
                patch(|State(seen): State<Shared>, Json(body): Json<Value>| async move {
                    seen.lock().unwrap().reports.push(body);
                    StatusCode::OK
                }),
            )
            .route(
                "/api/trips/{id}/end",
                patch(|Path(id): Path<String>| async move {
                    if id == "t-1" {
                        StatusCode::OK
                    } else {
                        StatusCode::NOT_FOUND
                    }
                }),
            )
            .route(
                "/api/trips/{id}/track",
                get(|| async {
                    Json(json!({
                        "distanceTraveled": 1200,
                        "totalRouteLength": 5000,
                        "stopsReached": ["A"],
                        "stopETAs": [{"stopName": "B", "etaMinutes": 3}]
                    }))
                }),
            )
            .with_state(seen);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn talks_to_trip_endpoints() {
        let seen = Shared::default();
        let url = serve(seen.clone()).await;
        let backend = HttpBackend::new(&format!("{url}/"), Some("secret".into()));

        let status = backend.current_session().await.unwrap();
        assert_eq!(status.trip_id, Some(TripId::new("t-1")));

        let started = backend
            .start_trip(&StartTripRequest {
                route_id: "line-7".into(),
                lat: -23.0,
                lng: -44.3,
            })
            .await
            .unwrap();
        assert_eq!(started.trip_id, TripId::new("t-2"));
        assert_eq!(started.route.route_path.coordinates.len(), 2);

        backend
            .report_position(&PositionReport {
                trip_id: TripId::new("t-2"),
                lat: -23.05,
                lng: -44.25,
            })
            .await
            .unwrap();

        let snapshot = backend.trip_snapshot(&TripId::new("t-2")).await.unwrap();
        assert_eq!(snapshot.distance_traveled, 1200.);
        assert_eq!(snapshot.stop_etas.get("B"), Some(&3));

        backend.end_trip(&TripId::new("t-1")).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.auth, vec!["Bearer secret".to_string()]);
        assert_eq!(seen.reports[0]["tripId"], "t-2");
        assert_eq!(seen.reports[0]["lat"], -23.05);
    }

    #[tokio::test]
    async fn non_success_carries_status_and_message() {
        let url = serve(Shared::default()).await;
        let backend = HttpBackend::new(&url, None);

        let err = backend
            .start_trip(&StartTripRequest {
                route_id: "closed-line".into(),
                lat: 0.,
                lng: 0.,
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BackendError::Status {
                status: 409,
                message: "Line is not operating".into()
            }
        );

        let err = backend.end_trip(&TripId::new("t-404")).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_transport_error() {
        let backend = HttpBackend::new("http://127.0.0.1:9", None);
        assert!(matches!(
            backend.current_session().await,
            Err(BackendError::Transport(_))
        ));
    }
}
