//! JSON http api for the sensor readings.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::database::DatabaseHandle;
use crate::error::ApiError;
use crate::record::{self, ReadingPatch, ReadingView};

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Parameters for the http listener.
pub struct HttpParameters {
    /// The ip address the server should listen on.
    pub address: String,
    /// The port the server should listen on.
    pub port: u16,
    /// Secret for signing tokens. Requests are not authenticated yet, the value is only carried.
    #[serde(default)]
    pub signing_secret: Option<String>,
}

#[derive(Serialize, Debug)]
struct Confirmation {
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deleted: Option<u64>,
}

pub fn router(database: DatabaseHandle) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/sensor-data", get(list_readings).post(create_reading))
        .route(
            "/api/sensor-data/:date",
            get(find_readings).put(update_reading).delete(delete_readings),
        )
        .with_state(database)
}

async fn index() -> &'static str {
    "Welcome to the sensor data API! Use /api/sensor-data to interact with sensor data."
}

async fn create_reading(
    State(database): State<DatabaseHandle>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let reading = record::parse_create(&body)?;
    let date = database.create(reading).await?;

    log::info!(target: "sensord::http", "Stored reading for \'{}\'", date);
    Ok((
        StatusCode::CREATED,
        Json(Confirmation {
            message: "Data added successfully.",
            date: Some(date),
            deleted: None,
        }),
    ))
}

async fn list_readings(State(database): State<DatabaseHandle>) -> Result<Json<Vec<ReadingView>>, ApiError> {
    let readings = database.list().await?;

    Ok(Json(readings.into_iter().map(ReadingView::from).collect()))
}

async fn find_readings(
    State(database): State<DatabaseHandle>,
    Path(date): Path<String>,
) -> Result<Json<Vec<ReadingView>>, ApiError> {
    let date = record::parse_path_date(&date)?;
    let readings = database.find_by_date(date).await?;

    Ok(Json(readings.into_iter().map(ReadingView::from).collect()))
}

async fn update_reading(
    State(database): State<DatabaseHandle>,
    Path(date): Path<String>,
    body: Bytes,
) -> Result<Json<Confirmation>, ApiError> {
    let date = record::parse_path_date(&date)?;
    let patch = ReadingPatch::from_body(&body)?;
    let date = database.update_by_date(date, patch).await?;

    log::info!(target: "sensord::http", "Updated reading on \'{}\'", date);
    Ok(Json(Confirmation {
        message: "Data updated successfully.",
        date: Some(date),
        deleted: None,
    }))
}

async fn delete_readings(
    State(database): State<DatabaseHandle>,
    Path(date): Path<String>,
) -> Result<Json<Confirmation>, ApiError> {
    let date = record::parse_path_date(&date)?;
    let deleted = database.delete_by_date(date).await?;

    log::info!(target: "sensord::http", "Deleted \'{}\' readings on \'{}\'", deleted, date);
    Ok(Json(Confirmation {
        message: "Data deleted successfully.",
        date: None,
        deleted: Some(deleted),
    }))
}

async fn wait_for_termination(thread_finished: Arc<AtomicBool>) {
    let mut interval = tokio::time::interval(time::Duration::from_millis(100));

    while !thread_finished.load(Ordering::SeqCst) {
        interval.tick().await;
    }
    log::info!(target: "sensord::http", "Stopping http server!");
}

async fn serve(database: DatabaseHandle, thread_finished: Arc<AtomicBool>, params: HttpParameters) {
    let listener = match TcpListener::bind(format!("{}:{}", params.address, params.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            log::error!(target: "sensord::http", "Could not bind http listener: \'{}\'", err);
            thread_finished.store(true, Ordering::SeqCst);
            return;
        }
    };

    match listener.local_addr() {
        Ok(addr) => log::info!(target: "sensord::http", "Listening on \'{}\'", addr),
        Err(err) => log::warn!(target: "sensord::http", "Could not get listener address: \'{}\'", err),
    }

    let shutdown = wait_for_termination(Arc::clone(&thread_finished));
    if let Err(err) = axum::serve(listener, router(database)).with_graceful_shutdown(shutdown).await {
        log::error!(target: "sensord::http", "Http server failed: \'{}\'", err);
        thread_finished.store(true, Ordering::SeqCst);
    }
}

/// Thread function for the http server.
///
/// Builds a tokio runtime and serves the api until `thread_finished` is set. Failing to start the
/// runtime or to bind the listener sets `thread_finished` so the other threads stop as well.
pub fn http_thread(database: DatabaseHandle, thread_finished: Arc<AtomicBool>, params: HttpParameters) {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .thread_name("http-worker")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!(target: "sensord::http", "Could not start the async runtime: \'{}\'", err);
            thread_finished.store(true, Ordering::SeqCst);
            return;
        }
    };

    runtime.block_on(serve(database, thread_finished, params));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::serve_requests;
    use crate::storage::MemoryStore;
    use axum::body::Body;
    use axum::http::{header::CONTENT_TYPE, Method, Request};
    use serde_json::{json, Value};
    use std::sync::mpsc;
    use std::thread;
    use tower::ServiceExt;

    fn app() -> Router {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut store = MemoryStore::new();
            serve_requests(&rx, &AtomicBool::new(false), &mut store);
        });
        router(DatabaseHandle::new(tx))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));

        (status, value)
    }

    fn payload(date: &str, time: &str, coordinates: &str) -> Value {
        json!({
            "date": date,
            "time": time,
            "time_zone_offset": "+00:00",
            "coordinates": coordinates,
            "temperature_water": 11.5,
            "temperature_air": 20.25,
            "humidity": 61.0,
            "wind_speed": 4.5,
            "wind_direction": 180.0,
            "precipitation": 1.2,
            "haze": "none",
            "becquerel": 0.05
        })
    }

    #[tokio::test]
    async fn index_greets() {
        let app = app();
        let (status, body) = send(&app, Method::GET, "/", None).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.as_str().unwrap().contains("/api/sensor-data"));
    }

    #[tokio::test]
    async fn created_reading_is_listed() {
        let app = app();

        let (status, body) = send(&app, Method::POST, "/api/sensor-data", Some(payload("20240101", "10:00", "1,2"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, json!({"message": "Data added successfully.", "date": "2024-01-01"}));

        let (status, body) = send(&app, Method::GET, "/api/sensor-data", None).await;
        assert_eq!(status, StatusCode::OK);
        let readings = body.as_array().unwrap();
        assert_eq!(readings.len(), 1);

        let reading = &readings[0];
        assert_eq!(reading["date"], "2024-01-01");
        assert_eq!(reading["timestamp"], "2024-01-01T10:00:00+00:00");
        assert_eq!(reading["coordinates"], "1,2");
        assert_eq!(reading["temperature_water"], 11.5);
        assert_eq!(reading["temperature_air"], 20.25);
        assert_eq!(reading["humidity"], 61.0);
        assert_eq!(reading["wind_speed"], 4.5);
        assert_eq!(reading["wind_direction"], 180.0);
        assert_eq!(reading["precipitation"], 1.2);
        assert_eq!(reading["haze"], "none");
        assert_eq!(reading["becquerel"], 0.05);
    }

    #[tokio::test]
    async fn missing_field_creates_nothing() {
        let app = app();
        let mut body = payload("20240101", "10:00", "1,2");
        body.as_object_mut().unwrap().remove("humidity");

        let (status, response) = send(&app, Method::POST, "/api/sensor-data", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response, json!({"error": "Missing required fields"}));

        let (_, listed) = send(&app, Method::GET, "/api/sensor-data", None).await;
        assert_eq!(listed, json!([]));
    }

    #[tokio::test]
    async fn invalid_time_is_rejected() {
        let app = app();

        let (status, response) = send(&app, Method::POST, "/api/sensor-data", Some(payload("20240101", "7pm", "1,2"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["error"], "Invalid date/time format. Date should be YYYYMMDD and Time should be hh:mm.");
    }

    #[tokio::test]
    async fn malformed_path_date_is_not_a_missing_date() {
        let app = app();

        for method in [Method::GET, Method::PUT, Method::DELETE] {
            let (status, response) = send(&app, method, "/api/sensor-data/2024-01-01", None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(response["error"], "Invalid date format. Expected YYYYMMDD.");
        }
    }

    #[tokio::test]
    async fn empty_store_lists_but_does_not_find() {
        let app = app();

        let (status, body) = send(&app, Method::GET, "/api/sensor-data/20200101", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "No data found for the specified date");

        let (status, body) = send(&app, Method::GET, "/api/sensor-data", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn find_returns_only_that_day() {
        let app = app();
        send(&app, Method::POST, "/api/sensor-data", Some(payload("20240101", "23:59", "a"))).await;
        send(&app, Method::POST, "/api/sensor-data", Some(payload("2024-01-02", "00:00", "b"))).await;

        let (status, body) = send(&app, Method::GET, "/api/sensor-data/20240102", None).await;
        assert_eq!(status, StatusCode::OK);
        let readings = body.as_array().unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0]["coordinates"], "b");
    }

    #[tokio::test]
    async fn update_touches_one_reading() {
        let app = app();
        send(&app, Method::POST, "/api/sensor-data", Some(payload("20240101", "08:00", "a"))).await;
        send(&app, Method::POST, "/api/sensor-data", Some(payload("20240101", "09:00", "b"))).await;

        let (status, body) = send(&app, Method::PUT, "/api/sensor-data/20240101", Some(json!({"coordinates": "X"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"message": "Data updated successfully.", "date": "2024-01-01"}));

        let (_, body) = send(&app, Method::GET, "/api/sensor-data/20240101", None).await;
        let coordinates: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["coordinates"].as_str().unwrap())
            .collect();
        assert_eq!(coordinates.iter().filter(|c| **c == "X").count(), 1);
        assert!(coordinates.contains(&"a") ^ coordinates.contains(&"b"));
    }

    #[tokio::test]
    async fn update_can_clear_a_measurement() {
        let app = app();
        send(&app, Method::POST, "/api/sensor-data", Some(payload("20240101", "08:00", "a"))).await;

        let (status, _) = send(&app, Method::PUT, "/api/sensor-data/20240101", Some(json!({"becquerel": null, "humidity": 70}))).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, Method::GET, "/api/sensor-data", None).await;
        assert_eq!(body[0]["becquerel"], Value::Null);
        assert_eq!(body[0]["humidity"], 70.0);
        assert_eq!(body[0]["coordinates"], "a");
    }

    #[tokio::test]
    async fn update_without_match_is_not_found() {
        let app = app();

        let (status, body) = send(&app, Method::PUT, "/api/sensor-data/20240101", Some(json!({"haze": "thick"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Sensor data not found.");
    }

    #[tokio::test]
    async fn delete_removes_the_whole_day() {
        let app = app();
        for time in ["06:00", "12:00", "18:00"] {
            send(&app, Method::POST, "/api/sensor-data", Some(payload("20240101", time, "a"))).await;
        }
        send(&app, Method::POST, "/api/sensor-data", Some(payload("20240102", "06:00", "b"))).await;

        let (status, body) = send(&app, Method::DELETE, "/api/sensor-data/20240101", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"message": "Data deleted successfully.", "deleted": 3}));

        let (_, body) = send(&app, Method::GET, "/api/sensor-data", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["date"], "2024-01-02");

        let (status, body) = send(&app, Method::DELETE, "/api/sensor-data/20240101", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "No data found for the specified date to delete");
    }

    #[tokio::test]
    async fn listing_twice_gives_the_same_records() {
        let app = app();
        send(&app, Method::POST, "/api/sensor-data", Some(payload("20240101", "06:00", "a"))).await;
        send(&app, Method::POST, "/api/sensor-data", Some(payload("20240105", "06:00", "b"))).await;

        let (_, first) = send(&app, Method::GET, "/api/sensor-data", None).await;
        let (_, second) = send(&app, Method::GET, "/api/sensor-data", None).await;
        assert_eq!(first, second);
    }
}
