use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use super::create_router;
use crate::config::Config;
use crate::state::{AppState, Stores};

const SECRET: &str = "test-secret-key-at-least-32-chars!";

struct TestApp {
    router: Router,
    state: AppState,
}

impl TestApp {
    fn new() -> Self {
        let state = AppState::new(Config::for_memory(SECRET), Stores::memory(), None);
        Self {
            router: create_router(state.clone()),
            state,
        }
    }

    fn token(&self, user_id: Uuid, name: &str) -> String {
        self.state
            .jwt
            .generate_access_token(user_id, name, time::Duration::hours(1))
            .unwrap()
    }

    async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn create_room(&self, token: &str) -> String {
        let (status, body) = self
            .call(
                Method::POST,
                "/api/v1/rooms",
                Some(token),
                Some(json!({
                    "name": "Organic Chemistry",
                    "unitId": Uuid::new_v4(),
                    "unitCode": "CHEM202",
                    "topic": "Reaction mechanisms"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["data"]["id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn test_liveness_is_public() {
    let app = TestApp::new();
    let (status, _) = app.call(Method::GET, "/health/live", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_api_requires_bearer_token() {
    let app = TestApp::new();

    let (status, body) = app.call(Method::GET, "/api/v1/rooms", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "UNAUTHORIZED");

    let (status, _) = app
        .call(Method::GET, "/api/v1/rooms", Some("not-a-jwt"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_and_fetch_room() {
    let app = TestApp::new();
    let token = app.token(Uuid::new_v4(), "Ada");
    let room_id = app.create_room(&token).await;

    let (status, body) = app
        .call(Method::GET, &format!("/api/v1/rooms/{room_id}"), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["unit_code"], "CHEM202");

    let (status, body) = app
        .call(Method::GET, "/api/v1/rooms?search=chem", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_room_is_not_found() {
    let app = TestApp::new();
    let token = app.token(Uuid::new_v4(), "Ada");

    let (status, body) = app
        .call(
            Method::GET,
            &format!("/api/v1/rooms/{}", Uuid::new_v4()),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");
    assert_eq!(body["message"], "Room not found");
}

#[tokio::test]
async fn test_message_post_and_history() {
    let app = TestApp::new();
    let token = app.token(Uuid::new_v4(), "Ada");
    let room_id = app.create_room(&token).await;

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/api/v1/rooms/{room_id}/messages"),
            Some(&token),
            Some(json!({ "content": "SN1 vs SN2?" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let message_id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["author_name"], "Ada");

    let (status, _) = app
        .call(
            Method::POST,
            &format!("/api/v1/rooms/{room_id}/messages/{message_id}/like"),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .call(
            Method::GET,
            &format!("/api/v1/rooms/{room_id}/messages?limit=10"),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let messages = body["data"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["like_count"], 1);

    let (status, body) = app
        .call(
            Method::GET,
            &format!("/api/v1/rooms/{room_id}/messages?before=yesterday"),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_ARGUMENT");
}

#[tokio::test]
async fn test_non_member_cannot_post() {
    let app = TestApp::new();
    let owner = app.token(Uuid::new_v4(), "Ada");
    let outsider = app.token(Uuid::new_v4(), "Eve");
    let room_id = app.create_room(&owner).await;

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/api/v1/rooms/{room_id}/messages"),
            Some(&outsider),
            Some(json!({ "content": "hello?" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Join the room first");
}

#[tokio::test]
async fn test_poll_vote_and_results() {
    let app = TestApp::new();
    let token = app.token(Uuid::new_v4(), "Ada");
    let room_id = app.create_room(&token).await;

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/api/v1/polls/room/{room_id}"),
            Some(&token),
            Some(json!({
                "question": "Which mechanism?",
                "options": ["SN1", "SN2", "E1"]
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let poll_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/api/v1/polls/{poll_id}/vote"),
            Some(&token),
            Some(json!({ "optionIndex": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_votes"], 1);

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/api/v1/polls/{poll_id}/vote"),
            Some(&token),
            Some(json!({ "optionIndex": 0 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "CONFLICT");

    let (status, body) = app
        .call(
            Method::GET,
            &format!("/api/v1/polls/{poll_id}/results"),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let options = body["data"]["options"].as_array().unwrap();
    assert_eq!(options[0]["percentage"], 0.0);
    assert_eq!(options[1]["percentage"], 100.0);

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/api/v1/polls/{poll_id}/close"),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_active"], false);
    assert_eq!(body["message"], "Poll closed");
}
