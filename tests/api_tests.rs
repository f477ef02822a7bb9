mod common;

use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::MethodFilter;
use axum_test::TestServer;
use chrono::Utc;
use common::{basic, bearer, Harness, KID, OTHER_KID};
use gatehouse::api::routes::app_middleware;
use gatehouse::auth::client::AuthClient;
use gatehouse::auth::middleware::Authenticator;
use gatehouse::auth::policy::{RULE_ADMIN_ONLY, RULE_ADMIN_OR_SUBJECT};
use gatehouse::types::{AuthenticateResp, Claims, ErrorBody, ErrCode, TokenResponse};
use gatehouse::users::{ExtBusiness, Role};
use gatehouse::web::{handler, App};
use rstest::rstest;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ============= Auth Service =============

#[tokio::test]
async fn test_basic_credentials_issue_token_for_user() {
    let h = Harness::new();
    let admin = h.seed("admin@example.com", "gophers", vec![Role::Admin]).await;
    let server = TestServer::new(h.auth_app()).unwrap();

    let response = server
        .get(&format!("/v1/auth/token/{}", KID))
        .add_header("Authorization", basic("admin@example.com", "gophers"))
        .await;

    response.assert_status_ok();
    let body: TokenResponse = response.json();

    let claims = h.auth.authenticate(&bearer(&body.token)).unwrap();
    assert_eq!(claims.sub, admin.id.to_string());
    assert_eq!(claims.roles, vec!["ADMIN"]);
    assert_eq!(claims.iss, common::ISSUER);
}

#[tokio::test]
async fn test_token_signed_under_requested_kid() {
    let h = Harness::new();
    h.seed("user@example.com", "gophers", vec![Role::User]).await;
    let server = TestServer::new(h.auth_app()).unwrap();

    let body: TokenResponse = server
        .get(&format!("/v1/auth/token/{}", OTHER_KID))
        .add_header("Authorization", basic("user@example.com", "gophers"))
        .await
        .json();

    let header = jsonwebtoken::decode_header(&body.token).unwrap();
    assert_eq!(header.kid.as_deref(), Some(OTHER_KID));
}

#[tokio::test]
async fn test_token_rejects_bad_password_and_unknown_kid() {
    let h = Harness::new();
    h.seed("user@example.com", "gophers", vec![Role::User]).await;
    let server = TestServer::new(h.auth_app()).unwrap();

    server
        .get(&format!("/v1/auth/token/{}", KID))
        .add_header("Authorization", basic("user@example.com", "wrong"))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    server
        .get(&format!("/v1/auth/token/{}", KID))
        .add_header("Authorization", basic("nobody@example.com", "gophers"))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    let response = server
        .get("/v1/auth/token/not-a-kid")
        .add_header("Authorization", basic("user@example.com", "gophers"))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body: ErrorBody = response.json();
    assert_eq!(body.code, ErrCode::NotFound);
}

#[tokio::test]
async fn test_authenticate_returns_identity() {
    let h = Harness::new();
    let user = h.seed("user@example.com", "gophers", vec![Role::User]).await;
    let server = TestServer::new(h.auth_app()).unwrap();

    let response = server
        .get("/v1/auth/authenticate")
        .add_header("Authorization", bearer(&h.token_for(&user)))
        .await;

    response.assert_status_ok();
    let body: AuthenticateResp = response.json();
    assert_eq!(body.user_id, user.id);
    assert_eq!(body.claims.roles, vec!["USER"]);
}

#[rstest]
#[case::expired("expired")]
#[case::foreign_signature("rogue")]
#[case::garbage("garbage")]
#[case::wrong_scheme("scheme")]
#[tokio::test]
async fn test_authenticate_rejects(#[case] kind: &str) {
    let h = Harness::new();
    let server = TestServer::new(h.auth_app()).unwrap();

    let header = match kind {
        "expired" => {
            let now = Utc::now().timestamp();
            let claims = Claims {
                iss: common::ISSUER.to_string(),
                sub: Uuid::new_v4().to_string(),
                roles: vec!["ADMIN".to_string()],
                iat: now - 7200,
                exp: now - 3600,
            };
            bearer(&h.auth.generate_token(KID, &claims).unwrap())
        }
        "rogue" => {
            let rogue = common::rogue_service();
            let claims = rogue.new_claims(Uuid::new_v4(), vec!["ADMIN".to_string()], 3600);
            bearer(&rogue.generate_token(KID, &claims).unwrap())
        }
        "garbage" => bearer("not.a.token"),
        _ => {
            let claims = h.auth.new_claims(Uuid::new_v4(), vec!["ADMIN".to_string()], 3600);
            format!("Token {}", h.auth.generate_token(KID, &claims).unwrap())
        }
    };

    let response = server
        .get("/v1/auth/authenticate")
        .add_header("Authorization", header)
        .await;

    response.assert_status(StatusCode::UNAUTHORIZED);
    let body: ErrorBody = response.json();
    assert_eq!(body.code, ErrCode::Unauthenticated);
}

#[rstest]
#[case::admin_only_as_admin("ADMIN", RULE_ADMIN_ONLY, false, StatusCode::NO_CONTENT)]
#[case::admin_only_as_user("USER", RULE_ADMIN_ONLY, false, StatusCode::UNAUTHORIZED)]
#[case::subject_on_self("USER", RULE_ADMIN_OR_SUBJECT, true, StatusCode::NO_CONTENT)]
#[case::subject_on_other("USER", RULE_ADMIN_OR_SUBJECT, false, StatusCode::UNAUTHORIZED)]
#[case::unknown_rule("ADMIN", "admin-only", false, StatusCode::UNAUTHORIZED)]
#[tokio::test]
async fn test_authorize_endpoint(
    #[case] role: &str,
    #[case] rule: &str,
    #[case] on_self: bool,
    #[case] expected: StatusCode,
) {
    let h = Harness::new();
    let server = TestServer::new(h.auth_app()).unwrap();

    let subject = Uuid::new_v4();
    let target = if on_self { subject } else { Uuid::new_v4() };
    let claims = h.auth.new_claims(subject, vec![role.to_string()], 3600);

    server
        .post("/v1/auth/authorize")
        .json(&json!({ "claims": claims, "userID": target, "rule": rule }))
        .await
        .assert_status(expected);
}

#[tokio::test]
async fn test_authorize_rejects_malformed_body() {
    let h = Harness::new();
    let server = TestServer::new(h.auth_app()).unwrap();

    let response = server
        .post("/v1/auth/authorize")
        .json(&json!({ "rule": RULE_ADMIN_ONLY }))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: ErrorBody = response.json();
    assert_eq!(body.code, ErrCode::InvalidArgument);
}

// ============= Sales Service =============

fn new_user_body(email: &str) -> serde_json::Value {
    json!({
        "name": "Bill Kennedy",
        "email": email,
        "roles": ["USER"],
        "department": "IT",
        "password": "gophers",
        "passwordConfirm": "gophers",
    })
}

#[tokio::test]
async fn test_sales_delegates_to_remote_auth() {
    let h = Harness::new();
    let admin = h.seed("admin@example.com", "gophers", vec![Role::Admin]).await;
    let user = h.seed("user@example.com", "gophers", vec![Role::User]).await;

    let base = common::spawn(h.auth_app()).await;
    let client: Arc<dyn Authenticator> = Arc::new(AuthClient::new(&base));
    let server = TestServer::new(h.sales_app(client)).unwrap();

    // Admin may create.
    let response = server
        .post("/v1/users")
        .add_header("Authorization", bearer(&h.token_for(&admin)))
        .json(&new_user_body("new@example.com"))
        .await;
    response.assert_status(StatusCode::CREATED);
    let created: serde_json::Value = response.json();
    assert_eq!(created["email"], "new@example.com");
    assert!(created.get("passwordHash").is_none());
    assert_eq!(h.db.len(), 3);

    // A plain user may not.
    server
        .post("/v1/users")
        .add_header("Authorization", bearer(&h.token_for(&user)))
        .json(&new_user_body("other@example.com"))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    // Nor may anyone without a token.
    server
        .post("/v1/users")
        .json(&new_user_body("other@example.com"))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    assert_eq!(h.db.len(), 3);
}

#[tokio::test]
async fn test_sales_delete_is_admin_or_subject() {
    let h = Harness::new();
    let user = h.seed("user@example.com", "gophers", vec![Role::User]).await;
    let other = h.seed("other@example.com", "gophers", vec![Role::User]).await;

    let base = common::spawn(h.auth_app()).await;
    let client: Arc<dyn Authenticator> = Arc::new(AuthClient::new(&base));
    let server = TestServer::new(h.sales_app(client)).unwrap();
    let token = bearer(&h.token_for(&user));

    server
        .delete(&format!("/v1/users/{}", other.id))
        .add_header("Authorization", token.clone())
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(h.db.len(), 2);

    server
        .delete(&format!("/v1/users/{}", user.id))
        .add_header("Authorization", token)
        .await
        .assert_status(StatusCode::NO_CONTENT);
    assert_eq!(h.db.len(), 1);
    assert!(h.users.query_by_id(user.id).await.is_err());
}

#[tokio::test]
async fn test_sales_with_unreachable_auth_is_unauthenticated() {
    let h = Harness::new();
    let admin = h.seed("admin@example.com", "gophers", vec![Role::Admin]).await;

    let client: Arc<dyn Authenticator> = Arc::new(
        AuthClient::new("http://127.0.0.1:1").with_authorize_timeout(Duration::from_millis(200)),
    );
    let server = TestServer::new(h.sales_app(client)).unwrap();

    let response = server
        .post("/v1/users")
        .add_header("Authorization", bearer(&h.token_for(&admin)))
        .json(&new_user_body("new@example.com"))
        .await;

    response.assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(h.db.len(), 1);
}

#[tokio::test]
async fn test_local_engine_can_stand_in_for_remote() {
    let h = Harness::new();
    let admin = h.seed("admin@example.com", "gophers", vec![Role::Admin]).await;

    let local: Arc<dyn Authenticator> = h.auth.clone();
    let server = TestServer::new(h.sales_app(local)).unwrap();

    server
        .post("/v1/users")
        .add_header("Authorization", bearer(&h.token_for(&admin)))
        .json(&new_user_body("new@example.com"))
        .await
        .assert_status(StatusCode::CREATED);
}

// ============= Transactions =============

#[tokio::test]
async fn test_failed_create_rolls_back() {
    let h = Harness::new();
    let admin = h.seed("admin@example.com", "gophers", vec![Role::Admin]).await;

    let local: Arc<dyn Authenticator> = h.auth.clone();
    let server = TestServer::new(h.sales_app(local)).unwrap();
    let token = bearer(&h.token_for(&admin));

    let commits = h.db.commits();
    let rollbacks = h.db.rollbacks();

    let response = server
        .post("/v1/users")
        .add_header("Authorization", token.clone())
        .json(&new_user_body("admin@example.com"))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    let body: ErrorBody = response.json();
    assert_eq!(body.code, ErrCode::Aborted);

    assert_eq!(h.db.rollbacks(), rollbacks + 1);
    assert_eq!(h.db.commits(), commits);
    assert_eq!(h.db.len(), 1);

    // Validation failures still roll back the open transaction.
    let mut body = new_user_body("fresh@example.com");
    body["passwordConfirm"] = json!("different");
    server
        .post("/v1/users")
        .add_header("Authorization", token)
        .json(&body)
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    assert_eq!(h.db.rollbacks(), rollbacks + 2);
    assert_eq!(h.db.len(), 1);
}

#[tokio::test]
async fn test_delete_unknown_user_is_not_found() {
    let h = Harness::new();
    let admin = h.seed("admin@example.com", "gophers", vec![Role::Admin]).await;

    let local: Arc<dyn Authenticator> = h.auth.clone();
    let server = TestServer::new(h.sales_app(local)).unwrap();

    server
        .delete(&format!("/v1/users/{}", Uuid::new_v4()))
        .add_header("Authorization", bearer(&h.token_for(&admin)))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

// ============= Pipeline =============

#[tokio::test]
async fn test_panic_detail_is_hidden_from_caller() {
    let h = Harness::new();
    let mut app = App::new(app_middleware(h.metrics.clone(), Duration::from_secs(5)));
    app.handle(
        MethodFilter::GET,
        "v1",
        "/boom",
        handler(|_, _| async {
            if true {
                panic!("secret detail");
            }
            Ok(StatusCode::OK.into_response())
        }),
        vec![],
    );
    let server = TestServer::new(app.into_router()).unwrap();

    let response = server.get("/v1/boom").await;
    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!response.text().contains("secret detail"));

    let snap = h.metrics.snapshot();
    assert_eq!(snap.panics, 1);
    assert_eq!(snap.errors, 1);

    // The process keeps serving.
    server.get("/v1/boom").await.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(h.metrics.snapshot().panics, 2);
}

#[tokio::test]
async fn test_slow_handler_hits_deadline() {
    let h = Harness::new();
    let mut app = App::new(app_middleware(h.metrics.clone(), Duration::from_millis(50)));
    app.handle(
        MethodFilter::GET,
        "v1",
        "/slow",
        handler(|_, _| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StatusCode::OK.into_response())
        }),
        vec![],
    );
    let server = TestServer::new(app.into_router()).unwrap();

    let response = server.get("/v1/slow").await;
    response.assert_status(StatusCode::GATEWAY_TIMEOUT);
    let body: ErrorBody = response.json();
    assert_eq!(body.code, ErrCode::DeadlineExceeded);
}

#[tokio::test]
async fn test_cors_preflight_is_answered() {
    let h = Harness::new();
    let server = TestServer::new(h.auth_app()).unwrap();

    let response = server
        .method(Method::OPTIONS, "/v1/auth/authenticate")
        .add_header("Origin", "http://example.com")
        .add_header("Access-Control-Request-Method", "GET")
        .await;

    response.assert_status_ok();
    assert_eq!(response.header("access-control-allow-origin"), "*");
}


#[tokio::test]
async fn test_oversized_body_is_refused() {
    let h = Harness::new();
    let server = TestServer::new(h.auth_app()).unwrap();
    let claims = h.auth.new_claims(Uuid::new_v4(), vec!["ADMIN".to_string()], 3600);
    let body = json!({ "claims": claims, "userID": Uuid::new_v4(), "rule": RULE_ADMIN_ONLY });

    server
        .post("/v1/auth/authorize")
        .json(&body)
        .await
        .assert_status(StatusCode::NO_CONTENT);

    let mut padded = body.clone();
    padded["padding"] = json!("x".repeat(gatehouse::web::MAX_BODY_BYTES + 1));
    let response = server.post("/v1/auth/authorize").json(&padded).await;

    assert!(
        matches!(
            response.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE | StatusCode::BAD_REQUEST
        ),
        "got {}",
        response.status_code()
    );
}
