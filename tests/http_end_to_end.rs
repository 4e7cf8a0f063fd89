//! Configuration, context and HTTP gateway wired together against a mock backend.

use clap::Parser;
use httpmock::MockServer;
use libris_sync::LibraryContext;
use libris_sync::config::{self, CliArgs};
use tempfile::TempDir;

const BOOK_JSON: &str = r#"{"id":42,"title":"Dune","author":"Frank Herbert","categoryId":2,"categoryName":"Science Fiction","downloadCount":3,"favoriteCount":1,"available":true,"tagNames":["sf"],"createdAt":"2024-01-01T10:00:00","updatedAt":"2024-01-01T10:00:00"}"#;

async fn context(server: &MockServer, dir: &TempDir, command: &[&str]) -> LibraryContext {
    let base_url = server.url("/api/");
    let preferences = dir.path().join("preferences.toml");
    let mut args = vec![
        "libris-sync".to_string(),
        "--base-url".to_string(),
        base_url,
        "--token".to_string(),
        "secret".to_string(),
        "--preferences-path".to_string(),
        preferences.display().to_string(),
    ];
    args.extend(command.iter().map(|arg| arg.to_string()));
    let cli = CliArgs::try_parse_from(args).expect("arguments should parse");
    let settings = config::load(&cli).expect("settings should load");
    LibraryContext::from_settings(&settings)
        .await
        .expect("context should build")
}

#[tokio::test]
async fn detail_is_fetched_once_with_the_configured_token() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method("GET")
            .path("/api/books/42")
            .header("authorization", "Bearer secret");
        then.status(200)
            .header("content-type", "application/json")
            .body(BOOK_JSON);
    });
    let dir = TempDir::new().expect("tempdir");
    let context = context(&server, &dir, &["book", "42"]).await;

    let first = context.queries().book(42).await.expect("first read");
    let second = context.queries().book(42).await.expect("cached read");
    mock.assert();
    assert_eq!(first, second);
    assert_eq!(first.title, "Dune");
}

#[tokio::test]
async fn toggle_posts_and_marks_the_book() {
    let server = MockServer::start();
    let _listing = server.mock(|when, then| {
        when.method("GET").path("/api/users/favorites");
        then.status(200)
            .header("content-type", "application/json")
            .body("[]");
    });
    let add = server.mock(|when, then| {
        when.method("POST").path("/api/users/favorites/42");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"message":"Book added to favorites"}"#);
    });
    let dir = TempDir::new().expect("tempdir");
    let context = context(&server, &dir, &["favorites", "toggle", "42"]).await;

    let favorite = context
        .mutations()
        .toggle_favorite(42)
        .await
        .expect("toggle should succeed");
    assert!(favorite);
    add.assert();
    assert!(context.queries().is_favorite(42));
}

#[tokio::test]
async fn unauthorized_response_signs_the_session_out() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method("GET").path("/api/users/favorites");
        then.status(401);
    });
    let dir = TempDir::new().expect("tempdir");
    let context = context(&server, &dir, &["favorites", "list"]).await;
    assert!(context.session().is_authenticated());

    let err = context
        .queries()
        .favorites()
        .await
        .expect_err("401 should fail");
    assert!(err.gateway().is_some_and(|error| error.is_unauthorized()));
    assert!(!context.session().is_authenticated());
}
