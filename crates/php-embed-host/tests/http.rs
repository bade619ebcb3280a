//! HTTP integration tests for php-embed-host.
//!
//! These tests run requests through the engine on the in-memory runtime:
//! - Superglobals built from the inbound request
//! - Request body parsing for urlencoded forms
//! - Response status, headers and body
//! - Script log capture

use std::sync::Arc;

use bytes::Bytes;
use http::Request;
use serde_json::json;

use php_embed_common::{EngineError, RuntimeConfig};
use php_embed_core::{Engine, ExecutionContext, HostValue, MemoryRuntime, SharedBuffer};
use php_embed_host::{HttpRequest, HttpResponse, LogLevel, LogSink};

fn setup() -> (Arc<MemoryRuntime>, Engine) {
    let runtime = Arc::new(MemoryRuntime::new());
    let mut engine = Engine::new(runtime.clone(), &RuntimeConfig::default());
    engine.initialize().unwrap();
    (runtime, engine)
}

fn get(uri: &str) -> HttpRequest {
    let request = Request::builder()
        .uri(uri)
        .header("Host", "localhost:8080")
        .body(Bytes::new())
        .unwrap();
    HttpRequest::new(request)
}

fn context(request: HttpRequest, response: &HttpResponse) -> ExecutionContext {
    ExecutionContext::builder()
        .request(request)
        .response(response.clone())
        .document_root("/docroot")
        .script_filename("/docroot/index.php")
        .build()
}

fn eval(engine: &mut Engine, ctx: &mut ExecutionContext, script: &str) -> HostValue {
    engine.eval(ctx, script).unwrap().as_native()
}

// ============================================================================
// Test: Server Values
// ============================================================================

#[test]
fn test_server_values_visible_to_script() {
    let (runtime, mut engine) = setup();
    runtime.script("return $_SERVER;", |scope| {
        let keys = [
            "REQUEST_URI",
            "QUERY_STRING",
            "REQUEST_METHOD",
            "DOCUMENT_ROOT",
            "SCRIPT_FILENAME",
            "SCRIPT_NAME",
            "PHP_SELF",
            "REMOTE_ADDR",
            "REMOTE_PORT",
            "HTTP_HOST",
            "SERVER_NAME",
            "SERVER_PORT",
        ];
        Ok(keys
            .into_iter()
            .map(|key| (key, scope.server(key).cloned().unwrap_or_default()))
            .collect())
    });

    let response = HttpResponse::new();
    let request = get("/hello?foo=bar").with_remote_addr("1.2.3.4:5555");
    let mut ctx = context(request, &response);
    engine.request_startup(&mut ctx).unwrap();

    let server = eval(&mut engine, &mut ctx, "return $_SERVER;");
    let field = |key: &str| {
        server
            .get(key)
            .and_then(HostValue::as_str)
            .unwrap_or("<missing>")
            .to_string()
    };

    assert_eq!(field("REQUEST_URI"), "/hello?foo=bar");
    assert_eq!(field("QUERY_STRING"), "foo=bar");
    assert_eq!(field("REQUEST_METHOD"), "GET");
    assert_eq!(field("DOCUMENT_ROOT"), "/docroot");
    assert_eq!(field("SCRIPT_FILENAME"), "/docroot/index.php");
    assert_eq!(field("SCRIPT_NAME"), "/index.php");
    assert_eq!(field("PHP_SELF"), "/index.php");
    assert_eq!(field("REMOTE_ADDR"), "1.2.3.4");
    assert_eq!(field("REMOTE_PORT"), "5555");
    assert_eq!(field("HTTP_HOST"), "localhost:8080");
    assert_eq!(field("SERVER_NAME"), "localhost");
    assert_eq!(field("SERVER_PORT"), "8080");
}

#[test]
fn test_content_length_is_integer() {
    let (runtime, mut engine) = setup();
    runtime.script("return $_SERVER['HTTP_CONTENT_LENGTH'];", |scope| {
        Ok(scope.server("HTTP_CONTENT_LENGTH").cloned().unwrap_or_default())
    });

    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header("Content-Length", "19")
        .body(Bytes::from_static(b"form_arg=form_value"))
        .unwrap();
    let response = HttpResponse::new();
    let mut ctx = context(HttpRequest::new(request), &response);
    engine.request_startup(&mut ctx).unwrap();

    let value = eval(&mut engine, &mut ctx, "return $_SERVER['HTTP_CONTENT_LENGTH'];");
    assert_eq!(value, HostValue::Int(19));
}

#[test]
fn test_document_root_from_config() {
    let runtime = Arc::new(MemoryRuntime::new());
    let mut config = RuntimeConfig::default();
    config.request.document_root = Some("/srv/www".to_string());
    let mut engine = Engine::new(runtime.clone(), &config);
    engine.initialize().unwrap();
    runtime.script("return $_SERVER['DOCUMENT_ROOT'];", |scope| {
        Ok(scope.server("DOCUMENT_ROOT").cloned().unwrap_or_default())
    });

    let response = HttpResponse::new();
    let mut ctx = ExecutionContext::builder()
        .request(get("/"))
        .response(response.clone())
        .build();
    engine.request_startup(&mut ctx).unwrap();

    let value = eval(&mut engine, &mut ctx, "return $_SERVER['DOCUMENT_ROOT'];");
    assert_eq!(value, HostValue::from("/srv/www"));
}

// ============================================================================
// Test: Request Collections
// ============================================================================

#[test]
fn test_post_form_body() {
    let (runtime, mut engine) = setup();
    runtime.script("return $_POST['form_arg'];", |scope| {
        Ok(scope.post("form_arg").cloned().unwrap_or_default())
    });

    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("Content-Length", "19")
        .body(Bytes::from_static(b"form_arg=form_value"))
        .unwrap();
    let response = HttpResponse::new();
    let mut ctx = context(HttpRequest::new(request), &response);
    engine.request_startup(&mut ctx).unwrap();

    let value = eval(&mut engine, &mut ctx, "return $_POST['form_arg'];");
    assert_eq!(value, HostValue::from("form_value"));
}

#[test]
fn test_query_and_cookies() {
    let (runtime, mut engine) = setup();
    runtime.script("return [$_GET['get_arg'], $_COOKIE['cookie_name']];", |scope| {
        Ok(HostValue::List(vec![
            scope.get("get_arg").cloned().unwrap_or_default(),
            scope.cookie("cookie_name").cloned().unwrap_or_default(),
        ]))
    });

    let request = Request::builder()
        .uri("/index.php?get_arg=get_value")
        .header("Cookie", "cookie_name=cookie_value; other=1")
        .body(Bytes::new())
        .unwrap();
    let response = HttpResponse::new();
    let mut ctx = context(HttpRequest::new(request), &response);
    engine.request_startup(&mut ctx).unwrap();

    let value = eval(
        &mut engine,
        &mut ctx,
        "return [$_GET['get_arg'], $_COOKIE['cookie_name']];",
    );
    assert_eq!(value, HostValue::from(vec!["get_value", "cookie_value"]));
}

// ============================================================================
// Test: Response
// ============================================================================

#[test]
fn test_header_sequence() {
    let (runtime, mut engine) = setup();
    runtime
        .script("header('X-Testing: Hello');", |scope| {
            scope.header("X-Testing: Hello", true);
            Ok(HostValue::Null)
        })
        .script("header('X-Testing: World', false);", |scope| {
            scope.header("X-Testing: World", false);
            Ok(HostValue::Null)
        })
        .script("header_remove('X-Testing');", |scope| {
            scope.header_remove("X-Testing");
            Ok(HostValue::Null)
        })
        .script("header('X-Testing: Done', false);", |scope| {
            scope.header("X-Testing: Done", false);
            Ok(HostValue::Null)
        });

    let response = HttpResponse::new();
    let mut ctx = context(get("/"), &response);
    engine.request_startup(&mut ctx).unwrap();

    let steps: [(&str, &[&str]); 4] = [
        ("header('X-Testing: Hello');", &["Hello"]),
        ("header('X-Testing: World', false);", &["Hello", "World"]),
        ("header_remove('X-Testing');", &[]),
        ("header('X-Testing: Done', false);", &["Done"]),
    ];
    for (script, expected) in steps {
        eval(&mut engine, &mut ctx, script);
        assert_eq!(response.header_values("X-Testing"), expected, "after {script}");
    }
    assert!(!response.is_started());
}

#[test]
fn test_default_status_and_body() {
    let (runtime, mut engine) = setup();
    runtime.script("echo 'Hello World';", |scope| {
        scope.echo("Hello World");
        Ok(HostValue::Null)
    });

    let response = HttpResponse::new();
    let mut ctx = context(get("/"), &response);
    engine.request_startup(&mut ctx).unwrap();
    eval(&mut engine, &mut ctx, "echo 'Hello World';");
    engine.request_shutdown(&mut ctx);

    assert_eq!(response.status(), 200);
    assert_eq!(response.body_string(), "Hello World");
}

#[test]
fn test_explicit_status_kept() {
    let (runtime, mut engine) = setup();
    runtime.script("http_response_code(400); echo 'bad';", |scope| {
        scope.http_response_code(400);
        scope.echo("bad");
        Ok(HostValue::Null)
    });

    let response = HttpResponse::new();
    let mut ctx = context(get("/"), &response);
    engine.request_startup(&mut ctx).unwrap();
    eval(&mut engine, &mut ctx, "http_response_code(400); echo 'bad';");
    engine.request_shutdown(&mut ctx);

    let response = response.into_http_response();
    assert_eq!(response.status().as_u16(), 400);
    assert_eq!(response.body().as_ref(), b"bad");
}

#[test]
fn test_status_sent_on_shutdown_without_output() {
    let (runtime, mut engine) = setup();
    runtime.script("http_response_code(204);", |scope| {
        scope.http_response_code(204);
        Ok(HostValue::Null)
    });

    let response = HttpResponse::new();
    let mut ctx = context(get("/"), &response);
    engine.request_startup(&mut ctx).unwrap();
    eval(&mut engine, &mut ctx, "http_response_code(204);");
    assert!(!response.is_started());

    engine.request_shutdown(&mut ctx);
    assert!(response.is_started());
    assert_eq!(response.status(), 204);
}

#[test]
fn test_header_after_output_is_ignored() {
    let (runtime, mut engine) = setup();
    runtime.script("echo 'x'; header('X-Late: yes');", |scope| {
        scope.echo("x");
        scope.header("X-Late: yes", true);
        Ok(HostValue::Null)
    });

    let response = HttpResponse::new();
    let log = LogSink::new("late-header");
    let mut ctx = ExecutionContext::builder()
        .request(get("/"))
        .response(response.clone())
        .log(log.clone())
        .build();
    engine.request_startup(&mut ctx).unwrap();
    eval(&mut engine, &mut ctx, "echo 'x'; header('X-Late: yes');");

    assert!(response.header_values("X-Late").is_empty());
    let entries = log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].level, LogLevel::Warn);
    assert!(entries[0].message.contains("headers already sent"));
}

#[test]
fn test_finish_request_starts_response() {
    let (runtime, mut engine) = setup();
    runtime
        .script("ob_start(); echo 'hello';", |scope| {
            scope.ob_start();
            scope.echo("hello");
            Ok(HostValue::Null)
        })
        .script("echo 'late';", |scope| {
            scope.echo("late");
            Ok(HostValue::Null)
        });

    let response = HttpResponse::new();
    let mut ctx = context(get("/"), &response);
    engine.request_startup(&mut ctx).unwrap();

    eval(&mut engine, &mut ctx, "ob_start(); echo 'hello';");
    assert!(response.body().is_empty());

    engine.finish_request(&mut ctx).unwrap();
    assert!(response.is_started());
    assert_eq!(response.body_string(), "hello");

    // output after finishing is dropped
    eval(&mut engine, &mut ctx, "echo 'late';");
    assert_eq!(response.body_string(), "hello");
    assert!(matches!(
        engine.finish_request(&mut ctx),
        Err(EngineError::AlreadyFinished)
    ));
}

#[test]
fn test_output_and_response_conflict() {
    let (_runtime, mut engine) = setup();
    let response = HttpResponse::new();
    let mut ctx = ExecutionContext::builder()
        .request(get("/"))
        .response(response)
        .output(SharedBuffer::new())
        .build();

    let err = engine.request_startup(&mut ctx).unwrap_err();
    assert!(matches!(err, EngineError::ConflictingOutputTarget));
}

#[test]
fn test_bound_json_rendered_to_response() {
    let (runtime, mut engine) = setup();
    runtime.script("echo \"Hello, {$user['name']}\";", |scope| {
        let user = scope.var("user").unwrap_or_default();
        let name = user.get("name").and_then(HostValue::as_str).unwrap_or("").to_string();
        scope.echo(format!("Hello, {name}"));
        Ok(HostValue::Null)
    });

    let response = HttpResponse::new();
    let mut ctx = context(get("/"), &response);
    engine.request_startup(&mut ctx).unwrap();

    let user = HostValue::from(json!({ "name": "alice", "roles": ["admin"] }));
    engine.bind(&mut ctx, "user", &user).unwrap();
    eval(&mut engine, &mut ctx, "echo \"Hello, {$user['name']}\";");
    engine.request_shutdown(&mut ctx);

    assert_eq!(response.body_string(), "Hello, alice");
    assert_eq!(runtime.live_values(), 0);
}
