//! End-to-end tests for the HTTP surface.
//!
//! These tests spin up the **real** Axum router on an OS-assigned ephemeral
//! port, backed by an on-disk store and a fake upstream provider, and drive
//! it with `reqwest` (redirects disabled so every hop can be inspected).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use calbridge_broker::{Broker, BrokerConfig, BrokerError, UpstreamProvider, pkce};
use calbridge_store::{Database, UpstreamToken};
use calbridge_web::{ToolCall, ToolDefinition, ToolDispatcher, ToolError, WebConfig, WebServer};
use reqwest::StatusCode;
use reqwest::header::{LOCATION, WWW_AUTHENTICATE};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use url::Url;

const REDIRECT: &str = "http://127.0.0.1:9000/callback";
const SUBJECT: &str = "alice@example.com";

// ── fakes ────────────────────────────────────────────────────────────────────

struct FakeUpstream;

#[async_trait]
impl UpstreamProvider for FakeUpstream {
    fn authorization_url(&self, state: &str) -> calbridge_broker::Result<String> {
        Ok(format!("https://upstream.test/auth?state={state}"))
    }

    async fn exchange_code(&self, code: &str) -> calbridge_broker::Result<UpstreamToken> {
        if code == "bad-code" {
            return Err(BrokerError::UpstreamRejected {
                reason: "invalid_grant".into(),
            });
        }
        Ok(UpstreamToken {
            access_token: format!("upstream-{code}"),
            refresh_token: Some("upstream-refresh".into()),
            token_type: "Bearer".into(),
            expires_at: None,
            scopes: vec![],
        })
    }

    async fn fetch_subject(&self, _token: &UpstreamToken) -> calbridge_broker::Result<String> {
        Ok(SUBJECT.to_string())
    }

    async fn refresh(&self, _refresh_token: &str) -> calbridge_broker::Result<UpstreamToken> {
        Err(BrokerError::Upstream {
            reason: "refresh not expected".into(),
        })
    }
}

/// Records every call so tests can check what reached the tool layer.
#[derive(Default)]
struct RecordingTools {
    calls: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl ToolDispatcher for RecordingTools {
    fn tools(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "list_events".into(),
            description: "List calendar events".into(),
            parameters: json!({ "type": "object" }),
        }]
    }

    async fn call(&self, call: ToolCall<'_>) -> Result<Value, ToolError> {
        if call.name != "list_events" {
            return Err(ToolError::UnknownTool(call.name.to_string()));
        }
        self.calls.lock().unwrap().push((
            call.subject.to_string(),
            call.upstream_access_token.to_string(),
            call.arguments.to_string(),
        ));
        Ok(Value::String("no events".into()))
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

struct TestServer {
    base: String,
    http: reqwest::Client,
    tools: Arc<RecordingTools>,
    _dir: tempfile::TempDir,
}

/// Bind to 127.0.0.1:0, start the full router, return a handle to it.
async fn start_test_server() -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open_and_migrate(dir.path().join("web.db"))
        .await
        .expect("open database");
    let broker = Broker::new(db, Arc::new(FakeUpstream), BrokerConfig::default());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to port 0");
    let port = listener.local_addr().expect("get local addr").port();
    let base = format!("http://127.0.0.1:{port}");

    let tools = Arc::new(RecordingTools::default());
    let config = WebConfig {
        bind_addr: "127.0.0.1".into(),
        port,
        base_url: base.clone(),
    };
    let app = WebServer::new(config, broker, tools.clone()).router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client");

    TestServer {
        base,
        http,
        tools,
        _dir: dir,
    }
}

fn query_of(url: &str) -> HashMap<String, String> {
    Url::parse(url)
        .expect("absolute url")
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn location(resp: &reqwest::Response) -> String {
    resp.headers()
        .get(LOCATION)
        .expect("Location header")
        .to_str()
        .expect("ascii location")
        .to_string()
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn register(&self) -> String {
        let resp = self
            .http
            .post(self.url("/oauth/register"))
            .json(&json!({ "client_name": "Agent", "redirect_uris": [REDIRECT] }))
            .send()
            .await
            .expect("register");
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = resp.json().await.expect("json");
        body["client_id"].as_str().expect("client_id").to_string()
    }

    /// Authorize, complete the upstream callback, and return the code.
    async fn authorize_and_callback(&self, client_id: &str, verifier: &str) -> String {
        let challenge = pkce::challenge(verifier);
        let resp = self
            .http
            .get(self.url("/oauth/authorize"))
            .query(&[
                ("response_type", "code"),
                ("client_id", client_id),
                ("redirect_uri", REDIRECT),
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
                ("state", "caller-xyz"),
            ])
            .send()
            .await
            .expect("authorize");
        assert_eq!(resp.status(), StatusCode::FOUND);
        let upstream = location(&resp);
        assert!(upstream.starts_with("https://upstream.test/auth"));
        let broker_state = query_of(&upstream)["state"].clone();
        assert!(broker_state.starts_with("as."));

        let resp = self
            .http
            .get(self.url("/auth/callback"))
            .query(&[("state", broker_state.as_str()), ("code", "good")])
            .send()
            .await
            .expect("callback");
        assert_eq!(resp.status(), StatusCode::FOUND);
        let back = location(&resp);
        assert!(back.starts_with(REDIRECT));
        let params = query_of(&back);
        assert_eq!(params["state"], "caller-xyz");
        params["code"].clone()
    }

    async fn token(&self, form: &[(&str, &str)]) -> reqwest::Response {
        self.http
            .post(self.url("/oauth/token"))
            .form(form)
            .send()
            .await
            .expect("token request")
    }

    async fn mcp(&self, bearer: Option<&str>, body: Value) -> reqwest::Response {
        let mut req = self.http.post(self.url("/mcp")).json(&body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        req.send().await.expect("mcp request")
    }
}

// ── full authorization flow ──────────────────────────────────────────────────

#[tokio::test]
async fn authorization_code_flow_end_to_end() {
    let srv = start_test_server().await;
    let client_id = srv.register().await;
    let verifier = pkce::generate_verifier().expect("verifier");
    let code = srv.authorize_and_callback(&client_id, &verifier).await;

    let redeem = [
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("code_verifier", verifier.as_str()),
        ("client_id", client_id.as_str()),
        ("redirect_uri", REDIRECT),
    ];
    let resp = srv.token(&redeem).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["cache-control"], "no-store");
    let grant: Value = resp.json().await.expect("json");
    assert_eq!(grant["token_type"], "Bearer");
    assert_eq!(grant["expires_in"], 3600);
    let access = grant["access_token"].as_str().expect("access").to_string();
    let refresh = grant["refresh_token"].as_str().expect("refresh").to_string();

    // The access token opens the MCP endpoint and the upstream token reaches
    // the tool layer.
    let resp = srv
        .mcp(
            Some(&access),
            json!({
                "jsonrpc": "2.0", "id": 7, "method": "tools/call",
                "params": { "name": "list_events", "arguments": { "days": 1 } }
            }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["id"], 7);
    assert_eq!(body["result"]["content"][0]["text"], "no events");
    {
        let calls = srv.tools.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, SUBJECT);
        assert_eq!(calls[0].1, "upstream-good");
        assert_eq!(calls[0].2, r#"{"days":1}"#);
    }

    // Codes are single use.
    let resp = srv.token(&redeem).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"], "invalid_grant");

    // Refresh rotates the pair and retires the old refresh token.
    let rotate = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh.as_str()),
        ("client_id", client_id.as_str()),
    ];
    let resp = srv.token(&rotate).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let rotated: Value = resp.json().await.expect("json");
    assert_ne!(rotated["access_token"], grant["access_token"]);
    assert_ne!(rotated["refresh_token"], grant["refresh_token"]);

    let resp = srv.token(&rotate).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"], "invalid_grant");

    // The old access token went with its pair.
    let resp = srv
        .mcp(Some(&access), json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }))
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_verifier_is_invalid_grant() {
    let srv = start_test_server().await;
    let client_id = srv.register().await;
    let verifier = pkce::generate_verifier().expect("verifier");
    let code = srv.authorize_and_callback(&client_id, &verifier).await;
    let other = pkce::generate_verifier().expect("verifier");

    let resp = srv
        .token(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("code_verifier", other.as_str()),
            ("client_id", client_id.as_str()),
            ("redirect_uri", REDIRECT),
        ])
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"], "invalid_grant");
    assert_eq!(body["error_description"], "PKCE verification failed");
}

#[tokio::test]
async fn failed_upstream_exchange_redirects_with_server_error() {
    let srv = start_test_server().await;
    let client_id = srv.register().await;
    let challenge = pkce::challenge("verifier-verifier-verifier-verifier-verifier");
    let resp = srv
        .http
        .get(srv.url("/oauth/authorize"))
        .query(&[
            ("response_type", "code"),
            ("client_id", client_id.as_str()),
            ("redirect_uri", REDIRECT),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("state", "s1"),
        ])
        .send()
        .await
        .expect("authorize");
    let broker_state = query_of(&location(&resp))["state"].clone();

    let resp = srv
        .http
        .get(srv.url("/auth/callback"))
        .query(&[("state", broker_state.as_str()), ("code", "bad-code")])
        .send()
        .await
        .expect("callback");
    assert_eq!(resp.status(), StatusCode::FOUND);
    let params = query_of(&location(&resp));
    assert_eq!(params["error"], "server_error");
    assert_eq!(params["state"], "s1");

    let resp = srv
        .http
        .get(srv.url("/auth/callback"))
        .query(&[("state", broker_state.as_str()), ("error", "access_denied")])
        .send()
        .await
        .expect("callback");
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(query_of(&location(&resp))["error"], "access_denied");
}

// ── authorization request validation ─────────────────────────────────────────

#[tokio::test]
async fn authorize_rejections_never_redirect() {
    let srv = start_test_server().await;
    let client_id = srv.register().await;

    let cases: [(&str, &str, &str, &str); 4] = [
        ("token", REDIRECT, "S256", "unsupported_response_type"),
        ("code", "http://127.0.0.1:9000/callback/", "S256", "invalid_request"),
        ("code", "https://evil.test/cb", "S256", "invalid_request"),
        ("code", REDIRECT, "plain", "invalid_request"),
    ];
    for (response_type, redirect_uri, method, expected) in cases {
        let resp = srv
            .http
            .get(srv.url("/oauth/authorize"))
            .query(&[
                ("response_type", response_type),
                ("client_id", client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("code_challenge", "abc"),
                ("code_challenge_method", method),
            ])
            .send()
            .await
            .expect("authorize");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{redirect_uri} {method}");
        assert!(resp.headers().get(LOCATION).is_none());
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["error"], expected);
    }

    let resp = srv
        .http
        .get(srv.url("/oauth/authorize"))
        .query(&[
            ("response_type", "code"),
            ("client_id", "nope"),
            ("redirect_uri", REDIRECT),
            ("code_challenge", "abc"),
            ("code_challenge_method", "S256"),
        ])
        .send()
        .await
        .expect("authorize");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error_description"], "unknown client_id");
}

#[tokio::test]
async fn callback_with_unknown_state_is_rejected() {
    let srv = start_test_server().await;
    for state in ["as.forged", "ls.forged", "plain", ""] {
        let resp = srv
            .http
            .get(srv.url("/auth/callback"))
            .query(&[("state", state), ("code", "good")])
            .send()
            .await
            .expect("callback");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.text().await.expect("text"), "invalid state parameter");
    }
}

// ── registration and token endpoint errors ───────────────────────────────────

#[tokio::test]
async fn registration_errors() {
    let srv = start_test_server().await;

    let resp = srv
        .http
        .post(srv.url("/oauth/register"))
        .json(&json!({ "client_name": "x" }))
        .send()
        .await
        .expect("register");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"], "invalid_request");

    let resp = srv
        .http
        .post(srv.url("/oauth/register"))
        .json(&json!({ "redirect_uris": ["javascript:alert(1)"] }))
        .send()
        .await
        .expect("register");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = srv
        .http
        .post(srv.url("/oauth/register"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .expect("register");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error_description"], "invalid JSON body");
}

#[tokio::test]
async fn registration_echoes_metadata() {
    let srv = start_test_server().await;
    let resp = srv
        .http
        .post(srv.url("/oauth/register"))
        .json(&json!({ "client_name": "Agent", "redirect_uris": [REDIRECT] }))
        .send()
        .await
        .expect("register");
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["client_id"].as_str().expect("client_id").len(), 22);
    assert_eq!(body["client_name"], "Agent");
    assert_eq!(body["redirect_uris"], json!([REDIRECT]));
    assert_eq!(body["token_endpoint_auth_method"], "none");
}

#[tokio::test]
async fn token_endpoint_errors() {
    let srv = start_test_server().await;

    let resp = srv.token(&[("grant_type", "password")]).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"], "unsupported_grant_type");

    let resp = srv
        .token(&[
            ("grant_type", "authorization_code"),
            ("code", "never-issued"),
            ("code_verifier", "v"),
            ("client_id", "c"),
            ("redirect_uri", REDIRECT),
        ])
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"], "invalid_grant");

    let resp = srv
        .token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", "never-issued"),
            ("client_id", "c"),
        ])
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"], "invalid_grant");
}

// ── legacy login flow ────────────────────────────────────────────────────────

#[tokio::test]
async fn login_flow_issues_working_api_key() {
    let srv = start_test_server().await;

    let resp = srv
        .http
        .get(srv.url("/auth/login"))
        .send()
        .await
        .expect("login");
    assert_eq!(resp.status(), StatusCode::FOUND);
    let login_state = query_of(&location(&resp))["state"].clone();
    assert!(login_state.starts_with("ls."));

    let resp = srv
        .http
        .get(srv.url("/auth/callback"))
        .query(&[("state", login_state.as_str()), ("code", "good")])
        .send()
        .await
        .expect("callback");
    assert_eq!(resp.status(), StatusCode::OK);
    let page = resp.text().await.expect("html");
    assert!(page.contains(SUBJECT));
    let start = page.find("gcal_").expect("api key on page");
    let api_key = &page[start..start + 5 + 64];

    let resp = srv
        .mcp(
            Some(api_key),
            json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["result"]["tools"][0]["name"], "list_events");
    assert!(body["result"]["tools"][0]["inputSchema"].is_object());

    // The login state is single use.
    let resp = srv
        .http
        .get(srv.url("/auth/callback"))
        .query(&[("state", login_state.as_str()), ("code", "good")])
        .send()
        .await
        .expect("callback");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn login_denial_is_escaped() {
    let srv = start_test_server().await;
    let resp = srv
        .http
        .get(srv.url("/auth/login"))
        .send()
        .await
        .expect("login");
    let login_state = query_of(&location(&resp))["state"].clone();

    let resp = srv
        .http
        .get(srv.url("/auth/callback"))
        .query(&[
            ("state", login_state.as_str()),
            ("error", "<script>alert(1)</script>"),
        ])
        .send()
        .await
        .expect("callback");
    assert_eq!(resp.status(), StatusCode::OK);
    let page = resp.text().await.expect("html");
    assert!(page.contains("Authentication failed"));
    assert!(!page.contains("<script>"));
}

// ── MCP endpoint ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn mcp_requires_bearer_with_resource_metadata_challenge() {
    let srv = start_test_server().await;
    let expected = format!(
        r#"Bearer resource_metadata="{}/.well-known/oauth-protected-resource""#,
        srv.base
    );

    for bearer in [None, Some("not-a-token"), Some("gcal_0000")] {
        let resp = srv
            .mcp(bearer, json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }))
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()[WWW_AUTHENTICATE], expected.as_str());
    }
}

#[tokio::test]
async fn mcp_protocol_basics() {
    let srv = start_test_server().await;
    let client_id = srv.register().await;
    let verifier = pkce::generate_verifier().expect("verifier");
    let code = srv.authorize_and_callback(&client_id, &verifier).await;
    let grant: Value = srv
        .token(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("code_verifier", verifier.as_str()),
            ("client_id", client_id.as_str()),
            ("redirect_uri", REDIRECT),
        ])
        .await
        .json()
        .await
        .expect("json");
    let access = grant["access_token"].as_str().expect("access").to_string();

    let resp = srv
        .mcp(
            Some(&access),
            json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
        )
        .await;
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(body["result"]["serverInfo"]["name"], "calbridge");

    let resp = srv
        .mcp(
            Some(&access),
            json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let resp = srv
        .mcp(
            Some(&access),
            json!([
                { "jsonrpc": "2.0", "id": 1, "method": "ping" },
                { "jsonrpc": "2.0", "method": "notifications/initialized" },
                { "jsonrpc": "2.0", "id": 2, "method": "no/such/method" },
                { "jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": { "name": "drop_tables" } },
            ]),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let batch: Value = resp.json().await.expect("json");
    let batch = batch.as_array().expect("batch response");
    assert_eq!(batch.len(), 3);
    assert_eq!(batch[0]["result"], json!({}));
    assert_eq!(batch[1]["error"]["code"], -32601);
    assert_eq!(batch[2]["result"]["isError"], true);

    let resp = srv
        .mcp(
            Some(&access),
            json!({ "jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": {} }),
        )
        .await;
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["code"], -32602);
}

// ── discovery ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn discovery_documents_use_base_url() {
    let srv = start_test_server().await;

    let meta: Value = srv
        .http
        .get(srv.url("/.well-known/oauth-authorization-server"))
        .send()
        .await
        .expect("metadata")
        .json()
        .await
        .expect("json");
    assert_eq!(meta["issuer"], srv.base.as_str());
    assert_eq!(meta["token_endpoint"], srv.url("/oauth/token"));
    assert_eq!(meta["registration_endpoint"], srv.url("/oauth/register"));
    assert_eq!(meta["code_challenge_methods_supported"], json!(["S256"]));
    assert_eq!(
        meta["grant_types_supported"],
        json!(["authorization_code", "refresh_token"])
    );

    for path in [
        "/.well-known/oauth-protected-resource",
        "/.well-known/oauth-protected-resource/mcp",
    ] {
        let resource: Value = srv
            .http
            .get(srv.url(path))
            .send()
            .await
            .expect("resource metadata")
            .json()
            .await
            .expect("json");
        assert_eq!(resource["resource"], srv.url("/mcp"));
        assert_eq!(resource["authorization_servers"], json!([srv.base]));
    }

    let health: Value = srv
        .http
        .get(srv.url("/health"))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("json");
    assert_eq!(health, json!({ "status": "ok" }));
}
