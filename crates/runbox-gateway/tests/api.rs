//! End-to-end tests of the tool endpoints against in-memory collaborators

use runbox_core::Runbox;
use runbox_core::storage::LocalWorkspaceStorage;
use runbox_core::testing::{FakeRuntime, FakeSpawner, MemoryProxy, StaticProbe, test_config};
use runbox_gateway::GatewayServer;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const KEY: &str = "secret-key";

struct TestServer {
    addr: SocketAddr,
    client: reqwest::Client,
    runtime: Arc<FakeRuntime>,
    cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir, 3);
        config.gateway.api_key = Some(KEY.to_string());

        let runtime = Arc::new(FakeRuntime::default());
        let storage = Arc::new(LocalWorkspaceStorage::new(&config.workspace_root));
        let runbox = Arc::new(Runbox::new(
            config,
            runtime.clone(),
            Arc::new(MemoryProxy::default()),
            storage,
            Arc::new(StaticProbe(HashSet::new())),
            Arc::new(FakeSpawner::new()),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = GatewayServer::new(runbox);
        let token = cancel.clone();
        tokio::spawn(async move { server.serve(listener, token).await });

        Self {
            addr,
            client: reqwest::Client::new(),
            runtime,
            cancel,
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn tool(&self, name: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(self.url(&format!("/api/tools/{}", name)))
            .header("Authorization", format!("Bearer {}", KEY))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn create(&self) -> String {
        let (status, body) = self.tool("create_sandbox", json!({})).await;
        assert_eq!(status, 200, "{body}");
        body["sandbox_id"].as_str().unwrap().to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tokio::test]
async fn test_root_and_health_are_open() {
    let server = TestServer::start().await;
    let resp = server.client.get(server.url("/")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("runbox"));

    let resp = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn test_missing_key_is_unauthorized() {
    let server = TestServer::start().await;
    let resp = server
        .client
        .post(server.url("/api/tools/create_sandbox"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Unauthorized");
    assert_eq!(server.runtime.starts(), 0);
}

#[tokio::test]
async fn test_bare_key_is_accepted() {
    let server = TestServer::start().await;
    let resp = server
        .client
        .get(server.url("/api/sandboxes"))
        .header("Authorization", KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["sandboxes"], json!([]));
}

#[tokio::test]
async fn test_create_execute_and_files() {
    let server = TestServer::start().await;
    let id = server.create().await;
    assert!(server.runtime.is_running(&id));

    let (status, body) = server
        .tool(
            "write_file",
            json!({"sandbox_id": id, "path": "/app/hello.txt", "content": "hi there"}),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    assert!(body.get("new_sandbox_id").is_none());

    let (status, body) = server
        .tool("read_file", json!({"sandbox_id": id, "path": "app/hello.txt"}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["text"], "hi there");

    let (status, body) = server
        .tool("list_directory", json!({"sandbox_id": id}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["entries"], json!([{"name": "app", "type": "dir"}]));

    let (status, body) = server
        .tool(
            "execute_command",
            json!({"sandbox_id": id, "command": "echo hello", "timeout": 2000}),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["output"], "hello");
    assert_eq!(body["text"], "hello");

    let resp = server
        .client
        .get(server.url(&format!("/api/sandboxes/{}/sessions", id)))
        .bearer_auth(KEY)
        .send()
        .await
        .unwrap();
    let sessions: Value = resp.json().await.unwrap();
    assert_eq!(sessions["sessions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_timed_out_command_can_be_polled() {
    let server = TestServer::start().await;
    let id = server.create().await;

    let (status, body) = server
        .tool(
            "execute_command",
            json!({"sandbox_id": id, "command": "sleep 60", "timeout": 50}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "timed_out");
    let session_id = body["session_id"].as_str().unwrap().to_string();

    let (status, body) = server
        .tool(
            "poll_command",
            json!({"session_id": session_id, "timeout": 50}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "timed_out");

    let (status, _) = server
        .tool("kill_session", json!({"session_id": session_id}))
        .await;
    assert_eq!(status, 200);

    let (status, body) = server
        .tool("poll_command", json!({"session_id": session_id}))
        .await;
    assert_eq!(status, 404);
    assert!(body["error"].as_str().unwrap().contains(&session_id));
}

#[tokio::test]
async fn test_write_without_sandbox_creates_one() {
    let server = TestServer::start().await;
    let (status, body) = server
        .tool("write_file", json!({"path": "index.html", "content": "<h1>x</h1>"}))
        .await;
    assert_eq!(status, 200, "{body}");
    let id = body["new_sandbox_id"].as_str().unwrap();
    assert_eq!(body["sandbox_id"], id);
    assert!(server.runtime.is_running(id));
}

#[tokio::test]
async fn test_expose_and_release_port() {
    let server = TestServer::start().await;
    let id = server.create().await;

    let (status, body) = server
        .tool("expose_port", json!({"sandbox_id": id}))
        .await;
    assert_eq!(status, 200, "{body}");
    let port = body["port"].as_u64().unwrap();
    assert!((3000..=3100).contains(&port));
    assert_eq!(
        body["url"],
        format!("http://{}-{}.runbox.ai", id, port)
    );

    let (status, body) = server
        .tool("release_port", json!({"sandbox_id": id}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["port"].as_u64(), Some(port));
}

#[tokio::test]
async fn test_editor_url() {
    let server = TestServer::start().await;
    let (status, body) = server
        .tool("get_sandbox_editor_url", json!({"sandbox_id": "abc123"}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["url"], "http://abc123.runbox.ai/?folder=/home");
}

#[tokio::test]
async fn test_error_mapping() {
    let server = TestServer::start().await;

    // Unknown sandbox
    let (status, body) = server
        .tool("read_file", json!({"sandbox_id": "missing", "path": "a"}))
        .await;
    assert_eq!(status, 404);
    assert!(body["error"].is_string());

    // Malformed ID
    let (status, _) = server
        .tool("resume_sandbox", json!({"sandbox_id": "../etc"}))
        .await;
    assert_eq!(status, 400);

    // Missing required field
    let (status, body) = server
        .tool("execute_command", json!({"sandbox_id": "abc"}))
        .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("command"));

    // Empty command
    let id = server.create().await;
    let (status, _) = server
        .tool("execute_command", json!({"sandbox_id": id, "command": "  "}))
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_stop_then_destroy() {
    let server = TestServer::start().await;
    let id = server.create().await;

    let (status, body) = server.tool("stop_sandbox", json!({"sandbox_id": id})).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "stopped");
    assert!(!server.runtime.is_running(&id));

    let (status, _) = server
        .tool("destroy_sandbox", json!({"sandbox_id": id}))
        .await;
    assert_eq!(status, 200);
    assert!(!server.runtime.exists(&id));

    let (status, _) = server
        .tool("destroy_sandbox", json!({"sandbox_id": id}))
        .await;
    assert_eq!(status, 404);
}
