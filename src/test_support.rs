use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{default_config, CutoverConfig, HostConfig};

#[derive(Clone)]
struct ScriptedResponses {
    queue: Arc<Mutex<VecDeque<(u16, String)>>>,
    last: Arc<Mutex<(u16, String)>>,
    hits: Arc<AtomicUsize>,
}

pub struct HealthServer {
    port: u16,
    hits: Arc<AtomicUsize>,
}

impl HealthServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn scripted_health(State(state): State<ScriptedResponses>) -> (StatusCode, String) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let next = state.queue.lock().expect("queue lock").pop_front();
    let (status, body) = match next {
        Some(response) => {
            *state.last.lock().expect("last lock") = response.clone();
            response
        }
        None => state.last.lock().expect("last lock").clone(),
    };
    (
        StatusCode::from_u16(status).expect("status code"),
        body,
    )
}

/// Serves `/health` from a background runtime, answering with `responses` in order and
/// repeating the final one once the script runs out.
pub fn spawn_health_server(responses: Vec<(u16, &str)>) -> HealthServer {
    let responses: VecDeque<(u16, String)> = responses
        .into_iter()
        .map(|(status, body)| (status, body.to_string()))
        .collect();
    let fallback = responses
        .back()
        .cloned()
        .unwrap_or((200, r#"{"status":"healthy"}"#.to_string()));
    let state = ScriptedResponses {
        queue: Arc::new(Mutex::new(responses)),
        last: Arc::new(Mutex::new(fallback)),
        hits: Arc::new(AtomicUsize::new(0)),
    };
    let hits = state.hits.clone();

    let (port_tx, port_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("test runtime");
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind health server");
            let port = listener.local_addr().expect("local addr").port();
            port_tx.send(port).expect("send port");
            let app = Router::new()
                .route("/health", get(scripted_health))
                .with_state(state);
            axum::serve(listener, app).await.ok();
        });
    });
    let port = port_rx.recv().expect("health server port");
    HealthServer { port, hits }
}

/// Config rooted in `root` with fast health polling and a local release host.
pub fn test_config(root: &Path, health_url: &str) -> CutoverConfig {
    let mut config = default_config();
    config.state_root = root.join("state").display().to_string();
    config.backup_root = root.join("backups").display().to_string();
    config.command_timeout_seconds = 30;
    config.release.name = "web".to_string();
    config.release.host = "local".to_string();
    config.release.live_dir = root.join("srv/current").display().to_string();
    config.release.build_commands = vec!["test -f index.js".to_string()];
    config.release.stop_command = format!("echo stop >> {}", root.join("process.log").display());
    config.release.start_command =
        format!("echo start >> {}", root.join("process.log").display());
    config.release.health.url = health_url.to_string();
    config.release.health.max_attempts = 3;
    config.release.health.initial_delay_ms = 10;
    config.release.health.max_delay_ms = 20;
    config.release.health.attempt_timeout_ms = 2_000;
    config.migration.transfer_initial_delay_ms = 10;
    config
}

/// A loopback host whose "database server" is a directory tree under `root`.
pub fn fake_db_host(root: &Path, name: &str) -> HostConfig {
    HostConfig {
        address: "localhost".to_string(),
        port: 22,
        user: "test".to_string(),
        identity_file: None,
        password_env: None,
        host_key_fingerprint: None,
        work_dir: root.join(format!("{name}/work")).display().to_string(),
        backup_root: root.join(format!("{name}/backups")).display().to_string(),
        mongo_uri: root.join(format!("{name}/data")).display().to_string(),
    }
}

/// Shell stand-ins for the mongo tools: a database is `{uri}/{db}/`, a collection is a
/// `.bson` file and each line is one document.
pub fn use_fake_db_tools(config: &mut CutoverConfig) {
    config.migration.count_command = concat!(
        "d={uri}/{db}; ",
        "if [ ! -d \"$d\" ]; then echo '{\"exists\":false,\"collections\":{}}'; exit 0; fi; ",
        "printf '{\"exists\":true,\"collections\":{'; sep=''; ",
        "for f in \"$d\"/*.bson; do [ -e \"$f\" ] || continue; ",
        "n=$(wc -l < \"$f\" | tr -d ' '); c=$(basename \"$f\" .bson); ",
        "printf '%s\"%s\":%s' \"$sep\" \"$c\" \"$n\"; sep=','; done; ",
        "printf '}}\\n'"
    )
    .to_string();
    config.migration.dump_command =
        "mkdir -p {dir}/{db} && cp {uri}/{db}/*.bson {dir}/{db}/".to_string();
    config.migration.restore_command =
        "mkdir -p {uri}/{db} && rm -f {uri}/{db}/*.bson && cp {dir}/{db}/*.bson {uri}/{db}/"
            .to_string();
}

pub fn seed_collection(host: &HostConfig, db: &str, collection: &str, documents: usize) {
    let dir = Path::new(&host.mongo_uri).join(db);
    std::fs::create_dir_all(&dir).expect("create fake db dir");
    let body: String = (0..documents)
        .map(|i| format!("{{\"_id\":{i}}}\n"))
        .collect();
    std::fs::write(dir.join(format!("{collection}.bson")), body).expect("write collection");
}
