//! End-to-end cluster tests: role election, replication, persistence,
//! restart reconvergence.
//!
//! Every test runs its own cluster on a dedicated port with throwaway data
//! directories, so the tests are independent and can run in parallel.

use std::future::Future;
use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use nanokv::{Configuration, Node, RecordType};
use serde::{Deserialize, Serialize};

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct User {
    id: i64,
    name: String,
    birth_year: String,
    text: String,
    created: String,
    edited: String,
}

impl RecordType for User {
    const NAME: &'static str = "User";
}

fn new_user(id: i64) -> User {
    User {
        id,
        name: "Test User".to_string(),
        birth_year: "1991".to_string(),
        text: "Lorem ipsum dolor sit amet, consectetur adipiscing elit.".to_string(),
        created: "2017-01-01".to_string(),
        edited: "2017-01-01".to_string(),
    }
}

fn config(port: u16, dir: &Path) -> Configuration {
    Configuration {
        port,
        directory: Some(dir.to_path_buf()),
        flush_debounce: Duration::from_millis(25),
        ..Configuration::default()
    }
}

/// Polls `condition` until it holds or the deadline passes.
async fn eventually<F, Fut>(deadline: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= end {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_binder_is_server() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let node = Node::new(config(42411, dir.path())).await.expect("node");

    assert!(node.is_server());
    assert!(!node.is_closed());
    assert_eq!(node.address().port(), 42411);

    let db = node.namespace("test").expect("namespace");
    db.register_type::<User>();

    db.set("1", new_user(1)).await;
    db.set("2", new_user(2)).await;

    let user = db.get::<User>("1").await.expect("present");
    assert_eq!(user.id, 1);
    assert_eq!(user.name, "Test User");

    assert!(db.exists("User", "1").await);
    assert!(db.delete("User", "2").await);
    assert!(!db.exists("User", "2").await);

    node.close().await;
    assert!(node.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let node = Node::new(config(42412, dir.path())).await.expect("node");
        let db = node.namespace("test").expect("namespace");
        db.register_type::<User>();
        db.set("1", new_user(1)).await;
        node.close().await;
    }

    let node = Node::new(config(42412, dir.path())).await.expect("restarted node");
    assert!(node.is_server());
    let db = node.namespace("test").expect("namespace");
    db.register_type::<User>();

    assert!(db.exists("User", "1").await);
    let user = db.get::<User>("1").await.expect("survived restart");
    assert_eq!(user.id, 1);

    node.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_replicates_set_to_all_nodes() {
    init_tracing();
    const PORT: u16 = 42413;
    let dirs: Vec<_> = (0..4).map(|_| tempfile::tempdir().expect("tempdir")).collect();

    let mut nodes = Vec::new();
    for (i, dir) in dirs.iter().enumerate() {
        let node = Node::new(config(PORT, dir.path())).await.expect("node");
        assert_eq!(node.is_server(), i == 0);
        let db = node.namespace("test").expect("namespace");
        db.register_type::<User>();
        nodes.push(node);
    }

    assert!(
        eventually(Duration::from_secs(5), || async {
            nodes[0].peer_count() == 3
        })
        .await,
        "clients never connected"
    );

    // Write on client #1; every node converges.
    nodes[1]
        .namespace("test")
        .expect("namespace")
        .set("42", new_user(42))
        .await;

    for node in &nodes {
        let db = node.namespace("test").expect("namespace");
        assert!(
            eventually(Duration::from_secs(5), || {
                let db = db.clone();
                async move { db.exists("User", "42").await }
            })
            .await,
            "record did not reach every node"
        );
        let user = db.get::<User>("42").await.expect("replicated");
        assert_eq!(user.id, 42);
    }

    for node in nodes.iter().rev() {
        node.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_replicates_delete() {
    init_tracing();
    const PORT: u16 = 42414;
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().expect("tempdir")).collect();

    let mut nodes = Vec::new();
    for dir in &dirs {
        let node = Node::new(config(PORT, dir.path())).await.expect("node");
        let db = node.namespace("test").expect("namespace");
        db.register_type::<User>();
        nodes.push(node);
    }

    nodes[1]
        .namespace("test")
        .expect("namespace")
        .set("42", new_user(42))
        .await;

    for node in &nodes {
        let db = node.namespace("test").expect("namespace");
        assert!(
            eventually(Duration::from_secs(5), || {
                let db = db.clone();
                async move { db.exists("User", "42").await }
            })
            .await
        );
    }

    // Delete on a different client than the writer.
    assert!(
        nodes[2]
            .namespace("test")
            .expect("namespace")
            .delete("User", "42")
            .await
    );

    for node in &nodes {
        let db = node.namespace("test").expect("namespace");
        assert!(
            eventually(Duration::from_secs(5), || {
                let db = db.clone();
                async move { !db.exists("User", "42").await }
            })
            .await,
            "delete did not reach every node"
        );
    }

    for node in nodes.iter().rev() {
        node.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_first_read_waits_for_snapshot() {
    init_tracing();
    const PORT: u16 = 42415;
    let server_dir = tempfile::tempdir().expect("tempdir");
    let client_dir = tempfile::tempdir().expect("tempdir");

    let server = Node::new(config(PORT, server_dir.path())).await.expect("server");
    let server_db = server.namespace("test").expect("namespace");
    server_db.register_type::<User>();
    server_db.set("1", new_user(1)).await;

    let client = Node::new(config(PORT, client_dir.path())).await.expect("client");
    assert!(!client.is_server());
    let client_db = client.namespace("test").expect("namespace");
    client_db.register_type::<User>();

    // The very first read blocks on the initial snapshot rather than
    // observing an empty collection.
    let user = tokio::time::timeout(Duration::from_secs(5), client_db.get::<User>("1"))
        .await
        .expect("snapshot arrived")
        .expect("record present");
    assert_eq!(user.id, 1);

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bulk_writes_are_all_visible() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let node = Node::new(config(42416, dir.path())).await.expect("node");
    let db = node.namespace("test").expect("namespace");
    db.register_type::<User>();

    let record_count = 10_000;
    for i in 0..record_count {
        db.set(&i.to_string(), new_user(i)).await;
    }

    let users = db.all_as::<User>().await;
    assert_eq!(users.len(), usize::try_from(record_count).expect("count"));

    let mut ids: Vec<i64> = users.iter().map(|u| u.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), usize::try_from(record_count).expect("count"));

    node.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_reconverges_after_server_restart() {
    init_tracing();
    const PORT: u16 = 42417;
    let server_dir = tempfile::tempdir().expect("tempdir");
    let client_dir = tempfile::tempdir().expect("tempdir");

    let server = Node::new(config(PORT, server_dir.path())).await.expect("server");
    let server_db = server.namespace("test").expect("namespace");
    server_db.register_type::<User>();
    server_db.set("1", new_user(1)).await;

    let client = Node::new(config(PORT, client_dir.path())).await.expect("client");
    let client_db = client.namespace("test").expect("namespace");
    client_db.register_type::<User>();
    assert!(client_db.exists("User", "1").await);

    // Give the flush loop a moment to persist User/1, then kill the server.
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.close().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // A write during downtime stays visible locally; it is not buffered for
    // replay, only logged as divergence.
    client_db.set("2", new_user(2)).await;
    assert!(client_db.exists("User", "2").await);

    let restarted = Node::new(config(PORT, server_dir.path()))
        .await
        .expect("restarted server");
    assert!(restarted.is_server());
    let restarted_db = restarted.namespace("test").expect("namespace");
    restarted_db.register_type::<User>();

    // The restarted server recovers its snapshot from disk.
    assert!(restarted_db.exists("User", "1").await);

    // The client re-binds and keeps serving the pre-restart record.
    assert!(
        eventually(Duration::from_secs(10), || {
            let db = client_db.clone();
            async move { db.exists("User", "1").await }
        })
        .await
    );
    assert!(
        eventually(Duration::from_secs(10), || async {
            restarted.peer_count() == 1
        })
        .await,
        "client never re-dialed the restarted server"
    );

    // New server-side writes reach the reconnected client.
    restarted_db.set("3", new_user(3)).await;
    assert!(
        eventually(Duration::from_secs(10), || {
            let db = client_db.clone();
            async move { db.exists("User", "3").await }
        })
        .await,
        "client never reconverged with the restarted server"
    );

    client.close().await;
    restarted.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closed_server_releases_the_port() {
    init_tracing();
    const PORT: u16 = 42418;
    let first_dir = tempfile::tempdir().expect("tempdir");
    let second_dir = tempfile::tempdir().expect("tempdir");

    let first = Node::new(config(PORT, first_dir.path())).await.expect("node");
    assert!(first.is_server());
    first.close().await;

    let second = Node::new(config(PORT, second_dir.path())).await.expect("node");
    assert!(second.is_server(), "port was not released by close()");
    second.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn prefetch_loads_all_collections_upfront() {
    init_tracing();
    const PORT: u16 = 42419;
    let server_dir = tempfile::tempdir().expect("tempdir");
    let client_dir = tempfile::tempdir().expect("tempdir");

    let server = Node::new(config(PORT, server_dir.path())).await.expect("server");
    let server_db = server.namespace("test").expect("namespace");
    server_db.register_type::<User>();
    server_db.set("1", new_user(1)).await;

    let client = Node::new(config(PORT, client_dir.path())).await.expect("client");
    let client_db = client.namespace("test").expect("namespace");
    client_db.register_type::<User>();

    tokio::time::timeout(Duration::from_secs(5), client_db.prefetch())
        .await
        .expect("prefetch completed");

    assert!(client_db.exists("User", "1").await);

    client.close().await;
    server.close().await;
}
