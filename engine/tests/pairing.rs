//! A real primary and a real secondary talking over loopback.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rsa::RsaPrivateKey;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use signage_engine::asset::{Asset, AssetDuration};
use signage_engine::engine::Engine;
use signage_engine::roles;
use signage_engine::routes::build_router;
use signage_engine::settings::EngineSettings;
use signage_engine::show::SHOW_TARGET;
use signage_engine::signing::Signer;
use signage_engine::store::{Document, Loaded, RemoteSettings, Store};

struct Node {
    engine: Arc<Engine>,
    addr: SocketAddr,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

async fn start(assets: Vec<Asset>, remote: RemoteSettings) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let settings = EngineSettings {
        bind: addr,
        config_path: dir.path().join("signage.json"),
        uploads_dir: dir.path().join("uploaded"),
        local_url: format!("http://{addr}"),
        reconnect_delay: Duration::from_millis(100),
        remote_tls: false,
        ..Default::default()
    };
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let document = Document {
        assets,
        remote,
        ..Default::default()
    };
    let (tx, rx) = mpsc::channel(16);
    let engine = Arc::new(Engine::new(
        settings,
        Store::new(dir.path().join("signage.json")),
        Loaded {
            document,
            first_boot: false,
        },
        Signer::from_key(key).unwrap(),
        tx,
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(roles::supervise(engine.clone(), rx, shutdown.clone()));
    let app = build_router(engine.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let token = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .unwrap();
    });

    Node {
        engine,
        addr,
        shutdown,
        _dir: dir,
    }
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn shown_src(engine: &Engine) -> Option<String> {
    let text = engine.display.last(SHOW_TARGET).await?;
    let v: Value = serde_json::from_str(&text).ok()?;
    v["src"].as_str().map(str::to_string)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn secondary_mirrors_primary_until_unpaired() {
    let asset = Asset::new("https://example.com/menu")
        .with_enabled(true)
        .with_duration(AssetDuration::Infinite);
    let primary = start(vec![asset], RemoteSettings::default()).await;

    let secondary = start(
        vec![],
        RemoteSettings {
            server: Some("127.0.0.1".to_string()),
            port: primary.addr.port(),
            public_key: None,
        },
    )
    .await;
    let secondary_id = secondary.engine.instance_id().await;

    // Pairing: the primary registers the secondary and the secondary caches its key.
    assert!(eventually(|| async { primary.engine.remotes.is_connected(&secondary_id).await }).await);
    assert!(eventually(|| async { secondary.engine.remote_connected() }).await);
    let cached = secondary.engine.remote().await.public_key;
    assert_eq!(cached.as_deref(), Some(primary.engine.signer.public_key_pem()));

    // The primary's current show-event reaches the secondary's renderer, unsigned.
    assert!(
        eventually(|| async {
            shown_src(&secondary.engine).await.as_deref() == Some("https://example.com/menu")
        })
        .await
    );
    let shown = secondary.engine.display.last(SHOW_TARGET).await.unwrap();
    assert!(!shown.contains("__signature__"));

    let registry = primary.engine.remote_settings().await;
    assert!(registry["remote_clients"].to_string().contains(&secondary_id));

    // Unpairing closes the channel; the secondary forgets its primary.
    assert!(primary.engine.unpair(&secondary_id).await);
    assert!(eventually(|| async { !secondary.engine.remote().await.is_secondary() }).await);
    assert!(secondary.engine.remote().await.public_key.is_none());
    assert!(!primary.engine.remotes.is_connected(&secondary_id).await);

    // Back to local rotation: nothing enabled locally, so the fallback shows.
    assert!(
        eventually(|| async {
            shown_src(&secondary.engine)
                .await
                .is_some_and(|src| src.ends_with("/fallback/no-assets"))
        })
        .await
    );

    primary.shutdown.cancel();
    secondary.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn secondary_refuses_to_act_as_primary() {
    let upstream = start(vec![], RemoteSettings::default()).await;
    let middle = start(
        vec![],
        RemoteSettings {
            server: Some("127.0.0.1".to_string()),
            port: upstream.addr.port(),
            public_key: None,
        },
    )
    .await;
    let leaf = start(
        vec![],
        RemoteSettings {
            server: Some("127.0.0.1".to_string()),
            port: middle.addr.port(),
            public_key: None,
        },
    )
    .await;

    assert!(eventually(|| async { middle.engine.remote_connected() }).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    // The leaf keeps retrying but is never registered downstream of a secondary.
    assert!(middle.engine.remotes.connected().await.is_empty());
    let registry = middle.engine.remote_settings().await;
    assert_eq!(registry["remote_clients"], serde_json::json!([]));
    assert!(leaf.engine.display.last(SHOW_TARGET).await.is_none());

    for node in [upstream, middle, leaf] {
        node.shutdown.cancel();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn secondary_recovers_from_stale_cached_key() {
    let asset = Asset::new("https://example.com/board")
        .with_enabled(true)
        .with_duration(AssetDuration::Infinite);
    let primary = start(vec![asset], RemoteSettings::default()).await;

    // A key cached from an earlier run of the primary.
    let old = Signer::from_key(RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap()).unwrap();
    let secondary = start(
        vec![],
        RemoteSettings {
            server: Some("127.0.0.1".to_string()),
            port: primary.addr.port(),
            public_key: Some(old.public_key_pem().to_string()),
        },
    )
    .await;

    assert!(
        eventually(|| async {
            shown_src(&secondary.engine).await.as_deref() == Some("https://example.com/board")
        })
        .await
    );
    let cached = secondary.engine.remote().await.public_key;
    assert_eq!(cached.as_deref(), Some(primary.engine.signer.public_key_pem()));

    primary.shutdown.cancel();
    secondary.shutdown.cancel();
}
