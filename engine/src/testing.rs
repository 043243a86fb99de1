//! Fixtures shared by the unit tests.

use std::sync::Arc;

use rsa::RsaPrivateKey;
use tokio::sync::mpsc;

use crate::asset::Asset;
use crate::engine::Engine;
use crate::roles::RoleCommand;
use crate::settings::EngineSettings;
use crate::signing::Signer;
use crate::store::{Document, Loaded, Store};

/// Small keys keep the tests fast.
pub fn signer() -> Signer {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    Signer::from_key(key).unwrap()
}

/// Engine persisting into `dir`. Keep the receiver alive so role requests
/// do not log as failures.
pub fn engine(
    dir: &tempfile::TempDir,
    assets: Vec<Asset>,
    first_boot: bool,
) -> (Arc<Engine>, mpsc::Receiver<RoleCommand>) {
    let (tx, rx) = mpsc::channel(8);
    let settings = EngineSettings {
        uploads_dir: dir.path().join("uploaded"),
        config_path: dir.path().join("signage.json"),
        ..Default::default()
    };
    let document = Document {
        assets,
        ..Default::default()
    };
    let engine = Engine::new(
        settings,
        Store::new(dir.path().join("signage.json")),
        Loaded {
            document,
            first_boot,
        },
        signer(),
        tx,
    );
    (Arc::new(engine), rx)
}
