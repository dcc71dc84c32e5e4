//! Artifact storage bindings.

use castflow::storage::{ArtifactStore, FsArtifactStore, MemoryArtifactStore, StorageError};

#[tokio::test]
async fn memory_store_round_trips() {
    let store = MemoryArtifactStore::new();
    let artifact = store.put("audio/intro.mp3", b"riff").await.unwrap();
    assert_eq!(artifact.key, "audio/intro.mp3");
    assert_eq!(artifact.bytes, 4);
    assert_eq!(store.get("audio/intro.mp3").await.unwrap(), b"riff");
    assert!(matches!(
        store.get("missing").await,
        Err(StorageError::NotFound { .. })
    ));
}

#[tokio::test]
async fn fs_store_creates_nested_directories() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsArtifactStore::new(dir.path());

    let artifact = store
        .put("content/audio/ep_42.mp3", b"mock episode")
        .await
        .unwrap();
    assert_eq!(artifact.bytes, 12);
    assert!(dir.path().join("content/audio/ep_42.mp3").exists());
    assert_eq!(
        store.get("content/audio/ep_42.mp3").await.unwrap(),
        b"mock episode"
    );
    assert!(matches!(
        store.get("content/missing.mp3").await,
        Err(StorageError::NotFound { .. })
    ));
}
