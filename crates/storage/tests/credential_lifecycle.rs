use storage::{CredentialBlob, CredentialStore, FsCredentialStore};
use tempfile::TempDir;

#[tokio::test]
async fn paired_state_follows_directory_presence() {
    let root = TempDir::new().expect("tempdir");
    let dir = root.path().join("auth_info");
    let store = FsCredentialStore::new();

    assert!(!FsCredentialStore::is_paired(&dir).await);

    store
        .save(&dir, &CredentialBlob::new(b"{\"me\":\"6281234567\"}".to_vec()))
        .await
        .expect("save after pairing");
    assert!(FsCredentialStore::is_paired(&dir).await);

    let restored = store.load(&dir).await.expect("load").expect("blob");
    assert_eq!(restored.as_bytes(), b"{\"me\":\"6281234567\"}");

    store.delete(&dir).await.expect("forced logout");
    assert!(!FsCredentialStore::is_paired(&dir).await);
    assert!(store.load(&dir).await.expect("load").is_none());
}

#[tokio::test]
async fn delete_of_never_created_directory_succeeds() {
    let root = TempDir::new().expect("tempdir");
    let store = FsCredentialStore::new();

    store
        .delete(&root.path().join("never-paired"))
        .await
        .expect("delete missing dir");
}
