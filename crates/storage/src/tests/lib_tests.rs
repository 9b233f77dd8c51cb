use super::*;

use tempfile::TempDir;

#[tokio::test]
async fn load_returns_none_for_unpaired_directory() {
    let root = TempDir::new().expect("tempdir");
    let store = FsCredentialStore::new();

    let loaded = store
        .load(&root.path().join("session"))
        .await
        .expect("load");
    assert!(loaded.is_none());
}

#[tokio::test]
async fn save_creates_missing_directory_and_replaces_previous_blob() {
    let root = TempDir::new().expect("tempdir");
    let dir = root.path().join("nested").join("session");
    let store = FsCredentialStore::new();

    store
        .save(&dir, &CredentialBlob::new(b"first".to_vec()))
        .await
        .expect("save first");
    store
        .save(&dir, &CredentialBlob::new(b"second".to_vec()))
        .await
        .expect("save second");

    let loaded = store.load(&dir).await.expect("load").expect("blob");
    assert_eq!(loaded.as_bytes(), b"second");
    assert!(!dir.join(CREDENTIALS_TMP_FILE).exists());
    assert!(FsCredentialStore::is_paired(&dir).await);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let root = TempDir::new().expect("tempdir");
    let dir = root.path().join("session");
    let store = FsCredentialStore::new();
    store
        .save(&dir, &CredentialBlob::new(b"creds".to_vec()))
        .await
        .expect("save");

    store.delete(&dir).await.expect("first delete");
    store.delete(&dir).await.expect("second delete");

    assert!(!dir.exists());
    assert!(!FsCredentialStore::is_paired(&dir).await);
    assert!(store.load(&dir).await.expect("load").is_none());
}

#[test]
fn debug_output_does_not_leak_credential_bytes() {
    let blob = CredentialBlob::new(b"super-secret".to_vec());
    let rendered = format!("{blob:?}");
    assert_eq!(rendered, "CredentialBlob(12 bytes)");
}
