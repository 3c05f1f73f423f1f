//! Archive manager: creation, size cap enforcement, listing, deletion.

use berth::archive::ArchiveManager;
use berth::BerthError;
use std::fs;

fn manager(root: &std::path::Path, cap: u64) -> ArchiveManager {
    ArchiveManager::new(root.join("archives"), cap, 4).unwrap()
}

#[tokio::test]
async fn create_list_download_delete_cycle() {
    let root = tempfile::tempdir().unwrap();
    let volume = root.path().join("volumes").join("v1");
    fs::create_dir_all(&volume).unwrap();
    fs::write(volume.join("a.txt"), b"0123456789").unwrap();

    let archives = manager(root.path(), 1024 * 1024);

    let created = archives.create("v1", &volume).await.unwrap();
    assert!(created.name.starts_with("v1-"));
    assert!(created.name.ends_with(".zip"));
    assert!(created.size > 0);

    let listed = archives.list("v1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, created.name);
    assert_eq!(listed[0].size, created.size);
    assert!(!listed[0].size_human.is_empty());

    let (_file, length) = archives.open_for_download("v1", &created.name).await.unwrap();
    assert_eq!(length, created.size);

    archives.delete("v1", &created.name).await.unwrap();
    assert!(archives.list("v1").await.unwrap().is_empty());
}

#[tokio::test]
async fn listing_is_newest_first() {
    let root = tempfile::tempdir().unwrap();
    let volume = root.path().join("volumes").join("v1");
    fs::create_dir_all(&volume).unwrap();
    fs::write(volume.join("a.txt"), b"data").unwrap();

    let archives = manager(root.path(), 1024 * 1024);
    let first = archives.create("v1", &volume).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let second = archives.create("v1", &volume).await.unwrap();

    let listed = archives.list("v1").await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].name, second.name);
    assert_eq!(listed[1].name, first.name);
}

#[tokio::test]
async fn missing_subdirectory_lists_empty() {
    let root = tempfile::tempdir().unwrap();
    let archives = manager(root.path(), 1024 * 1024);
    assert!(archives.list("never-archived").await.unwrap().is_empty());
}

#[tokio::test]
async fn size_cap_aborts_and_removes_partial() {
    let root = tempfile::tempdir().unwrap();
    let volume = root.path().join("volumes").join("big");
    fs::create_dir_all(&volume).unwrap();
    fs::write(volume.join("blob.bin"), vec![7u8; 64 * 1024]).unwrap();

    // Cap below even the zip header size: the write must abort.
    let archives = manager(root.path(), 10);
    let err = archives.create("big", &volume).await.unwrap_err();
    match err {
        // The reported size is real, either the stat total from the
        // pre-compression check or the bytes actually written.
        BerthError::SizeLimitExceeded { limit, reached } => {
            assert_eq!(limit, 10);
            assert!(reached > limit);
            assert!(reached <= 64 * 1024);
        }
        other => panic!("expected SizeLimitExceeded, got {}", other),
    }

    // No partial file left behind, and nothing shows up in listings.
    assert!(archives.list("big").await.unwrap().is_empty());
    let dir = root.path().join("archives").join("big");
    if dir.exists() {
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }
}

#[tokio::test]
async fn delete_refuses_missing_archive() {
    let root = tempfile::tempdir().unwrap();
    let archives = manager(root.path(), 1024);
    let err = archives.delete("v1", "nope.zip").await.unwrap_err();
    assert!(matches!(err, BerthError::NotFound(_)));
}

#[tokio::test]
async fn traversal_is_rejected_on_both_segments() {
    let root = tempfile::tempdir().unwrap();
    let archives = manager(root.path(), 1024);

    assert!(matches!(
        archives.list("../elsewhere").await.unwrap_err(),
        BerthError::Validation(_)
    ));
    assert!(matches!(
        archives.delete("v1", "..").await.unwrap_err(),
        BerthError::Validation(_)
    ));
}

#[tokio::test]
async fn purge_removes_every_archive() {
    let root = tempfile::tempdir().unwrap();
    let volume = root.path().join("volumes").join("v1");
    fs::create_dir_all(&volume).unwrap();
    fs::write(volume.join("a.txt"), b"data").unwrap();

    let archives = manager(root.path(), 1024 * 1024);
    archives.create("v1", &volume).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    archives.create("v1", &volume).await.unwrap();

    let purged = archives.purge("v1").await.unwrap();
    assert_eq!(purged, 2);
    assert!(archives.list("v1").await.unwrap().is_empty());
}
