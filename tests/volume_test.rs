//! Volume directory management: root confinement and content lifecycle.

use berth::archive::ArchiveManager;
use berth::{BerthError, VolumeManager};
use std::fs;

#[tokio::test]
async fn dot_identifier_cannot_reach_the_roots() {
    let root = tempfile::tempdir().unwrap();
    let volumes = VolumeManager::new(root.path().join("volumes")).unwrap();
    let archives = ArchiveManager::new(root.path().join("archives"), 1024, 4).unwrap();

    let app1 = volumes.create("app1").await.unwrap();
    let app2 = volumes.create("app2").await.unwrap();
    fs::write(app1.join("a.txt"), b"one").unwrap();
    fs::write(app2.join("b.txt"), b"two").unwrap();

    // "." would resolve to the root itself; a remove keyed on it would
    // take every instance's data with it.
    for result in [
        volumes.remove(".").await,
        volumes.create(".").await.map(|_| ()),
        volumes.clear(".").await.map(|_| ()),
        archives.purge(".").await.map(|_| ()),
    ] {
        assert!(matches!(result.unwrap_err(), BerthError::Validation(_)));
    }

    assert_eq!(fs::read(app1.join("a.txt")).unwrap(), b"one");
    assert_eq!(fs::read(app2.join("b.txt")).unwrap(), b"two");
}

#[tokio::test]
async fn clear_empties_but_keeps_the_directory() {
    let root = tempfile::tempdir().unwrap();
    let volumes = VolumeManager::new(root.path().join("volumes")).unwrap();

    let dir = volumes.create("app1").await.unwrap();
    fs::write(dir.join("a.txt"), b"data").unwrap();
    fs::create_dir_all(dir.join("world")).unwrap();
    fs::write(dir.join("world").join("level.dat"), b"chunks").unwrap();

    let cleared = volumes.clear("app1").await.unwrap();
    assert_eq!(cleared, dir);
    assert!(dir.is_dir());
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
}

#[tokio::test]
async fn clear_recreates_a_missing_volume() {
    let root = tempfile::tempdir().unwrap();
    let volumes = VolumeManager::new(root.path().join("volumes")).unwrap();

    let dir = volumes.clear("fresh").await.unwrap();
    assert!(dir.is_dir());
}

#[tokio::test]
async fn tree_size_sums_nested_files() {
    let root = tempfile::tempdir().unwrap();
    let volumes = VolumeManager::new(root.path().join("volumes")).unwrap();

    let dir = volumes.create("app1").await.unwrap();
    fs::write(dir.join("a.bin"), vec![0u8; 100]).unwrap();
    fs::create_dir_all(dir.join("sub")).unwrap();
    fs::write(dir.join("sub").join("b.bin"), vec![0u8; 28]).unwrap();

    assert_eq!(volumes.tree_size("app1").await.unwrap(), 128);
}
