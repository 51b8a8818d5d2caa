//! Integration tests for chunk addressing, file assembly, dedup and deletion
//!
//! Everything runs against an in-memory metadata database with chunk bytes
//! in a temporary directory.

use elohim_chunks::{
    db, Cascade, Chunk, Config, ContentStore, DownloadStatus, File, LinkStatus, Repository,
    StorageError, StorageLink, StoreOptions, UploadStatus,
};
use tempfile::TempDir;

/// Repository with a tiny chunk size so short test blobs span several chunks
async fn create_repo(chunk_size: usize) -> (Repository, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::with_storage_dir(temp_dir.path());
    config.chunk_size_bytes = chunk_size;
    let repo = Repository::open_in_memory(config).await.unwrap();
    (repo, temp_dir)
}

/// Identical bytes always resolve to the same chunk, named by their SHA256
#[tokio::test]
async fn test_content_addressing() {
    let (repo, _temp) = create_repo(4).await;

    let first = Chunk::find_or_create_by_data(&repo, b"test").await.unwrap();
    let second = Chunk::find_or_create_by_data(&repo, b"test").await.unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(
        first.id(),
        Some("9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08")
    );
    assert_eq!(repo.db().stats().unwrap().chunk_count, 1);
    assert_eq!(first.get_data(&repo).await.unwrap(), b"test");
    assert_eq!(first.size(&repo).await.unwrap(), 4);
}

/// Bytes that do not hash to an assigned id are refused before reaching disk
#[tokio::test]
async fn test_integrity_mismatch_leaves_store_untouched() {
    let (repo, _temp) = create_repo(4).await;

    let expected = ContentStore::compute_hash(b"good");
    let mut chunk = Chunk::build_for_id(&expected, 1, 1_000, false);
    chunk.create(&repo).await.unwrap();

    let err = chunk.set_data(&repo, b"evil").await.unwrap_err();
    match err {
        StorageError::IntegrityMismatch { expected: e, actual } => {
            assert_eq!(e, expected);
            assert_eq!(actual, ContentStore::compute_hash(b"evil"));
        }
        other => panic!("expected IntegrityMismatch, got {:?}", other),
    }

    assert!(!repo.content().exists(&expected).await);
    assert!(!repo.content().exists(&ContentStore::compute_hash(b"evil")).await);

    let stored = Chunk::find_or_fail(&repo, &expected).await.unwrap();
    assert_eq!(stored.download_status, DownloadStatus::Created);

    chunk.set_data(&repo, b"good").await.unwrap();
    assert_eq!(chunk.download_status, DownloadStatus::Downloaded);
}

/// Two files sharing a chunk store it once; deleting one keeps what the other needs
#[tokio::test]
async fn test_dedup_and_delete() {
    let (repo, _temp) = create_repo(4).await;

    let a = File::store(&repo, b"aaaabbbb", StoreOptions::default()).await.unwrap();
    let b = File::store(&repo, b"aaaacccc", StoreOptions::default()).await.unwrap();
    assert_ne!(a.id, b.id);

    let shared = ContentStore::compute_hash(b"aaaa");
    let only_a = ContentStore::compute_hash(b"bbbb");
    let only_b = ContentStore::compute_hash(b"cccc");

    let stats = repo.stats().await.unwrap();
    assert_eq!(stats.metadata.file_count, 2);
    assert_eq!(stats.metadata.chunk_count, 3);
    assert_eq!(stats.content.total_chunks, 3);

    let shared_chunk = Chunk::find_or_fail(&repo, &shared).await.unwrap();
    assert_eq!(shared_chunk.owning_files(&repo).await.unwrap().len(), 2);
    let references = |id: &str| {
        repo.db()
            .with_conn(|conn| db::chunks::reference_count(conn, id))
            .unwrap()
    };
    assert_eq!(references(&shared), 2);
    assert_eq!(references(&only_a), 1);

    StorageLink::record(&repo, &only_a, "provider-1", LinkStatus::Signed, i64::MAX)
        .await
        .unwrap();
    StorageLink::record(&repo, &shared, "provider-1", LinkStatus::Signed, i64::MAX)
        .await
        .unwrap();

    let a_id = a.id.clone();
    let removed = a.delete(&repo).await.unwrap();
    assert_eq!(removed, vec![only_a.clone()]);

    assert!(File::find(&repo, &a_id).await.unwrap().is_none());
    assert_eq!(references(&shared), 1);
    assert_eq!(references(&only_a), 0);
    assert!(repo.content().exists(&shared).await);
    assert!(!repo.content().exists(&only_a).await);
    assert!(Chunk::find(&repo, &only_a).await.unwrap().is_none());
    assert!(StorageLink::all_for_chunk(&repo, &only_a).await.unwrap().is_empty());
    assert_eq!(StorageLink::all_for_chunk(&repo, &shared).await.unwrap().len(), 1);

    assert_eq!(b.reconstruct(&repo).await.unwrap(), b"aaaacccc");

    let mut removed = b.delete(&repo).await.unwrap();
    removed.sort();
    let mut expected = vec![shared, only_b];
    expected.sort();
    assert_eq!(removed, expected);

    let stats = repo.stats().await.unwrap();
    assert_eq!(stats.metadata.file_count, 0);
    assert_eq!(stats.metadata.chunk_count, 0);
    assert_eq!(stats.metadata.link_count, 0);
    assert_eq!(stats.content.total_chunks, 0);
}

/// Deleting a file that does not exist is reported, not ignored
#[tokio::test]
async fn test_delete_missing_file() {
    let (repo, _temp) = create_repo(4).await;

    let file = File::build("ghost", None, 0, 1, 1_000, false);
    let err = file.delete(&repo).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

/// A shared chunk carries the strictest policy of the files referencing it
#[tokio::test]
async fn test_shared_chunk_takes_strictest_policy() {
    let (repo, _temp) = create_repo(4).await;
    let now = chrono::Utc::now().timestamp_millis();

    File::store(
        &repo,
        b"aaaabbbb",
        StoreOptions {
            redundancy: Some(2),
            expires: Some(now + 10_000),
            ..StoreOptions::default()
        },
    )
    .await
    .unwrap();
    let mut strict = File::store(
        &repo,
        b"aaaacccc",
        StoreOptions {
            redundancy: Some(4),
            expires: Some(now + 20_000),
            autorenew: true,
            ..StoreOptions::default()
        },
    )
    .await
    .unwrap();

    let shared = Chunk::find_or_fail(&repo, &ContentStore::compute_hash(b"aaaa")).await.unwrap();
    assert_eq!(shared.redundancy, 4);
    assert_eq!(shared.expires, now + 20_000);
    assert!(shared.autorenew);

    let only_first = Chunk::find_or_fail(&repo, &ContentStore::compute_hash(b"bbbb")).await.unwrap();
    assert_eq!(only_first.redundancy, 2);
    assert!(!only_first.autorenew);

    // Relaxing the strict file hands the shared chunk back to the other file's policy
    strict.update_policy(&repo, 1, now + 5_000, false).await.unwrap();
    let shared = Chunk::find_or_fail(&repo, &ContentStore::compute_hash(b"aaaa")).await.unwrap();
    assert_eq!(shared.redundancy, 2);
    assert_eq!(shared.expires, now + 10_000);
    assert!(!shared.autorenew);
}

/// Listing only reports files that are uploaded or fully local
#[tokio::test]
async fn test_list_files_and_chunks() {
    let (repo, _temp) = create_repo(4).await;

    let stored = File::store(
        &repo,
        b"listed!!",
        StoreOptions {
            original_path: Some("docs/listed.txt".into()),
            ..StoreOptions::default()
        },
    )
    .await
    .unwrap();

    let remote = File::build("remote-only", None, 4, 1, 1_000, false);
    remote.create(&repo).await.unwrap();
    let placeholder = Chunk::build_for_id(&ContentStore::compute_hash(b"zzzz"), 1, 1_000, false);
    placeholder.create(&repo).await.unwrap();
    remote.add_chunk(&repo, &placeholder, 0).await.unwrap();

    let files = repo.list_files().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].id, stored.id);
    assert_eq!(files[0].chunk_count, 2);
    assert_eq!(files[0].original_path.as_deref(), Some("docs/listed.txt"));

    // Nothing has live copies yet
    assert!(repo.list_chunks().await.unwrap().is_empty());
}

/// Missing bytes surface as IncompleteFile with every missing chunk listed
#[tokio::test]
async fn test_incomplete_file_after_losing_bytes() {
    let (repo, _temp) = create_repo(4).await;

    let mut file = File::store(&repo, b"0000111122223333", StoreOptions::default()).await.unwrap();
    let ids = file.chunk_ids(&repo).await.unwrap();
    repo.content().delete(&ids[0]).await.unwrap();
    repo.content().delete(&ids[3]).await.unwrap();

    let err = file.reconstruct(&repo).await.unwrap_err();
    assert!(err.is_recoverable());
    match err {
        StorageError::IncompleteFile { missing, .. } => {
            assert_eq!(missing, vec![ids[0].clone(), ids[3].clone()]);
        }
        other => panic!("expected IncompleteFile, got {:?}", other),
    }

    // Restoring the bytes makes it whole again
    let mut lost = Chunk::find_or_fail(&repo, &ids[0]).await.unwrap();
    lost.set_data(&repo, b"0000").await.unwrap();
    let mut lost = Chunk::find_or_fail(&repo, &ids[3]).await.unwrap();
    lost.set_data(&repo, b"3333").await.unwrap();

    assert_eq!(
        file.reconsider_download_status(&repo, Cascade::None).await.unwrap(),
        DownloadStatus::Downloaded
    );
    assert_eq!(file.reconstruct(&repo).await.unwrap(), b"0000111122223333");
    assert_eq!(file.upload_status, UploadStatus::Uploading);
}
