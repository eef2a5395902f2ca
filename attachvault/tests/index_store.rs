//! Integration tests for the relational index store (spec §3): transactional
//! File+Part visibility and idempotent URL/health updates.
use attachvault_core::index::models::{NewFile, NewPart, PartHealth};
use attachvault_core::index::IndexStore;

async fn open_store() -> (IndexStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test.sqlite3");
    let store = IndexStore::connect(&db_path).await.unwrap();
    (store, dir)
}

fn sample_parts(n: u32) -> Vec<NewPart> {
    (1..=n)
        .map(|i| NewPart {
            part_number: i,
            message_id: 100,
            channel_id: 1,
            discord_url: format!("https://cdn.example.com/part{i}"),
            size: 1024,
            plain_size: 1008,
            iv: Some(vec![i as u8; 12]),
            auth_tag: Some(vec![i as u8; 16]),
        })
        .collect()
}

#[tokio::test]
async fn insert_and_read_back_roundtrips_parts_in_order() {
    let (store, _dir) = open_store().await;

    let file = NewFile {
        original_name: "movie.mp4".into(),
        size: 3 * 1008,
        mime_type: Some("video/mp4".into()),
        total_parts: 3,
        folder_id: None,
        user_id: None,
        encryption_header: Some("{}".into()),
        media_width: Some(1920),
        media_height: Some(1080),
    };

    let file_id = store.insert_file_with_parts(file, sample_parts(3)).await.unwrap();

    let loaded = store.get_file_by_id(file_id).await.unwrap().unwrap();
    assert_eq!(loaded.total_parts, 3);
    assert_eq!(loaded.parts.len(), 3);
    let numbers: Vec<u32> = loaded.parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(loaded.parts.iter().all(|p| p.health == PartHealth::Unknown));
    assert_eq!(loaded.parts[0].iv.as_deref(), Some(&[1u8; 12][..]));
}

#[tokio::test]
async fn mismatched_part_count_is_rejected() {
    let (store, _dir) = open_store().await;
    let file = NewFile {
        original_name: "bad.bin".into(),
        size: 10,
        mime_type: None,
        total_parts: 5,
        folder_id: None,
        user_id: None,
        encryption_header: None,
        media_width: None,
        media_height: None,
    };
    let err = store.insert_file_with_parts(file, sample_parts(2)).await.unwrap_err();
    assert!(err.to_string().contains("total_parts mismatch"));
}

#[tokio::test]
async fn unknown_file_id_returns_none() {
    let (store, _dir) = open_store().await;
    assert!(store.get_file_by_id(999).await.unwrap().is_none());
}

#[tokio::test]
async fn url_refresh_is_idempotent() {
    use attachvault_core::index::models::PartUrlUpdate;

    let (store, _dir) = open_store().await;
    let file = NewFile {
        original_name: "a.bin".into(),
        size: 1008,
        mime_type: None,
        total_parts: 1,
        folder_id: None,
        user_id: None,
        encryption_header: None,
        media_width: None,
        media_height: None,
    };
    let file_id = store.insert_file_with_parts(file, sample_parts(1)).await.unwrap();
    let part_id = store.get_file_by_id(file_id).await.unwrap().unwrap().parts[0].id;

    let update = PartUrlUpdate { part_id, new_url: "https://cdn.example.com/refreshed".into() };
    store.update_part_urls(&[update.clone()]).await.unwrap();
    store.update_part_urls(&[update]).await.unwrap();

    let loaded = store.get_file_by_id(file_id).await.unwrap().unwrap();
    assert_eq!(loaded.parts[0].discord_url, "https://cdn.example.com/refreshed");
}

#[tokio::test]
async fn health_updates_persist_per_part() {
    let (store, _dir) = open_store().await;
    let file = NewFile {
        original_name: "a.bin".into(),
        size: 2016,
        mime_type: None,
        total_parts: 2,
        folder_id: None,
        user_id: None,
        encryption_header: None,
        media_width: None,
        media_height: None,
    };
    let file_id = store.insert_file_with_parts(file, sample_parts(2)).await.unwrap();
    let parts = store.get_file_by_id(file_id).await.unwrap().unwrap().parts;

    store.update_part_health(parts[0].id, PartHealth::Healthy).await.unwrap();
    store.update_part_health(parts[1].id, PartHealth::Unhealthy).await.unwrap();

    let reloaded = store.get_file_by_id(file_id).await.unwrap().unwrap();
    assert_eq!(reloaded.parts[0].health, PartHealth::Healthy);
    assert_eq!(reloaded.parts[1].health, PartHealth::Unhealthy);
}

#[tokio::test]
async fn delete_file_cascades_to_parts() {
    let (store, _dir) = open_store().await;
    let file = NewFile {
        original_name: "a.bin".into(),
        size: 1008,
        mime_type: None,
        total_parts: 1,
        folder_id: None,
        user_id: None,
        encryption_header: None,
        media_width: None,
        media_height: None,
    };
    let file_id = store.insert_file_with_parts(file, sample_parts(1)).await.unwrap();
    store.delete_file(file_id).await.unwrap();
    assert!(store.get_file_by_id(file_id).await.unwrap().is_none());
}

#[tokio::test]
async fn share_token_resolves_to_its_file_and_cascades_on_delete() {
    let (store, _dir) = open_store().await;
    let file = NewFile {
        original_name: "shared.bin".into(),
        size: 1008,
        mime_type: None,
        total_parts: 1,
        folder_id: None,
        user_id: None,
        encryption_header: None,
        media_width: None,
        media_height: None,
    };
    let file_id = store.insert_file_with_parts(file, sample_parts(1)).await.unwrap();

    assert!(store.resolve_share_token("nope").await.unwrap().is_none());

    store.create_share(file_id, "tok-abc", None).await.unwrap();
    assert_eq!(store.resolve_share_token("tok-abc").await.unwrap(), Some(file_id));

    store.delete_file(file_id).await.unwrap();
    assert!(store.resolve_share_token("tok-abc").await.unwrap().is_none());
}

#[tokio::test]
async fn expired_share_token_does_not_resolve() {
    let (store, _dir) = open_store().await;
    let file = NewFile {
        original_name: "shared.bin".into(),
        size: 1008,
        mime_type: None,
        total_parts: 1,
        folder_id: None,
        user_id: None,
        encryption_header: None,
        media_width: None,
        media_height: None,
    };
    let file_id = store.insert_file_with_parts(file, sample_parts(1)).await.unwrap();
    store.create_share(file_id, "tok-expired", Some("2000-01-01T00:00:00Z")).await.unwrap();
    assert!(store.resolve_share_token("tok-expired").await.unwrap().is_none());
}
