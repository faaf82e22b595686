use chrono::Utc;
use shared::domain::{ChannelId, SequencePosition, UserId};
use storage::{SessionStore, StateStore, Storage, StoredSession};

#[tokio::test]
async fn positions_and_session_survive_reopen() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("bot.session.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    {
        let storage = Storage::new(&database_url).await.expect("db");
        let now = Utc::now();
        assert!(storage
            .compare_and_set(
                ChannelId::COMMON,
                None,
                SequencePosition::new(ChannelId::COMMON, 120, now)
            )
            .await
            .expect("seed common"));
        assert!(storage
            .compare_and_set(
                ChannelId(77),
                None,
                SequencePosition::new(ChannelId(77), 8, now)
            )
            .await
            .expect("seed channel"));
        storage
            .save_session(&StoredSession {
                user_id: UserId(5),
                is_bot: true,
                username: None,
                access_token: Some("persisted".into()),
                updated_at: now,
            })
            .await
            .expect("save session");
    }

    let reopened = Storage::new(&database_url).await.expect("reopen");
    let common = reopened
        .get(ChannelId::COMMON)
        .await
        .expect("get")
        .expect("common position");
    assert_eq!(common.pts, 120);
    assert_eq!(reopened.positions().await.expect("positions").len(), 2);

    let session = reopened
        .load_session()
        .await
        .expect("load")
        .expect("session");
    assert_eq!(session.user_id, UserId(5));
    assert!(session.is_bot);
    assert_eq!(session.access_token.as_deref(), Some("persisted"));
}
