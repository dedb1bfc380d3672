//! Persistence integration tests against RocksDB.
//!
//! Verifies:
//! - Sessions and questions survive a store restart
//! - Concurrent vote toggles converge under optimistic retry
//! - Ended sessions freeze their questions
//! - The update scheduler renders views straight from the store

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora_core::{Author, SessionId, SessionView, UserId};
use agora_sync::scheduler::{PublishError, SchedulerConfig, UpdatePublisher, UpdateScheduler};
use agora_sync::storage::{DocumentStore, RetryPolicy, RocksStore, SessionRepository, StoreConfig};
use async_trait::async_trait;
use tempfile::tempdir;

fn open_repository(path: &std::path::Path) -> (SessionRepository, Arc<RocksStore>) {
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap());
    let repository = SessionRepository::with_policy(store.clone(), RetryPolicy::immediate(32));
    (repository, store)
}

#[tokio::test]
async fn test_session_survives_restart() {
    let dir = tempdir().unwrap();
    let (session_id, question_id) = {
        let (repo, store) = open_repository(dir.path());
        let info = repo
            .create_session("Quarterly review", "Ask anything", &UserId::from("host"))
            .await
            .unwrap();
        let q = repo
            .add_question(&info.id, "Budget?", &Author::new("U2", "Ana"))
            .await
            .unwrap();
        repo.toggle_vote(&q.id, &UserId::from("U1")).await.unwrap();
        store.flush().unwrap();
        (info.id, q.id)
    };

    let (repo, _store) = open_repository(dir.path());
    let session = repo.get_session(&session_id).await.unwrap();
    assert_eq!(session.title, "Quarterly review");
    let question = session.find_question(&question_id).unwrap();
    assert!(question.has_voter(&UserId::from("U1")));
    assert_eq!(question.votes_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_toggles_converge_on_rocksdb() {
    let dir = tempdir().unwrap();
    let (repo, _store) = open_repository(dir.path());
    let repo = Arc::new(repo);
    let info = repo.create_session("AMA", "", &UserId::from("host")).await.unwrap();
    let q = repo
        .add_question(&info.id, "Roadmap?", &Author::new("U9", "Grace"))
        .await
        .unwrap();

    // An even number of toggles per user leaves membership unchanged
    let mut handles = Vec::new();
    for i in 0..16 {
        let repo = repo.clone();
        let qid = q.id.clone();
        let user = UserId::from(if i % 2 == 0 { "U1" } else { "U2" });
        handles.push(tokio::spawn(async move { repo.toggle_vote(&qid, &user).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let session = repo.get_session(&info.id).await.unwrap();
    assert_eq!(session.find_question(&q.id).unwrap().votes_count(), 0);
}

#[tokio::test]
async fn test_ended_session_freezes_questions() {
    let dir = tempdir().unwrap();
    let (repo, store) = open_repository(dir.path());
    let info = repo.create_session("Retro", "", &UserId::from("host")).await.unwrap();
    let q = repo
        .add_question(&info.id, "What went well?", &Author::new("U2", "Ana"))
        .await
        .unwrap();
    repo.end_session(&info.id).await.unwrap();

    let outcome = repo.toggle_vote_outcome(&q.id, &UserId::from("U1")).await.unwrap();
    assert_eq!(outcome.change, None);
    assert!(outcome.question.voters.is_empty());
    assert!(!repo.mark_answered(&q.id).await.unwrap().changed);

    let stored = store.load_question(&q.id).await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert!(repo.list_active_sessions().await.unwrap().is_empty());
}

#[derive(Default)]
struct RecordingPublisher {
    views: Mutex<Vec<SessionView>>,
}

#[async_trait]
impl UpdatePublisher for RecordingPublisher {
    async fn push_session_update(&self, _session_id: &SessionId, view: SessionView) -> Result<(), PublishError> {
        self.views.lock().unwrap().push(view);
        Ok(())
    }
}

#[tokio::test]
async fn test_scheduler_renders_from_store() {
    let dir = tempdir().unwrap();
    let (repo, _store) = open_repository(dir.path());
    let info = repo.create_session("Launch", "", &UserId::from("host")).await.unwrap();
    let author = Author::new("U2", "Ana");
    let first = repo.add_question(&info.id, "Date?", &author).await.unwrap();
    let second = repo.add_question(&info.id, "Price?", &author).await.unwrap();
    repo.toggle_vote(&second.id, &UserId::from("U1")).await.unwrap();
    repo.mark_answered(&first.id).await.unwrap();

    let publisher = Arc::new(RecordingPublisher::default());
    let scheduler = UpdateScheduler::new(
        SchedulerConfig::for_testing(),
        Arc::new(repo.clone()),
        publisher.clone(),
    );
    scheduler.notify_mutated(&info.id);

    for _ in 0..100 {
        if !publisher.views.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let views = publisher.views.lock().unwrap().clone();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].answered_count, 1);
    assert_eq!(views[0].unanswered_count, 1);
    assert_eq!(views[0].top_questions[0].id, second.id);
    assert_eq!(views[0].top_questions[0].votes, 1);
}
