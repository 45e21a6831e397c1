use std::sync::Arc;
use std::time::Duration;

use snip_core::{Backend, DeletionBatch, OwnershipStore};
use snip_generator::CodeGenerator;
use snip_storage::{
    DeletionPipeline, DeletionSettings, PostgresBackend, ShortCode, Stats, Storage,
    StorageError, StorageSettings, UserId,
};
use snip_test_infra::postgres::{PostgresConfig, PostgresServer};
use sqlx::postgres::PgPoolOptions;

const BASE_URL: &str = "http://localhost:8080";

struct Fixture {
    _postgres: PostgresServer,
    backend: PostgresBackend,
}

impl Fixture {
    async fn start() -> Self {
        let postgres = PostgresServer::new(PostgresConfig::builder().build())
            .await
            .expect("start postgres");
        let url = postgres.database_url().await.expect("postgres url");
        let pool = connect_with_retry(&url).await;

        let backend = PostgresBackend::new(pool, BASE_URL, Arc::new(CodeGenerator::default()));
        backend.ensure_schema().await.expect("create schema");

        Self {
            _postgres: postgres,
            backend,
        }
    }

    async fn user(&self) -> UserId {
        self.backend.next_user_id().await.expect("mint user")
    }
}

async fn connect_with_retry(url: &str) -> sqlx::PgPool {
    let mut last_error = None;

    for _ in 0..20 {
        match PgPoolOptions::new().max_connections(5).connect(url).await {
            Ok(pool) => return pool,
            Err(err) => {
                last_error = Some(err);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    panic!("failed to connect postgres: {last_error:?}");
}

#[tokio::test]
async fn create_is_idempotent_per_url() {
    let fixture = Fixture::start().await;
    let alice = fixture.user().await;
    let bob = fixture.user().await;

    let code = fixture.backend.create("http://ya.ru", alice).await.unwrap();

    let err = fixture.backend.create("http://ya.ru", alice).await.unwrap_err();
    assert!(matches!(err, StorageError::AlreadyExists(ref existing) if *existing == code));

    let for_bob = fixture.backend.create("http://ya.ru", bob).await.unwrap();
    assert_eq!(for_bob, code);

    assert_eq!(fixture.backend.resolve(&code, None).await.unwrap(), "http://ya.ru");
}

#[tokio::test]
async fn schema_bootstrap_is_repeatable() {
    let fixture = Fixture::start().await;

    fixture.backend.ensure_schema().await.unwrap();
    fixture.backend.ensure_schema().await.unwrap();
}

#[tokio::test]
async fn resolve_unknown_code_is_not_found() {
    let fixture = Fixture::start().await;

    let err = fixture
        .backend
        .resolve(&ShortCode::new("AAAAAAAA").unwrap(), None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn create_for_unknown_user_is_not_found() {
    let fixture = Fixture::start().await;

    let err = fixture
        .backend
        .create("https://a.example", UserId(4242))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn owned_links_are_ordered_and_exclude_deleted() {
    let fixture = Fixture::start().await;
    let user = fixture.user().await;

    assert!(fixture.backend.owned_links(user).await.unwrap_err().is_not_found());

    let a = fixture.backend.create("https://a.example", user).await.unwrap();
    let b = fixture.backend.create("https://b.example", user).await.unwrap();

    let links = fixture.backend.owned_links(user).await.unwrap();
    let codes: Vec<_> = links.iter().map(|l| l.code.clone()).collect();
    assert_eq!(codes, vec![a.clone(), b.clone()]);
    assert_eq!(links[0].original_url, "https://a.example");

    let link = fixture
        .backend
        .resolve_owned_link_id(user, a.as_str())
        .await
        .unwrap()
        .unwrap();
    let mut batch = fixture.backend.begin_deletion().await.unwrap();
    batch.mark_deleted(user, link).await.unwrap();
    batch.commit().await.unwrap();

    let links = fixture.backend.owned_links(user).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].code, b);
}

#[tokio::test]
async fn rolled_back_batch_changes_nothing() {
    let fixture = Fixture::start().await;
    let user = fixture.user().await;
    let code = fixture.backend.create("https://a.example", user).await.unwrap();

    let link = fixture
        .backend
        .resolve_owned_link_id(user, code.as_str())
        .await
        .unwrap()
        .unwrap();
    let mut batch = fixture.backend.begin_deletion().await.unwrap();
    batch.mark_deleted(user, link).await.unwrap();
    batch.rollback().await.unwrap();

    assert!(fixture.backend.resolve(&code, Some(user)).await.is_ok());
}

#[tokio::test]
async fn resolve_owned_link_id_filters_foreign_and_malformed_codes() {
    let fixture = Fixture::start().await;
    let alice = fixture.user().await;
    let bob = fixture.user().await;
    let code = fixture.backend.create("https://a.example", alice).await.unwrap();

    let backend = &fixture.backend;
    assert!(backend.resolve_owned_link_id(alice, code.as_str()).await.unwrap().is_some());
    assert!(backend.resolve_owned_link_id(bob, code.as_str()).await.unwrap().is_none());
    assert!(backend.resolve_owned_link_id(UserId(0), code.as_str()).await.unwrap().is_none());
    assert!(backend.resolve_owned_link_id(alice, "short").await.unwrap().is_none());
}

#[tokio::test]
async fn pipeline_deletes_for_one_owner_only() {
    let fixture = Fixture::start().await;
    let alice = fixture.user().await;
    let bob = fixture.user().await;

    let shared = fixture.backend.create("https://shared.example", alice).await.unwrap();
    fixture.backend.create("https://shared.example", bob).await.unwrap();
    let own = fixture.backend.create("https://own.example", alice).await.unwrap();
    let foreign = fixture.backend.create("https://foreign.example", bob).await.unwrap();

    let pipeline = DeletionPipeline::new(
        Arc::new(fixture.backend.clone()),
        DeletionSettings::builder().max_concurrency(2).build(),
    );
    let report = pipeline
        .run(alice, vec![shared.to_string(), own.to_string(), foreign.to_string()])
        .await
        .unwrap();

    assert_eq!(report.deleted, 2);
    assert_eq!(report.skipped, vec![foreign.to_string()]);

    let backend = &fixture.backend;
    assert!(backend.resolve(&shared, Some(alice)).await.unwrap_err().is_deleted());
    assert!(backend.resolve(&own, Some(alice)).await.unwrap_err().is_deleted());
    assert_eq!(
        backend.resolve(&shared, Some(bob)).await.unwrap(),
        "https://shared.example"
    );
    assert_eq!(backend.resolve(&shared, None).await.unwrap(), "https://shared.example");
    assert!(backend.resolve(&foreign, Some(bob)).await.is_ok());
}

#[tokio::test]
async fn stats_and_ping() {
    let fixture = Fixture::start().await;
    let user = fixture.user().await;
    fixture.user().await;
    fixture.backend.create("https://a.example", user).await.unwrap();

    assert!(fixture.backend.ping().await);
    assert_eq!(
        fixture.backend.stats().await.unwrap(),
        Stats { users: 2, urls: 1 }
    );
}

#[tokio::test]
async fn storage_opens_on_postgres() {
    let postgres = PostgresServer::new(PostgresConfig::builder().build())
        .await
        .expect("start postgres");
    let url = postgres.database_url().await.expect("postgres url");
    connect_with_retry(&url).await;

    let storage = Storage::open(StorageSettings::builder().database_dsn(Some(url)).build()).await;
    assert!(storage.ping_db().await);

    let user = storage.get_new_user_id().await.unwrap();
    let code = storage.create_short_url("http://ya.ru", user).await.unwrap();
    assert_eq!(storage.get_url(code.as_str(), Some(user)).await.unwrap(), "http://ya.ru");

    // Snapshots only apply to the memory backend.
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(storage.save_to_file(dir.path().join("s.json")).await.unwrap(), 0);
}

#[tokio::test]
async fn links_are_keyed_on_the_base_url() {
    let fixture = Fixture::start().await;
    let user = fixture.user().await;
    let code = fixture.backend.create("https://a.example", user).await.unwrap();

    let stored: String = sqlx::query_scalar("SELECT InnerLink FROM links")
        .fetch_one(fixture.backend.pool())
        .await
        .unwrap();
    assert_eq!(stored, format!("{BASE_URL}/{code}"));

    let moved = PostgresBackend::new(
        fixture.backend.pool().clone(),
        "https://elsewhere.example",
        Arc::new(CodeGenerator::default()),
    );
    assert!(moved.resolve(&code, None).await.unwrap_err().is_not_found());
}
