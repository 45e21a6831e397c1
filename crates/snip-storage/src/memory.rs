use crate::snapshot::SnapshotEntry;
use async_trait::async_trait;
use jiff::Timestamp;
use parking_lot::RwLock;
use snip_core::{
    Backend, BackendKind, DeletionBatch, LinkId, OwnedLink, OwnershipStore, Result, ShortCode,
    Stats, StorageError, UserId, UserRecord,
};
use snip_generator::CodeGenerator;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct LinkRow {
    code: ShortCode,
    original_url: String,
}

/// State of one `(user, link)` ownership edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Ownership {
    deleted: bool,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    links: BTreeMap<LinkId, LinkRow>,
    by_original: HashMap<String, LinkId>,
    by_code: HashMap<ShortCode, LinkId>,
    /// Keyed by `(user, link)` so one user's links form a contiguous range.
    ownership: BTreeMap<(UserId, LinkId), Ownership>,
    users: BTreeMap<UserId, Timestamp>,
    last_link_id: i32,
}

impl Tables {
    fn link(&self, id: LinkId) -> Result<&LinkRow> {
        self.links
            .get(&id)
            .ok_or_else(|| StorageError::InvalidData(format!("dangling link id {id}")))
    }

    fn insert_link(&mut self, code: ShortCode, original_url: String) -> LinkId {
        self.last_link_id += 1;
        let id = LinkId(self.last_link_id);
        self.by_original.insert(original_url.clone(), id);
        self.by_code.insert(code.clone(), id);
        self.links.insert(id, LinkRow { code, original_url });
        id
    }

    /// Adds the ownership edge, returning `false` if it was already there.
    fn add_owner(&mut self, user: UserId, link: LinkId) -> bool {
        self.users.entry(user).or_insert_with(Timestamp::now);
        if self.ownership.contains_key(&(user, link)) {
            return false;
        }
        self.ownership.insert((user, link), Ownership::default());
        true
    }

    fn owned_by(&self, user: UserId) -> impl Iterator<Item = (LinkId, Ownership)> + '_ {
        self.ownership
            .range((user, LinkId(i32::MIN))..=(user, LinkId(i32::MAX)))
            .map(|(&(_, link), &ownership)| (link, ownership))
    }

    fn restore_link(&mut self, code: ShortCode, original_url: String) -> Result<LinkId> {
        match (
            self.by_original.get(&original_url).copied(),
            self.by_code.get(&code).copied(),
        ) {
            (Some(a), Some(b)) if a == b => Ok(a),
            (None, None) => Ok(self.insert_link(code, original_url)),
            _ => Err(StorageError::InvalidData(format!(
                "snapshot entry {code} -> {original_url} conflicts with an existing link"
            ))),
        }
    }
}

/// In-memory backend used when no database is configured or reachable.
///
/// All tables live behind a single lock, so every operation observes and
/// leaves behind a consistent view of links and ownership. Cloning is cheap
/// and clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    tables: Arc<RwLock<Tables>>,
    generator: Arc<CodeGenerator>,
}

impl InMemoryBackend {
    pub fn new(generator: Arc<CodeGenerator>) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            generator,
        }
    }

    /// Returns the users known to this backend, oldest id first.
    pub fn users(&self) -> Vec<UserRecord> {
        self.tables
            .read()
            .users
            .iter()
            .map(|(&id, &created_at)| UserRecord { id, created_at })
            .collect()
    }

    pub(crate) fn export_entries(&self) -> Vec<SnapshotEntry> {
        let tables = self.tables.read();

        let mut owners: HashMap<LinkId, (Vec<UserId>, Vec<UserId>)> = HashMap::new();
        for (&(user, link), ownership) in &tables.ownership {
            let (all, deleted) = owners.entry(link).or_default();
            all.push(user);
            if ownership.deleted {
                deleted.push(user);
            }
        }

        tables
            .links
            .iter()
            .map(|(id, row)| {
                let (user_id, deleted_user_id) = owners.remove(id).unwrap_or_default();
                SnapshotEntry {
                    short_url: row.code.to_string(),
                    original_url: row.original_url.clone(),
                    user_id,
                    deleted_user_id,
                }
            })
            .collect()
    }

    /// Merges snapshot entries into the tables.
    ///
    /// Either every entry is applied or, on the first conflicting or
    /// malformed entry, none is.
    pub(crate) fn import_entries(&self, entries: Vec<SnapshotEntry>) -> Result<usize> {
        let mut tables = self.tables.write();
        let mut staged = tables.clone();

        for entry in &entries {
            let code = ShortCode::from_short_url(&entry.short_url)?;
            if let Some(user) = entry
                .user_id
                .iter()
                .chain(&entry.deleted_user_id)
                .find(|user| !user.is_valid())
            {
                return Err(StorageError::InvalidData(format!(
                    "snapshot entry {code} has invalid user id {user}"
                )));
            }
            let link = staged.restore_link(code, entry.original_url.clone())?;
            for &user in &entry.user_id {
                staged.add_owner(user, link);
            }
            for &user in &entry.deleted_user_id {
                staged.add_owner(user, link);
                if let Some(ownership) = staged.ownership.get_mut(&(user, link)) {
                    ownership.deleted = true;
                }
            }
        }

        *tables = staged;
        Ok(entries.len())
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn create(&self, original_url: &str, user: UserId) -> Result<ShortCode> {
        let mut tables = self.tables.write();

        if let Some(&link) = tables.by_original.get(original_url) {
            let code = tables.link(link)?.code.clone();
            if !tables.add_owner(user, link) {
                return Err(StorageError::AlreadyExists(code));
            }
            debug!(user = %user, code = %code, "added owner to existing link");
            return Ok(code);
        }

        let code = self
            .generator
            .new_code(|candidate| tables.by_code.contains_key(candidate))?;
        let link = tables.insert_link(code.clone(), original_url.to_owned());
        tables.add_owner(user, link);
        debug!(user = %user, code = %code, original_url, "created link");

        Ok(code)
    }

    async fn resolve(&self, code: &ShortCode, user: Option<UserId>) -> Result<String> {
        let tables = self.tables.read();

        let link = *tables
            .by_code
            .get(code)
            .ok_or_else(|| StorageError::NotFound(code.to_string()))?;

        if let Some(user) = user {
            if tables
                .ownership
                .get(&(user, link))
                .is_some_and(|ownership| ownership.deleted)
            {
                return Err(StorageError::Deleted(code.clone()));
            }
        }

        Ok(tables.link(link)?.original_url.clone())
    }

    async fn owned_links(&self, user: UserId) -> Result<Vec<OwnedLink>> {
        let tables = self.tables.read();

        let links = tables
            .owned_by(user)
            .filter(|(_, ownership)| !ownership.deleted)
            .map(|(link, _)| {
                tables.link(link).map(|row| OwnedLink {
                    code: row.code.clone(),
                    original_url: row.original_url.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if links.is_empty() {
            return Err(StorageError::NotFound(format!("links of user {user}")));
        }
        Ok(links)
    }

    async fn next_user_id(&self) -> Result<UserId> {
        let mut tables = self.tables.write();

        let id = match tables.users.keys().next_back() {
            Some(last) => last.next().ok_or_else(|| {
                StorageError::InvalidData(format!("no user id left after {last}"))
            })?,
            None => UserId::FIRST,
        };
        tables.users.insert(id, Timestamp::now());

        Ok(id)
    }

    /// There is no database behind this backend, so it never reports one as
    /// reachable.
    async fn ping(&self) -> bool {
        false
    }

    async fn stats(&self) -> Result<Stats> {
        let tables = self.tables.read();
        Ok(Stats {
            users: tables.users.len() as u64,
            urls: tables.links.len() as u64,
        })
    }
}

#[async_trait]
impl OwnershipStore for InMemoryBackend {
    async fn resolve_owned_link_id(&self, user: UserId, code: &str) -> Result<Option<LinkId>> {
        if !user.is_valid() {
            return Ok(None);
        }
        let Ok(code) = ShortCode::new(code) else {
            return Ok(None);
        };

        let tables = self.tables.read();
        let link = tables
            .by_code
            .get(&code)
            .copied()
            .filter(|&link| tables.ownership.contains_key(&(user, link)));

        Ok(link)
    }

    async fn begin_deletion(&self) -> Result<Box<dyn DeletionBatch>> {
        Ok(Box::new(InMemoryDeletionBatch {
            tables: Arc::clone(&self.tables),
            staged: Vec::new(),
        }))
    }
}

/// Stages soft-deletes and applies them under one write lock on commit.
struct InMemoryDeletionBatch {
    tables: Arc<RwLock<Tables>>,
    staged: Vec<(UserId, LinkId)>,
}

#[async_trait]
impl DeletionBatch for InMemoryDeletionBatch {
    async fn mark_deleted(&mut self, user: UserId, link: LinkId) -> Result<()> {
        self.staged.push((user, link));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut tables = self.tables.write();
        for key in &self.staged {
            if let Some(ownership) = tables.ownership.get_mut(key) {
                ownership.deleted = true;
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!(staged = self.staged.len(), "discarding staged deletions");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> InMemoryBackend {
        InMemoryBackend::new(Arc::new(CodeGenerator::default()))
    }

    #[tokio::test]
    async fn create_and_resolve() {
        let repo = backend();

        let code = repo.create("https://example.com", UserId(1)).await.unwrap();
        let url = repo.resolve(&code, None).await.unwrap();
        assert_eq!(url, "https://example.com");
    }

    #[tokio::test]
    async fn same_url_same_code_for_every_user() {
        let repo = backend();

        let first = repo.create("http://ya.ru", UserId(1)).await.unwrap();
        let second = repo.create("http://ya.ru", UserId(2)).await.unwrap();
        assert_eq!(first, second);

        let err = repo.create("http://ya.ru", UserId(1)).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(code) if code == first));

        assert_eq!(repo.stats().await.unwrap().urls, 1);
    }

    #[tokio::test]
    async fn resolve_unknown_code() {
        let repo = backend();

        let err = repo
            .resolve(&ShortCode::new_unchecked("zzzzzzzz"), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn owned_links_lists_in_creation_order() {
        let repo = backend();

        let a = repo.create("https://a.example", UserId(1)).await.unwrap();
        let b = repo.create("https://b.example", UserId(1)).await.unwrap();
        repo.create("https://c.example", UserId(2)).await.unwrap();

        let links = repo.owned_links(UserId(1)).await.unwrap();
        let codes: Vec<_> = links.iter().map(|l| l.code.clone()).collect();
        assert_eq!(codes, vec![a, b]);
        assert_eq!(links[1].original_url, "https://b.example");
    }

    #[tokio::test]
    async fn owned_links_for_stranger_is_not_found() {
        let repo = backend();
        repo.create("https://a.example", UserId(1)).await.unwrap();

        let err = repo.owned_links(UserId(7)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn next_user_id_counts_up_from_known_users() {
        let repo = backend();

        assert_eq!(repo.next_user_id().await.unwrap(), UserId(1));
        assert_eq!(repo.next_user_id().await.unwrap(), UserId(2));

        repo.create("https://a.example", UserId(10)).await.unwrap();
        assert_eq!(repo.next_user_id().await.unwrap(), UserId(11));
        assert_eq!(repo.users().len(), 4);
    }

    #[tokio::test]
    async fn next_user_id_reports_exhausted_id_space() {
        let repo = backend();
        repo.create("https://a.example", UserId(i32::MAX)).await.unwrap();

        let err = repo.next_user_id().await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidData(_)));
        assert_eq!(repo.users().len(), 1);
    }

    #[tokio::test]
    async fn resolve_owned_link_id_checks_owner_and_format() {
        let repo = backend();
        let code = repo.create("https://a.example", UserId(1)).await.unwrap();

        assert!(repo
            .resolve_owned_link_id(UserId(1), code.as_str())
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .resolve_owned_link_id(UserId(2), code.as_str())
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .resolve_owned_link_id(UserId(0), code.as_str())
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .resolve_owned_link_id(UserId(1), "abc")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn deletion_batch_applies_only_on_commit() {
        let repo = backend();
        let code = repo.create("https://a.example", UserId(1)).await.unwrap();
        let link = repo
            .resolve_owned_link_id(UserId(1), code.as_str())
            .await
            .unwrap()
            .unwrap();

        let mut batch = repo.begin_deletion().await.unwrap();
        batch.mark_deleted(UserId(1), link).await.unwrap();
        batch.rollback().await.unwrap();
        assert!(repo.resolve(&code, Some(UserId(1))).await.is_ok());

        let mut batch = repo.begin_deletion().await.unwrap();
        batch.mark_deleted(UserId(1), link).await.unwrap();
        assert!(repo.resolve(&code, Some(UserId(1))).await.is_ok());
        batch.commit().await.unwrap();

        let err = repo.resolve(&code, Some(UserId(1))).await.unwrap_err();
        assert!(err.is_deleted());
        assert_eq!(repo.resolve(&code, None).await.unwrap(), "https://a.example");
    }

    #[tokio::test]
    async fn deleted_links_are_hidden_from_owner_listing() {
        let repo = backend();
        let code = repo.create("https://a.example", UserId(1)).await.unwrap();
        let link = repo
            .resolve_owned_link_id(UserId(1), code.as_str())
            .await
            .unwrap()
            .unwrap();

        let mut batch = repo.begin_deletion().await.unwrap();
        batch.mark_deleted(UserId(1), link).await.unwrap();
        batch.commit().await.unwrap();

        assert!(repo.owned_links(UserId(1)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn import_is_all_or_nothing() {
        let repo = backend();
        let existing = repo.create("https://a.example", UserId(1)).await.unwrap();

        let entries = vec![
            SnapshotEntry {
                short_url: "bbbbbbbb".to_string(),
                original_url: "https://b.example".to_string(),
                user_id: vec![UserId(2)],
                deleted_user_id: vec![],
            },
            SnapshotEntry {
                short_url: existing.to_string(),
                original_url: "https://other.example".to_string(),
                user_id: vec![UserId(3)],
                deleted_user_id: vec![],
            },
        ];

        let err = repo.import_entries(entries).unwrap_err();
        assert!(matches!(err, StorageError::InvalidData(_)));
        assert_eq!(repo.stats().await.unwrap().urls, 1);
        assert!(repo
            .resolve(&ShortCode::new_unchecked("bbbbbbbb"), None)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn concurrent_creates_keep_tables_consistent() {
        let repo = backend();
        let mut handles = vec![];

        for i in 0..50 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let user = UserId(i % 5 + 1);
                let url = format!("https://example{}.com", i % 10);
                match repo.create(&url, user).await {
                    Ok(code) | Err(StorageError::AlreadyExists(code)) => (url, code),
                    Err(err) => panic!("unexpected error: {err}"),
                }
            }));
        }

        let mut by_url: HashMap<String, ShortCode> = HashMap::new();
        for handle in handles {
            let (url, code) = handle.await.unwrap();
            let previous = by_url.entry(url).or_insert_with(|| code.clone());
            assert_eq!(*previous, code);
        }

        assert_eq!(repo.stats().await.unwrap().urls, 10);
    }
}
