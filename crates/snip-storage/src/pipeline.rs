//! Bulk soft-deletion of a user's links.
//!
//! The pipeline has four stages connected by channels:
//!
//! 1. **generate** emits one claim per requested code,
//! 2. **resolve** is a fixed pool of workers turning claims into link ids
//!    owned by the user, each worker writing to its own channel,
//! 3. **merge** forwards every worker channel into a single one,
//! 4. **apply** marks every resolved link deleted inside one
//!    [`DeletionBatch`] and commits it once.
//!
//! All stages stop as soon as the run's stop signal fires, which happens
//! whenever [`DeletionPipeline::run`] returns.

use snip_core::{DeletionBatch, LinkId, OwnershipStore, Result, StorageError, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct DeletionSettings {
    /// Upper bound on concurrently resolving workers.
    #[builder(default = DEFAULT_MAX_CONCURRENCY)]
    pub max_concurrency: usize,
    /// Deadline for resolving and applying one batch.
    #[builder(default = DEFAULT_APPLY_TIMEOUT)]
    pub apply_timeout: Duration,
}

impl Default for DeletionSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Outcome of a committed deletion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionReport {
    /// Number of codes that were requested.
    pub requested: usize,
    /// Number of ownership edges marked deleted.
    pub deleted: usize,
    /// Codes that do not belong to the user (or do not exist), in no
    /// particular order.
    pub skipped: Vec<String>,
}

#[derive(Debug)]
struct Claim {
    user: UserId,
    code: String,
}

#[derive(Debug)]
struct Resolved {
    user: UserId,
    code: String,
    link: Result<Option<LinkId>>,
}

/// Fires once the sending half owned by [`DeletionPipeline::run`] is dropped.
#[derive(Clone)]
struct Stop(watch::Receiver<()>);

impl Stop {
    async fn stopped(&mut self) {
        while self.0.changed().await.is_ok() {}
    }
}

/// Resolves and soft-deletes a batch of codes for one user.
pub struct DeletionPipeline<S: ?Sized> {
    store: Arc<S>,
    settings: DeletionSettings,
}

impl<S: OwnershipStore + ?Sized> DeletionPipeline<S> {
    pub fn new(store: Arc<S>, settings: DeletionSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> DeletionSettings {
        self.settings
    }

    /// Marks every code in `codes` owned by `user` as deleted for that user.
    ///
    /// Either all resolved codes are deleted or, if the batch fails, none is.
    /// Codes the user does not own are skipped. Returns `Err(NotFound)` when
    /// no code could be resolved. A backend error while resolving any code
    /// aborts the run with that error and deletes nothing.
    pub async fn run(&self, user: UserId, codes: Vec<String>) -> Result<DeletionReport> {
        let requested = codes.len();
        if requested == 0 {
            return Err(StorageError::NotFound("no codes to delete".to_string()));
        }

        // Dropping the sender on return stops every stage.
        let (_stop, stopped) = watch::channel(());

        let workers = requested.min(self.settings.max_concurrency.max(1));
        debug!(user = %user, requested, workers, "starting deletion pipeline");

        let claims = generate(Stop(stopped.clone()), user, codes);
        let outputs = resolve(Stop(stopped.clone()), Arc::clone(&self.store), claims, workers);
        let resolved = merge(Stop(stopped), outputs);

        let (deleted, skipped) =
            tokio::time::timeout(self.settings.apply_timeout, apply(self.store.as_ref(), resolved))
                .await
                .map_err(|_| {
                    warn!(user = %user, "deletion batch timed out");
                    StorageError::Timeout(format!(
                        "deleting {requested} links of user {user}"
                    ))
                })??;

        info!(user = %user, requested, deleted, skipped = skipped.len(), "deleted user links");
        Ok(DeletionReport {
            requested,
            deleted,
            skipped,
        })
    }
}

fn generate(mut stop: Stop, user: UserId, codes: Vec<String>) -> mpsc::Receiver<Claim> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        for code in codes {
            tokio::select! {
                _ = stop.stopped() => return,
                sent = tx.send(Claim { user, code }) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    });

    rx
}

fn resolve<S: OwnershipStore + ?Sized>(
    stop: Stop,
    store: Arc<S>,
    claims: mpsc::Receiver<Claim>,
    workers: usize,
) -> Vec<mpsc::Receiver<Resolved>> {
    let claims = Arc::new(Mutex::new(claims));

    (0..workers)
        .map(|worker| {
            let (tx, rx) = mpsc::channel(1);
            let mut stop = stop.clone();
            let store = Arc::clone(&store);
            let claims = Arc::clone(&claims);

            tokio::spawn(async move {
                loop {
                    let claim = tokio::select! {
                        _ = stop.stopped() => return,
                        claim = async { claims.lock().await.recv().await } => claim,
                    };
                    let Some(Claim { user, code }) = claim else {
                        return;
                    };

                    let link = tokio::select! {
                        _ = stop.stopped() => return,
                        link = store.resolve_owned_link_id(user, &code) => link,
                    };
                    if let Err(err) = &link {
                        warn!(worker, user = %user, code, error = %err, "failed to resolve link");
                    }

                    tokio::select! {
                        _ = stop.stopped() => return,
                        sent = tx.send(Resolved { user, code, link }) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            });

            rx
        })
        .collect()
}

/// Forwards every input into one channel. The merged channel closes once
/// the last forwarder has finished and dropped its sender.
fn merge(
    stop: Stop,
    inputs: Vec<mpsc::Receiver<Resolved>>,
) -> mpsc::Receiver<Resolved> {
    let (tx, rx) = mpsc::channel(inputs.len().max(1));

    for mut input in inputs {
        let tx = tx.clone();
        let mut stop = stop.clone();

        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = stop.stopped() => return,
                    item = input.recv() => item,
                };
                let Some(item) = item else {
                    return;
                };
                tokio::select! {
                    _ = stop.stopped() => return,
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    rx
}

/// Collects every resolution, then applies the owned ones in one batch.
///
/// The batch is opened only after resolving has finished, so the resolve
/// queries never wait on the connection held by the batch.
async fn apply<S: OwnershipStore + ?Sized>(
    store: &S,
    mut resolved: mpsc::Receiver<Resolved>,
) -> Result<(usize, Vec<String>)> {
    let mut owned = Vec::new();
    let mut skipped = Vec::new();

    while let Some(Resolved { user, code, link }) = resolved.recv().await {
        match link? {
            Some(link) => owned.push((user, link)),
            None => {
                debug!(user = %user, code, "code not owned by user, skipping");
                skipped.push(code);
            }
        }
    }

    if owned.is_empty() {
        return Err(StorageError::NotFound(
            "none of the codes belong to the user".to_string(),
        ));
    }

    let mut batch = store.begin_deletion().await?;
    for &(user, link) in &owned {
        if let Err(err) = batch.mark_deleted(user, link).await {
            warn!(user = %user, link = %link, error = %err, "rolling back deletion batch");
            discard(batch).await;
            return Err(err);
        }
    }

    batch.commit().await?;
    Ok((owned.len(), skipped))
}

async fn discard(batch: Box<dyn DeletionBatch>) {
    if let Err(err) = batch.rollback().await {
        warn!(error = %err, "failed to roll back deletion batch");
    }
}
