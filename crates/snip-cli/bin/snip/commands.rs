use crate::cli::Command;
use anyhow::{bail, Context};
use snip_storage::{BackendKind, Storage, StorageError};

pub async fn run(storage: &Storage, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Shorten { user, urls } => {
            let outcomes = storage.create_short_urls(&urls, user).await;
            let mut failed = 0;
            for (url, outcome) in urls.iter().zip(outcomes) {
                match outcome {
                    Ok(code) => println!("{}\t{url}", storage.short_url(&code)),
                    Err(StorageError::AlreadyExists(code)) => {
                        println!("{}\t{url}\t(already shortened)", storage.short_url(&code))
                    }
                    Err(err) => {
                        eprintln!("{url}: {err}");
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} urls could not be shortened", urls.len());
            }
        }
        Command::Resolve { code, user } => {
            let original = storage
                .get_url(&code, user)
                .await
                .with_context(|| format!("resolving {code}"))?;
            println!("{original}");
        }
        Command::List { user } => match storage.get_user_urls(user).await {
            Ok(links) => {
                for link in links {
                    println!("{}\t{}", storage.short_url(&link.code), link.original_url);
                }
            }
            Err(err) if err.is_not_found() => println!("user {user} has no links"),
            Err(err) => return Err(err).context("listing links"),
        },
        Command::Delete { user, codes } => {
            let report = storage
                .delete_user_urls(user, codes)
                .await
                .context("deleting links")?;
            println!("deleted {} of {} links", report.deleted, report.requested);
            for code in report.skipped {
                println!("skipped {code}");
            }
        }
        Command::NewUser => {
            if storage.backend_kind() == BackendKind::Memory {
                bail!("new-user needs a database, ids minted in memory are not persisted");
            }
            let user = storage.get_new_user_id().await.context("minting user")?;
            println!("{user}");
        }
        Command::Stats => {
            let stats = storage.stats().await.context("reading stats")?;
            println!("users: {}\nurls: {}", stats.users, stats.urls);
        }
        Command::Ping => {
            if !storage.ping_db().await {
                bail!("database is not reachable ({} backend)", storage.backend_kind());
            }
            println!("ok");
        }
    }

    Ok(())
}
