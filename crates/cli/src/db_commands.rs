use {
    clap::Subcommand,
    corral_config::CorralConfig,
    std::path::PathBuf,
};

use crate::server;

#[derive(Subcommand)]
pub enum DbAction {
    /// Run all pending database migrations.
    Migrate,
    /// Delete the database file, including SQLite's WAL and SHM files.
    Reset,
}

pub async fn handle_db(action: DbAction, config: &CorralConfig) -> anyhow::Result<()> {
    match action {
        DbAction::Migrate => migrate(config).await,
        DbAction::Reset => reset(config),
    }
}

async fn migrate(config: &CorralConfig) -> anyhow::Result<()> {
    let pool = server::open_pool(config).await?;
    server::migrate(&pool).await?;
    pool.close().await;
    println!("Migrations applied to {}", config.database.url);
    Ok(())
}

/// Path of the database file behind a `sqlite:` URL, if it names one.
fn db_path(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}

fn reset(config: &CorralConfig) -> anyhow::Result<()> {
    let Some(main_db) = db_path(&config.database.url) else {
        println!("{} is not a database file.", config.database.url);
        return Ok(());
    };

    let mut deleted = false;
    for suffix in ["", "-wal", "-shm"] {
        let mut path = main_db.clone().into_os_string();
        path.push(suffix);
        let path = PathBuf::from(path);
        if path.exists() {
            std::fs::remove_file(&path)?;
            println!("Deleted: {}", path.display());
            deleted = true;
        }
    }

    if deleted {
        println!("Database deleted. Run `corral db migrate` to recreate it.");
    } else {
        println!("No database file found at {}.", main_db.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, std::path::Path};

    #[test]
    fn extracts_file_paths_from_urls() {
        assert_eq!(
            db_path("sqlite://corral.db?mode=rwc").as_deref(),
            Some(Path::new("corral.db"))
        );
        assert_eq!(
            db_path("sqlite:/var/lib/corral/c.db").as_deref(),
            Some(Path::new("/var/lib/corral/c.db"))
        );
        assert_eq!(db_path("sqlite::memory:"), None);
        assert_eq!(db_path("postgres://x"), None);
    }
}
