#![deny(warnings)]

use persistence::default_sqlite_url;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let url = std::env::var("REALM_DATABASE_URL").unwrap_or_else(|_| default_sqlite_url().to_string());
    // Ensure the save directory exists
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"));
    if let Some(path) = path {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let pool = persistence::init_db(&url).await?;
    let cities = persistence::SqliteStore::new(pool);
    let count = persistence::CityStore::list(&cities).await?.len();
    println!("DB migrated at {} ({} cities)", url, count);
    Ok(())
}
