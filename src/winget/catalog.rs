//! C9: download, extract, open, and query the WinGet SQLite catalog
//! database.

use crate::http::MsHttpClient;
use crate::{Error, Path, PathBuf};
use rusqlite::Connection;
use std::io::Read as _;

const DEFAULT_SOURCE_URL: &str =
    "https://cdn.winget.microsoft.com/cache";
const ARCHIVE_NAME: &str = "source2.msix";

/// An opened WinGet catalog: the extracted SQLite database plus the
/// metadata spec.md §3 lists against `WingetCatalog`.
pub struct WingetCatalog {
    pub database_path: PathBuf,
    pub extract_path: PathBuf,
    pub source_url: String,
    pub database_size_mb: f64,
}

impl WingetCatalog {
    /// Downloads (if needed), extracts, and opens the WinGet source
    /// archive. `source_url` defaults to the well-known CDN base;
    /// `/source2.msix` is appended unless the URL already ends in `msix`.
    pub fn open(
        http: &MsHttpClient,
        source_url: Option<&str>,
        output_dir: &Path,
        keep_archive: bool,
    ) -> Result<Self, Error> {
        let base = source_url.unwrap_or(DEFAULT_SOURCE_URL);
        let archive_url = if base.ends_with("msix") {
            base.to_string()
        } else {
            format!("{}/{ARCHIVE_NAME}", base.trim_end_matches('/'))
        };

        std::fs::create_dir_all(output_dir)?;
        let archive_path = output_dir.join(ARCHIVE_NAME);

        let response = http.get(&archive_url, &[])?;
        std::fs::write(&archive_path, &response.body)?;

        let extract_path = output_dir.join("extracted");
        std::fs::create_dir_all(&extract_path)?;
        extract_zip(&archive_path, &extract_path)?;

        let database_path = find_database(&extract_path)?;
        let database_size_mb = std::fs::metadata(&database_path)
            .map(|m| m.len() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0);

        if !keep_archive {
            let _ = std::fs::remove_file(&archive_path);
        }

        Ok(Self {
            database_path,
            extract_path,
            source_url: archive_url,
            database_size_mb,
        })
    }

    fn connection(&self) -> Result<Connection, Error> {
        Connection::open(&self.database_path)
            .map_err(|e| Error::decode("winget catalog database", e))
    }

    pub fn count(&self) -> Result<i64, Error> {
        let conn = self.connection()?;
        conn.query_row("SELECT COUNT(*) FROM manifest", [], |row| row.get(0))
            .map_err(|e| Error::decode("manifest count", e))
    }

    pub fn tables(&self) -> Result<Vec<String>, Error> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .map_err(|e| Error::decode("sqlite_master", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::decode("sqlite_master", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::decode("sqlite_master", e))
    }

    pub fn schema(&self, table: &str) -> Result<Vec<ColumnInfo>, Error> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .map_err(|e| Error::decode("table_info", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    column_type: row.get(2)?,
                })
            })
            .map_err(|e| Error::decode("table_info", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::decode("table_info", e))
    }

    pub fn get_packages(&self, query: PackageQuery<'_>) -> Result<Vec<PackageRow>, Error> {
        let conn = self.connection()?;
        let limit = query.limit.unwrap_or(100);

        let (sql, param): (String, String) = match query.by {
            PackageLookup::Name(v) => (
                "SELECT rowid, name, id FROM packages WHERE name = ?1 LIMIT ?2".into(),
                v.to_string(),
            ),
            PackageLookup::Id(v) => (
                "SELECT rowid, name, id FROM packages WHERE id = ?1 LIMIT ?2".into(),
                v.to_string(),
            ),
            PackageLookup::Rowid(v) => (
                "SELECT rowid, name, id FROM packages WHERE rowid = ?1 LIMIT ?2".into(),
                v.to_string(),
            ),
            PackageLookup::Publisher(v) => (
                "SELECT p.rowid, p.name, p.id FROM packages p \
                 JOIN norm_publishers2 np ON np.package = p.rowid \
                 WHERE np.norm_publisher = ?1 LIMIT ?2"
                    .into(),
                v.to_string(),
            ),
        };

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::decode("packages query", e))?;
        let rows = stmt
            .query_map(rusqlite::params![param, limit], |row| {
                Ok(PackageRow {
                    rowid: row.get(0)?,
                    name: row.get(1)?,
                    id: row.get(2)?,
                })
            })
            .map_err(|e| Error::decode("packages query", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::decode("packages query", e))
    }

    pub fn search_packages(
        &self,
        term: &str,
        include_publisher: bool,
        limit: i64,
    ) -> Result<Vec<PackageRow>, Error> {
        let conn = self.connection()?;
        let like = format!("%{term}%");

        let sql = if include_publisher {
            "SELECT DISTINCT p.rowid, p.name, p.id FROM packages p \
             LEFT JOIN norm_publishers2 np ON np.package = p.rowid \
             WHERE p.name LIKE ?1 OR p.id LIKE ?1 OR p.moniker LIKE ?1 \
                OR np.norm_publisher LIKE ?1 LIMIT ?2"
        } else {
            "SELECT rowid, name, id FROM packages \
             WHERE name LIKE ?1 OR id LIKE ?1 OR moniker LIKE ?1 LIMIT ?2"
        };

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::decode("search packages", e))?;
        let rows = stmt
            .query_map(rusqlite::params![like, limit], |row| {
                Ok(PackageRow {
                    rowid: row.get(0)?,
                    name: row.get(1)?,
                    id: row.get(2)?,
                })
            })
            .map_err(|e| Error::decode("search packages", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::decode("search packages", e))
    }

    pub fn get_product_codes(&self, package_id: &str) -> Result<Vec<String>, Error> {
        let conn = self.connection()?;
        let rowid: Option<i64> = conn
            .query_row(
                "SELECT rowid FROM packages WHERE id = ?1",
                [package_id],
                |row| row.get(0),
            )
            .ok();
        let Some(rowid) = rowid else {
            return Ok(Vec::new());
        };

        let mut stmt = conn
            .prepare("SELECT productcode FROM productcodes2 WHERE package = ?1")
            .map_err(|e| Error::decode("product codes", e))?;
        let rows = stmt
            .query_map([rowid], |row| row.get::<_, String>(0))
            .map_err(|e| Error::decode("product codes", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::decode("product codes", e))
    }

    /// The package row's `latest_version` and `hash` fields used by
    /// [`super::manifest::WingetManifestFetcher`] to build a `hash8`
    /// content-addressed path.
    pub fn package_hash(&self, package_id: &str) -> Result<(String, Vec<u8>), Error> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT latest_version, hash FROM packages WHERE id = ?1",
            [package_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| Error::not_found(format!("winget package {package_id}")))
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: String,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct PackageRow {
    pub rowid: i64,
    pub name: String,
    pub id: String,
}

pub enum PackageLookup<'a> {
    Name(&'a str),
    Id(&'a str),
    Publisher(&'a str),
    Rowid(i64),
}

pub struct PackageQuery<'a> {
    pub by: PackageLookup<'a>,
    pub limit: Option<i64>,
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<(), Error> {
    let file = std::fs::File::open(archive_path)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| Error::decode("winget archive", e))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| Error::decode("winget archive entry", e))?;
        let Some(name) = entry.enclosed_name() else {
            continue;
        };
        let out_path = dest.join(name.to_string_lossy().as_ref());

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        std::fs::write(&out_path, buf)?;
    }

    Ok(())
}

fn find_database(extract_path: &Path) -> Result<PathBuf, Error> {
    let mut fallback = None;
    for entry in walkdir::WalkDir::new(extract_path)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if name.eq_ignore_ascii_case("index.db") {
            return PathBuf::from_path_buf(entry.into_path())
                .map_err(|pb| Error::decode("database path", format!("{} is not utf-8", pb.display())));
        }
        if fallback.is_none() && name.ends_with(".db") {
            fallback = Some(entry.into_path());
        }
    }

    fallback
        .and_then(|pb| PathBuf::from_path_buf(pb).ok())
        .ok_or_else(|| Error::not_found("index.db (or any *.db) in winget archive"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_archive_url_appends_source2_msix() {
        let base = "https://example.com/cache";
        let url = format!("{}/{ARCHIVE_NAME}", base.trim_end_matches('/'));
        assert_eq!(url, "https://example.com/cache/source2.msix");
    }

    #[test]
    fn archive_url_untouched_when_already_msix() {
        let base = "https://example.com/custom/source.msix";
        assert!(base.ends_with("msix"));
    }
}
