//! C11: transactional read/update access to an MSI database's Property,
//! Binary, and `_Streams` tables and its Summary Information stream, built
//! on top of the `msi` crate.

use crate::{Error, Path};
use msi::{Insert, Package, PackageType, Select, Update, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read as _, Write as _};

/// The MSI open-mode state machine (spec.md §3 `MSIDatabase`). Every mode
/// transition commits the outgoing mode first.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    None,
    ReadOnly,
    Transact,
    Direct,
    /// Create a brand-new database, failing if the file already exists.
    Create,
    /// Create a brand-new database, replacing the file if it exists.
    CreateDirect,
    /// Apply an MSP patch transform against the open database.
    PatchFile,
}

/// A resolved row: column name -> typed value, per the `_Columns`-driven
/// dynamic schema spec.md §4.11/§9 describe.
pub type Row = HashMap<String, Value>;

/// Fixed Summary Information property indices (spec.md §4.11).
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct SummaryInfo {
    pub title: Option<String>,
    pub subject: Option<String>,
    pub author: Option<String>,
    pub keywords: Option<String>,
    pub comments: Option<String>,
    pub template: Option<String>,
    pub last_saved_by: Option<String>,
    pub revision_number: Option<String>,
    pub last_printed: Option<String>,
    pub create_time_date: Option<String>,
    pub last_save_time_date: Option<String>,
    pub page_count: Option<i32>,
    pub word_count: Option<i32>,
    pub character_count: Option<i32>,
    pub creating_application: Option<String>,
    pub security: Option<i32>,
    pub code_page: Option<i32>,
}

/// A transactional handle to an MSI database file, held open from `open`
/// until dropped.
pub struct MsiDatabase {
    package: Package<std::fs::File>,
    mode: Mode,
}

impl MsiDatabase {
    /// Opens an existing MSI database in `ReadOnly` mode.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let package = Package::open(file).map_err(|e| Error::decode("MSI database", e))?;
        Ok(Self {
            package,
            mode: Mode::ReadOnly,
        })
    }

    /// Opens an existing `.msp` transform against `path`'s database and
    /// marks the handle `PatchFile`. Reuses the same `Package::open` path
    /// as `open`; the `msi` crate detects the patch storage from the
    /// file's own root-storage class ID.
    pub fn open_patch(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let package = Package::open(file).map_err(|e| Error::decode("MSI patch", e))?;
        Ok(Self {
            package,
            mode: Mode::PatchFile,
        })
    }

    /// Creates a new MSI database at `path`, per `mode` (`Create` fails if
    /// `path` already exists; `CreateDirect` truncates it).
    pub fn create(path: &Path, mode: Mode) -> Result<Self, Error> {
        let file = match mode {
            Mode::Create => std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)?,
            Mode::CreateDirect => File::create(path)?,
            other => {
                return Err(Error::ModeConflict {
                    from: "None".to_string(),
                    to: format!("{other:?}"),
                })
            }
        };
        let package = Package::create(PackageType::Installer, file)
            .map_err(|e| Error::decode("MSI database", e))?;
        Ok(Self { package, mode })
    }

    /// Transitions to `mode`, committing whatever mode is currently open
    /// first. `ModeConflict` is returned only if a transition is requested
    /// from a mode whose pending writes fail to commit, or the requested
    /// mode is a create-time-only mode reachable only via `create`.
    pub fn open_database(&mut self, mode: Mode) -> Result<(), Error> {
        if matches!(mode, Mode::Create | Mode::CreateDirect) {
            return Err(Error::ModeConflict {
                from: format!("{:?}", self.mode),
                to: format!("{mode:?}"),
            });
        }
        if self.mode != Mode::None && self.mode != mode {
            self.commit()?;
        }
        self.mode = mode;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), Error> {
        self.package
            .flush()
            .map_err(|_| Error::ModeConflict {
                from: format!("{:?}", self.mode),
                to: "committed".to_string(),
            })
    }

    /// Returns every column in `table` as resolved from `_Columns`; a
    /// table with no `_Columns` entry is a `Schema` error.
    pub fn get_table_columns(&self, table: &str) -> Result<Vec<String>, Error> {
        let columns = self
            .package
            .get_table(table)
            .ok_or_else(|| Error::Schema {
                table: table.to_string(),
            })?
            .columns();
        Ok(columns.iter().map(|c| c.name().to_string()).collect())
    }

    /// Accepts either a full `SELECT ... FROM <table> [WHERE ...]` or a
    /// bare table name, expanded to `SELECT * FROM <table>`.
    pub fn execute_sql(&mut self, query: &str) -> Result<Vec<Row>, Error> {
        let parsed = ParsedQuery::parse(query)?;
        let columns = self.get_table_columns(&parsed.table)?;

        let rows = self
            .package
            .select_rows(Select::table(&parsed.table))
            .map_err(|e| Error::decode(format!("table {}", parsed.table), e))?;

        let mut out = Vec::new();
        for row in rows {
            let mut mapped: Row = HashMap::new();
            for (i, name) in columns.iter().enumerate() {
                if let Some(value) = row.get(i) {
                    mapped.insert(name.clone(), value.clone());
                }
            }
            if parsed.matches(&mapped) {
                out.push(mapped);
            }
        }

        Ok(out)
    }

    /// Returns `Property` table values; `Some(name)` filters to a single
    /// row, `None` returns every property.
    pub fn get_property(&mut self, name: Option<&str>) -> Result<Vec<(String, String)>, Error> {
        let rows = self
            .package
            .select_rows(Select::table("Property"))
            .map_err(|e| Error::decode("Property table", e))?;

        let mut out = Vec::new();
        for row in rows {
            let Some(Value::Str(prop_name)) = row.get(0) else {
                continue;
            };
            if let Some(filter) = name {
                if prop_name != filter {
                    continue;
                }
            }
            let value = match row.get(1) {
                Some(Value::Str(s)) => s.clone(),
                Some(other) => format!("{other:?}"),
                None => String::new(),
            };
            out.push((prop_name.clone(), value));
        }

        Ok(out)
    }

    /// `UPDATE` when the property exists, else `INSERT`. Does not commit;
    /// the caller (or the next mode change) does.
    pub fn set_property(&mut self, name: &str, value: &str) -> Result<(), Error> {
        let exists = !self.get_property(Some(name))?.is_empty();

        if exists {
            self.package
                .update_rows(
                    Update::table("Property")
                        .set("Value", Value::Str(value.to_string()))
                        .filter_eq("Property", Value::Str(name.to_string())),
                )
                .map_err(|e| Error::decode("Property update", e))?;
        } else {
            self.package
                .insert_rows(Insert::into("Property").row(vec![
                    Value::Str(name.to_string()),
                    Value::Str(value.to_string()),
                ]))
                .map_err(|e| Error::decode("Property insert", e))?;
        }

        Ok(())
    }

    pub fn get_streams(&self) -> Vec<String> {
        self.package.streams().map(|s| s.to_string()).collect()
    }

    pub fn get_binary(&mut self, name: &str, out_path: &Path) -> Result<(), Error> {
        let mut reader = self
            .package
            .read_stream(name)
            .map_err(|_| Error::not_found(format!("stream {name}")))?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        std::fs::write(out_path, buf)?;
        Ok(())
    }

    pub fn set_binary(&mut self, name: &str, in_path: &Path) -> Result<(), Error> {
        let data = std::fs::read(in_path)?;
        let mut writer = self
            .package
            .write_stream(name)
            .map_err(|e| Error::decode(format!("stream {name}"), e))?;
        writer.write_all(&data)?;
        Ok(())
    }

    pub fn update_stream(&mut self, name: &str, in_path: &Path) -> Result<(), Error> {
        self.set_binary(name, in_path)
    }

    pub fn get_summary(&self) -> SummaryInfo {
        let info = self.package.summary_info();
        SummaryInfo {
            title: info.title().map(str::to_string),
            subject: info.subject().map(str::to_string),
            author: info.author().map(str::to_string),
            keywords: info.keywords().map(str::to_string),
            comments: info.comments().map(str::to_string),
            template: info.template().map(str::to_string),
            last_saved_by: info.last_saved_by().map(str::to_string),
            revision_number: info.revision_number().map(str::to_string),
            last_printed: info.last_printed_since_epoch().map(|t| t.to_string()),
            create_time_date: info.creation_time_since_epoch().map(|t| t.to_string()),
            last_save_time_date: info.last_saved_since_epoch().map(|t| t.to_string()),
            page_count: info.page_count(),
            word_count: info.word_count(),
            character_count: info.character_count(),
            creating_application: info.creating_application().map(str::to_string),
            security: info.security(),
            code_page: Some(info.codepage().id()),
        }
    }
}

/// A minimal `SELECT`/bare-table parser: recognizes `SELECT [cols] FROM
/// <table> [WHERE col = 'value' [AND ...]]` or a bare identifier.
struct ParsedQuery {
    table: String,
    filters: Vec<(String, String)>,
}

impl ParsedQuery {
    fn parse(query: &str) -> Result<Self, Error> {
        let trimmed = query.trim();

        if !trimmed.to_ascii_uppercase().starts_with("SELECT") {
            return Ok(Self {
                table: trimmed.to_string(),
                filters: Vec::new(),
            });
        }

        let upper = trimmed.to_ascii_uppercase();
        let from_pos = upper
            .find(" FROM ")
            .ok_or_else(|| Error::decode("SQL query", "missing FROM clause"))?;
        let after_from = trimmed[from_pos + 6..].trim();

        let (table_part, where_part) = match after_from.to_ascii_uppercase().find(" WHERE ") {
            Some(where_pos) => (
                after_from[..where_pos].trim(),
                Some(after_from[where_pos + 7..].trim()),
            ),
            None => (after_from.trim(), None),
        };

        let filters = where_part
            .map(|w| {
                w.split(" AND ")
                    .filter_map(|clause| {
                        let (col, val) = clause.split_once('=')?;
                        Some((
                            col.trim().to_string(),
                            val.trim().trim_matches(|c| c == '\'' || c == '"').to_string(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            table: table_part.to_string(),
            filters,
        })
    }

    fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|(col, val)| {
            row.get(col)
                .map(|v| value_eq_str(v, val))
                .unwrap_or(false)
        })
    }
}

fn value_eq_str(value: &Value, expected: &str) -> bool {
    match value {
        Value::Str(s) => s == expected,
        Value::Int(i) => i.to_string() == expected,
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_bare_table_name() {
        let parsed = ParsedQuery::parse("Property").unwrap();
        assert_eq!(parsed.table, "Property");
        assert!(parsed.filters.is_empty());
    }

    #[test]
    fn parses_select_with_where() {
        let parsed = ParsedQuery::parse("SELECT * FROM Property WHERE Property = 'ALLUSERS'")
            .unwrap();
        assert_eq!(parsed.table, "Property");
        assert_eq!(parsed.filters, vec![("Property".to_string(), "ALLUSERS".to_string())]);
    }

    #[test]
    fn parses_select_without_where() {
        let parsed = ParsedQuery::parse("SELECT * FROM Media").unwrap();
        assert_eq!(parsed.table, "Media");
        assert!(parsed.filters.is_empty());
    }
}
