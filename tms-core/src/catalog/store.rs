use std::path::{Path, PathBuf};

use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use uuid::Uuid;

use crate::sqlite::configure_connection;

use super::{Catalog, CatalogError, CatalogResult, Channel, NewSource, Profile, Source};

const CATALOG_SCHEMA: &str = include_str!("../../../sql/catalog.sql");

#[derive(Debug, Clone)]
pub struct SqliteCatalogBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteCatalogBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteCatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> CatalogResult<SqliteCatalog> {
        let path = self.path.ok_or(CatalogError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        Ok(SqliteCatalog { path, flags })
    }
}

/// Catalog backed by a SQLite database with the host's channel schema.
#[derive(Debug, Clone)]
pub struct SqliteCatalog {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteCatalog {
    pub fn builder() -> SqliteCatalogBuilder {
        SqliteCatalogBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> CatalogResult<Self> {
        SqliteCatalogBuilder::new().path(path).build()
    }

    fn open(&self) -> CatalogResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            CatalogError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| CatalogError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> CatalogResult<()> {
        let conn = self.open()?;
        conn.execute_batch(CATALOG_SCHEMA)?;
        Ok(())
    }

    pub fn add_channel(
        &self,
        name: &str,
        uuid: Uuid,
        logo_url: Option<&str>,
    ) -> CatalogResult<Channel> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO channels (uuid, name, logo_url) VALUES (?1, ?2, ?3)",
            params![uuid.to_string(), name, logo_url],
        )?;
        Ok(Channel {
            id: conn.last_insert_rowid(),
            uuid,
            name: name.to_string(),
            logo_url: logo_url.map(str::to_string),
        })
    }

    pub fn add_account(&self, name: &str) -> CatalogResult<i64> {
        let conn = self.open()?;
        conn.execute("INSERT INTO accounts (name) VALUES (?1)", params![name])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn add_profile(
        &self,
        account_id: i64,
        name: &str,
        is_active: bool,
        is_default: bool,
        max_streams: u32,
    ) -> CatalogResult<Profile> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO account_profiles (account_id, name, is_active, is_default, max_streams)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![account_id, name, is_active, is_default, max_streams],
        )?;
        Ok(Profile {
            id: conn.last_insert_rowid(),
            account_id,
            name: name.to_string(),
            is_active,
            is_default,
            max_streams,
        })
    }

    pub fn set_profile_active(&self, profile_id: i64, is_active: bool) -> CatalogResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE account_profiles SET is_active = ?2 WHERE id = ?1",
            params![profile_id, is_active],
        )?;
        Ok(())
    }

    pub fn add_source(&self, channel_id: i64, source: &NewSource) -> CatalogResult<Source> {
        let created = self.create_source(source)?;
        let conn = self.open()?;
        let position: i64 = conn.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM channel_streams WHERE channel_id = ?1",
            params![channel_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO channel_streams (channel_id, stream_id, position) VALUES (?1, ?2, ?3)",
            params![channel_id, created.id, position],
        )?;
        Ok(created)
    }
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    let raw_uuid: String = row.get("uuid")?;
    let uuid = Uuid::parse_str(&raw_uuid)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(err)))?;
    Ok(Channel {
        id: row.get("id")?,
        uuid,
        name: row.get("name")?,
        logo_url: row.get("logo_url")?,
    })
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get("id")?,
        name: row.get("name")?,
        url: row.get("url")?,
        account_id: row.get("account_id")?,
        is_custom: row.get("is_custom")?,
    })
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        name: row.get("name")?,
        is_active: row.get("is_active")?,
        is_default: row.get("is_default")?,
        max_streams: row.get::<_, i64>("max_streams")?.max(0) as u32,
    })
}

impl Catalog for SqliteCatalog {
    fn channel(&self, channel_id: i64) -> CatalogResult<Option<Channel>> {
        let conn = self.open()?;
        let channel = conn
            .query_row(
                "SELECT id, uuid, name, logo_url FROM channels WHERE id = ?1",
                params![channel_id],
                channel_from_row,
            )
            .optional()?;
        Ok(channel)
    }

    fn channels(&self) -> CatalogResult<Vec<Channel>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT id, uuid, name, logo_url FROM channels ORDER BY id")?;
        let rows = stmt
            .query_map([], channel_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn channels_by_uuid(&self, uuids: &[Uuid]) -> CatalogResult<Vec<Channel>> {
        if uuids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let placeholders = vec!["?"; uuids.len()].join(", ");
        let sql = format!(
            "SELECT id, uuid, name, logo_url FROM channels WHERE uuid IN ({placeholders}) ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params_from_iter(uuids.iter().map(|uuid| uuid.to_string())),
                channel_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn channel_sources(&self, channel_id: i64) -> CatalogResult<Vec<Source>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.name, s.url, s.account_id, s.is_custom \
             FROM channel_streams cs JOIN streams s ON s.id = cs.stream_id \
             WHERE cs.channel_id = ?1 \
             ORDER BY cs.position, s.id",
        )?;
        let rows = stmt
            .query_map(params![channel_id], source_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn account_profiles(&self, account_id: i64) -> CatalogResult<Vec<Profile>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, account_id, name, is_active, is_default, max_streams \
             FROM account_profiles WHERE account_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![account_id], profile_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn find_source(&self, name: &str, url: &str) -> CatalogResult<Option<Source>> {
        let conn = self.open()?;
        let source = conn
            .query_row(
                "SELECT id, name, url, account_id, is_custom FROM streams \
                 WHERE name = ?1 AND url = ?2 ORDER BY id LIMIT 1",
                params![name, url],
                source_from_row,
            )
            .optional()?;
        Ok(source)
    }

    fn create_source(&self, source: &NewSource) -> CatalogResult<Source> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO streams (name, url, account_id, is_custom) VALUES (?1, ?2, ?3, ?4)",
            params![source.name, source.url, source.account_id, source.is_custom],
        )?;
        Ok(Source {
            id: conn.last_insert_rowid(),
            name: source.name.clone(),
            url: source.url.clone(),
            account_id: source.account_id,
            is_custom: source.is_custom,
        })
    }

    fn attach_source(
        &self,
        channel_id: i64,
        source_id: i64,
        position: i64,
    ) -> CatalogResult<bool> {
        let conn = self.open()?;
        let exists: Option<i64> = conn
            .query_row("SELECT id FROM channels WHERE id = ?1", params![channel_id], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(CatalogError::ChannelNotFound { channel_id });
        }
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO channel_streams (channel_id, stream_id, position) \
             VALUES (?1, ?2, ?3)",
            params![channel_id, source_id, position],
        )?;
        Ok(inserted > 0)
    }

    fn detach_source(&self, channel_id: i64, source_id: i64) -> CatalogResult<bool> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM channel_streams WHERE channel_id = ?1 AND stream_id = ?2",
            params![channel_id, source_id],
        )?;
        Ok(removed > 0)
    }
}
