//! Persistent parameter cache.
//!
//! Tuned parameter records are stored in a single SQLite database under a
//! per-user cache directory, one table per `(algorithm, schema version)`
//! pair. Rows are keyed by the device fingerprint plus a fingerprint of the
//! problem; values are the tuned parameters and the compiled program binary.
//!
//! Concurrent writers are serialized by SQLite itself; racing tuners all
//! attempt to record the same empirically-best answer, so `INSERT OR
//! REPLACE` with last-writer-wins is sufficient.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lazy_static::lazy_static;
use ocl::core::{DeviceInfo, DeviceInfoResult};
use ocl::Device;
use rusqlite::types::{Value, ValueRef};
use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::util;

/// Maps a record field type onto a SQL column type and value conversions.
pub(crate) trait SqlField: Sized {
    const SQL_TYPE: &'static str;
    fn to_value(&self) -> Value;
    fn from_value(value: ValueRef) -> Result<Self>;
}

impl SqlField for usize {
    const SQL_TYPE: &'static str = "INT";
    fn to_value(&self) -> Value {
        Value::Integer(*self as i64)
    }
    fn from_value(value: ValueRef) -> Result<usize> {
        match value {
            ValueRef::Integer(i) => Ok(i as usize),
            other => Err(Error::Cache(format!("expected INT, found {:?}", other.data_type()))),
        }
    }
}

impl SqlField for u32 {
    const SQL_TYPE: &'static str = "INT";
    fn to_value(&self) -> Value {
        Value::Integer(i64::from(*self))
    }
    fn from_value(value: ValueRef) -> Result<u32> {
        match value {
            ValueRef::Integer(i) => Ok(i as u32),
            other => Err(Error::Cache(format!("expected INT, found {:?}", other.data_type()))),
        }
    }
}

impl SqlField for String {
    const SQL_TYPE: &'static str = "TEXT";
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }
    fn from_value(value: ValueRef) -> Result<String> {
        match value {
            ValueRef::Text(t) => String::from_utf8(t.to_vec())
                .map_err(|_| Error::Cache("non-utf8 TEXT column".into())),
            other => Err(Error::Cache(format!("expected TEXT, found {:?}", other.data_type()))),
        }
    }
}

impl SqlField for Vec<u8> {
    const SQL_TYPE: &'static str = "BLOB";
    fn to_value(&self) -> Value {
        Value::Blob(self.clone())
    }
    fn from_value(value: ValueRef) -> Result<Vec<u8>> {
        match value {
            ValueRef::Blob(b) => Ok(b.to_vec()),
            other => Err(Error::Cache(format!("expected BLOB, found {:?}", other.data_type()))),
        }
    }
}

/// A struct whose fields map one-to-one onto SQL columns.
pub(crate) trait SqlRecord: Sized {
    /// `(column name, column type)` per field, in declaration order.
    const COLUMNS: &'static [(&'static str, &'static str)];
    fn values(&self) -> Vec<Value>;
    fn from_row(row: &rusqlite::Row) -> Result<Self>;
}

/// Declares a key or value record: a plain struct plus its [`SqlRecord`]
/// column mapping, derived from the field names and types. Keeping the
/// schema in the struct declaration removes the string-keyed indirection a
/// dynamically-typed parameter map would need and catches missing fields at
/// compile time.
macro_rules! sql_record {
    ($(#[$attr:meta])* pub struct $name:ident { $(pub $field:ident: $ty:ty,)* }) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Default)]
        pub struct $name {
            $(pub $field: $ty,)*
        }

        impl crate::cache::SqlRecord for $name {
            const COLUMNS: &'static [(&'static str, &'static str)] = &[
                $((stringify!($field), <$ty as crate::cache::SqlField>::SQL_TYPE),)*
            ];

            fn values(&self) -> Vec<rusqlite::types::Value> {
                vec![$(crate::cache::SqlField::to_value(&self.$field),)*]
            }

            fn from_row(row: &rusqlite::Row) -> crate::error::Result<Self> {
                let mut column = 0usize;
                $(
                    let $field = <$ty as crate::cache::SqlField>::from_value(
                        row.get_ref(column).map_err(crate::error::Error::from)?)?;
                    column += 1;
                )*
                let _ = column;
                Ok($name { $($field,)* })
            }
        }
    };
}
pub(crate) use sql_record;

sql_record! {
    /// Fields uniquely describing a device installation. Two devices with
    /// the same fingerprint are assumed to admit the same tuned parameters.
    pub struct DeviceKey {
        pub platform_name: String,
        pub device_name: String,
        pub device_vendor_id: u32,
        pub driver_version: String,
    }
}

impl DeviceKey {
    pub fn for_device(device: &Device) -> Result<DeviceKey> {
        let device_vendor_id = match device.info(DeviceInfo::VendorId)? {
            DeviceInfoResult::VendorId(id) => id,
            _ => return Err(Error::Internal("unexpected device info result".into())),
        };
        let driver_version = match device.info(DeviceInfo::DriverVersion)? {
            DeviceInfoResult::DriverVersion(v) => v,
            _ => return Err(Error::Internal("unexpected device info result".into())),
        };
        Ok(DeviceKey {
            platform_name: util::platform_name(device)?,
            device_name: device.name()?,
            device_vendor_id,
            driver_version,
        })
    }
}

/// An open cache database. The process normally holds exactly one of these
/// behind the lazy singleton below; tests open their own against a
/// temporary directory.
pub(crate) struct Cache {
    conn: Connection,
}

impl Cache {
    pub fn open(path: &Path) -> Result<Cache> {
        let conn = Connection::open(path)?;
        Ok(Cache { conn })
    }

    fn create_table<K: SqlRecord, V: SqlRecord>(&self, table: &str) -> Result<()> {
        let mut ddl = format!("CREATE TABLE IF NOT EXISTS {} (", table);
        for &(name, sql_type) in K::COLUMNS.iter().chain(V::COLUMNS) {
            ddl.push_str(name);
            ddl.push(' ');
            ddl.push_str(sql_type);
            ddl.push_str(", ");
        }
        ddl.push_str("PRIMARY KEY(");
        for (i, &(name, _)) in K::COLUMNS.iter().enumerate() {
            if i > 0 {
                ddl.push_str(", ");
            }
            ddl.push_str(name);
        }
        ddl.push_str("))");
        self.conn.execute(&ddl, [])?;
        Ok(())
    }

    /// Fetches the value record for `key`, or `None` if no row exists.
    pub fn lookup<K: SqlRecord, V: SqlRecord>(&self, table: &str, key: &K) -> Result<Option<V>> {
        self.create_table::<K, V>(table)?;

        let mut query = String::from("SELECT ");
        for (i, &(name, _)) in V::COLUMNS.iter().enumerate() {
            if i > 0 {
                query.push_str(", ");
            }
            query.push_str(name);
        }
        query.push_str(&format!(" FROM {} WHERE ", table));
        for (i, &(name, _)) in K::COLUMNS.iter().enumerate() {
            if i > 0 {
                query.push_str(" AND ");
            }
            query.push_str(name);
            query.push_str("=?");
        }

        let mut stmt = self.conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(key.values()))?;
        match rows.next()? {
            Some(row) => Ok(Some(V::from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Inserts or replaces the row for `key`.
    pub fn store<K: SqlRecord, V: SqlRecord>(&self, table: &str, key: &K, value: &V) -> Result<()> {
        self.create_table::<K, V>(table)?;

        let mut sql = format!("INSERT OR REPLACE INTO {} (", table);
        for (i, &(name, _)) in K::COLUMNS.iter().chain(V::COLUMNS).enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(name);
        }
        sql.push_str(") VALUES (");
        let total = K::COLUMNS.len() + V::COLUMNS.len();
        for i in 0..total {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push('?');
        }
        sql.push(')');

        let mut params = key.values();
        params.extend(value.values());
        self.conn.execute(&sql, rusqlite::params_from_iter(params))?;
        Ok(())
    }
}

/// `<algorithm>_v<version>`: schema changes bump the version and land in a
/// fresh table instead of colliding with old entries.
pub(crate) fn table_name(algorithm: &str, version: u32) -> String {
    format!("{}_v{}", algorithm, version)
}

/// Resolves the cache directory: `CLOGS_CACHE_DIR` if set, else the
/// platform default. The directory is created if missing; creation failure
/// is deferred to the first write.
fn cache_dir() -> PathBuf {
    if let Some(dir) = env::var_os("CLOGS_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    #[cfg(windows)]
    let dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clogs")
        .join("cache");
    #[cfg(not(windows))]
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clogs")
        .join("cache");
    if let Err(err) = fs::create_dir_all(&dir) {
        log::warn!("could not create cache directory {}: {}", dir.display(), err);
    }
    dir
}

lazy_static! {
    static ref SHARED: Mutex<Option<Cache>> = Mutex::new(None);
}

fn with_shared<R>(f: impl FnOnce(&Cache) -> Result<R>) -> Result<R> {
    let mut guard = SHARED
        .lock()
        .map_err(|_| Error::Cache("cache connection poisoned".into()))?;
    if guard.is_none() {
        let path = cache_dir().join("cache.sqlite");
        *guard = Some(Cache::open(&path)?);
    }
    f(guard.as_ref().expect("just initialized"))
}

/// Looks up a record in the process-wide cache database.
pub(crate) fn lookup<K: SqlRecord, V: SqlRecord>(
    algorithm: &str,
    version: u32,
    key: &K,
) -> Result<Option<V>> {
    let table = table_name(algorithm, version);
    let found = with_shared(|cache| cache.lookup(&table, key))?;
    log::debug!(
        "cache {} for {}",
        if found.is_some() { "hit" } else { "miss" },
        table,
    );
    Ok(found)
}

/// Stores a record in the process-wide cache database.
pub(crate) fn store<K: SqlRecord, V: SqlRecord>(
    algorithm: &str,
    version: u32,
    key: &K,
    value: &V,
) -> Result<()> {
    let table = table_name(algorithm, version);
    with_shared(|cache| cache.store(&table, key, value))
}

/// Drops the shared connection so the next use re-resolves the cache
/// directory. Teardown hook for tests; production code never needs it.
#[allow(dead_code)]
pub(crate) fn reset() {
    if let Ok(mut guard) = SHARED.lock() {
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    sql_record! {
        pub struct TestKey {
            pub device_name: String,
            pub element_type: String,
        }
    }

    sql_record! {
        pub struct TestRecord {
            pub work_group_size: usize,
            pub flags: u32,
            pub program_binary: Vec<u8>,
        }
    }

    fn temp_cache() -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(&dir.path().join("cache.sqlite")).unwrap();
        (dir, cache)
    }

    #[test]
    fn round_trip_every_field() {
        let (_dir, cache) = temp_cache();
        let key = TestKey {
            device_name: "Test Device".into(),
            element_type: "uint4".into(),
        };
        let record = TestRecord {
            work_group_size: 256,
            flags: 7,
            program_binary: vec![0, 1, 2, 254, 255],
        };
        cache.store("test_v1", &key, &record).unwrap();
        let back: TestRecord = cache.lookup("test_v1", &key).unwrap().unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn missing_row_is_none_not_error() {
        let (_dir, cache) = temp_cache();
        let key = TestKey {
            device_name: "Test Device".into(),
            element_type: "uint".into(),
        };
        let found: Option<TestRecord> = cache.lookup("test_v1", &key).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn replace_overwrites() {
        let (_dir, cache) = temp_cache();
        let key = TestKey {
            device_name: "d".into(),
            element_type: "int".into(),
        };
        let first = TestRecord { work_group_size: 64, flags: 0, program_binary: vec![1] };
        let second = TestRecord { work_group_size: 128, flags: 1, program_binary: vec![] };
        cache.store("test_v1", &key, &first).unwrap();
        cache.store("test_v1", &key, &second).unwrap();
        let back: TestRecord = cache.lookup("test_v1", &key).unwrap().unwrap();
        assert_eq!(back, second);
    }

    #[test]
    fn keys_are_discriminating() {
        let (_dir, cache) = temp_cache();
        let int_key = TestKey { device_name: "d".into(), element_type: "int".into() };
        let long_key = TestKey { device_name: "d".into(), element_type: "long".into() };
        let record = TestRecord { work_group_size: 32, flags: 2, program_binary: vec![9] };
        cache.store("test_v1", &int_key, &record).unwrap();
        let found: Option<TestRecord> = cache.lookup("test_v1", &long_key).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn table_names_are_versioned() {
        assert_eq!(table_name("scan", 1), "scan_v1");
        assert_eq!(table_name("radixsort", 2), "radixsort_v2");
    }
}
