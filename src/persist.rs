//! Routing tables saved across restarts, one file per mode.
//!
//! A file holds a format version, the local contact and the remote contacts. Writes go to a
//! temporary file that replaces the previous one only once it is completely on disk.

use crate::{contact::Contact, error::PersistError, mode::Mode};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::task;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct PersistedTable {
    pub format_version: u32,
    pub local: Contact,
    #[serde(default)]
    pub contacts: Vec<Contact>,
}

/// File the routing table of `mode` is saved to. Only active and passive tables are saved.
pub(crate) fn table_path(dir: &Path, mode: Mode) -> Option<PathBuf> {
    let name = match mode {
        Mode::Active => "active-dht.dat",
        Mode::Passive => "passive-dht.dat",
        Mode::PassiveLeaf | Mode::Inactive => return None,
    };

    Some(dir.join(name))
}

pub(crate) fn save(path: &Path, table: &PersistedTable) -> Result<(), PersistError> {
    let bytes = serde_bencode::to_bytes(table)?;
    atomic_write(path, &bytes)?;
    Ok(())
}

/// Load a saved table. A missing file is not an error.
///
/// Contacts not seen for longer than `max_age` are dropped, and a table left without contacts is
/// not worth keeping.
pub(crate) fn load(
    path: &Path,
    min_version: u32,
    max_age: Duration,
) -> Result<Option<PersistedTable>, PersistError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    let mut table: PersistedTable = serde_bencode::from_bytes(&bytes)?;

    if table.format_version < min_version {
        return Err(PersistError::Outdated {
            found: table.format_version,
            required: min_version,
        });
    }

    table.contacts.retain(|c| c.age() <= max_age);

    if table.contacts.is_empty() {
        log::debug!("No fresh contacts left in {}", path.display());
    }

    Ok(Some(table))
}

pub(crate) fn delete(path: &Path) -> Result<(), PersistError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

pub(crate) async fn save_async(path: PathBuf, table: PersistedTable) -> Result<(), PersistError> {
    task::spawn_blocking(move || save(&path, &table))
        .await
        .map_err(|error| PersistError::Task(error.to_string()))?
}

pub(crate) async fn load_async(
    path: PathBuf,
    min_version: u32,
    max_age: Duration,
) -> Result<Option<PersistedTable>, PersistError> {
    task::spawn_blocking(move || load(&path, min_version, max_age))
        .await
        .map_err(|error| PersistError::Task(error.to_string()))?
}

pub(crate) async fn delete_async(path: PathBuf) -> Result<(), PersistError> {
    task::spawn_blocking(move || delete(&path))
        .await
        .map_err(|error| PersistError::Task(error.to_string()))?
}

fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");

    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(&tmp, path)?;
    sync_parent(path);

    Ok(())
}

// Makes the rename itself durable.
#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            dir.sync_all().ok();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ROUTE_TABLE_VERSION, test};
    use std::env;

    fn temp_dir() -> PathBuf {
        env::temp_dir().join(format!("gnutella-dht-{:016x}", rand::random::<u64>()))
    }

    fn table(contacts: Vec<Contact>) -> PersistedTable {
        PersistedTable {
            format_version: ROUTE_TABLE_VERSION,
            local: test::contact(test::node_id_with_prefix(0x01), 1),
            contacts,
        }
    }

    #[test]
    fn positive_save_and_load() {
        let dir = temp_dir();
        let path = table_path(&dir, Mode::Active).unwrap();
        let contacts = vec![
            test::contact(test::node_id_with_prefix(0x10), 2),
            test::contact(test::node_id_with_prefix(0x20), 3),
        ];

        save(&path, &table(contacts.clone())).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let loaded = load(&path, ROUTE_TABLE_VERSION, Duration::from_secs(60))
            .unwrap()
            .unwrap();

        assert_eq!(loaded.local.id, test::node_id_with_prefix(0x01));
        assert_eq!(loaded.contacts, contacts);
        assert_eq!(loaded.contacts[0].addr, test::dummy_socket_addr(2));

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn positive_missing_file() {
        let path = temp_dir().join("active-dht.dat");
        assert!(load(&path, 1, Duration::from_secs(60)).unwrap().is_none());
        delete(&path).unwrap();
    }

    #[test]
    fn negative_outdated_version() {
        let dir = temp_dir();
        let path = table_path(&dir, Mode::Passive).unwrap();
        save(
            &path,
            &table(vec![test::contact(test::node_id_with_prefix(0x10), 2)]),
        )
        .unwrap();

        assert!(matches!(
            load(&path, ROUTE_TABLE_VERSION + 1, Duration::from_secs(60)),
            Err(PersistError::Outdated { .. })
        ));

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn negative_stale_contacts_discarded() {
        let dir = temp_dir();
        let path = table_path(&dir, Mode::Active).unwrap();
        let mut stale = test::contact(test::node_id_with_prefix(0x10), 2);
        stale.last_seen = 1;

        let saved = table(vec![stale]);
        save(&path, &saved).unwrap();

        // The local identity outlives the contacts.
        let loaded = load(&path, ROUTE_TABLE_VERSION, Duration::from_secs(60))
            .unwrap()
            .unwrap();
        assert!(loaded.contacts.is_empty());
        assert_eq!(loaded.local.id, saved.local.id);
        assert_eq!(loaded.local.instance_id, saved.local.instance_id);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn negative_corrupted_file() {
        let dir = temp_dir();
        let path = table_path(&dir, Mode::Active).unwrap();
        fs::create_dir_all(&dir).unwrap();
        fs::write(&path, b"d14:format_versioni1e5:local").unwrap();

        assert!(matches!(
            load(&path, ROUTE_TABLE_VERSION, Duration::from_secs(60)),
            Err(PersistError::Bencode(_))
        ));

        delete(&path).unwrap();
        assert!(!path.exists());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn negative_leaf_tables_are_not_saved() {
        assert!(table_path(Path::new("."), Mode::PassiveLeaf).is_none());
        assert!(table_path(Path::new("."), Mode::Inactive).is_none());
    }
}
