use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::engine::{BookingPolicy, Engine};
use crate::limits::*;
use crate::maintenance;
use crate::notify::NotifyHub;

/// One engine per coworking space, loaded on first use. The space is the
/// database name of the pgwire connection; its WAL is `<data_dir>/<space>.wal`.
pub struct SpaceManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    policy: BookingPolicy,
}

/// The space name doubles as the WAL file stem, so it must already be one:
/// distinct names map to distinct files.
fn file_stem(space: &str) -> io::Result<&str> {
    if space.len() > MAX_SPACE_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "space name too long"));
    }
    if space.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty space name"));
    }
    if !space
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "space name may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(space)
}

impl SpaceManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, policy: BookingPolicy) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            policy,
        }
    }

    pub fn get_or_create(&self, space: &str) -> io::Result<Arc<Engine>> {
        let stem = file_stem(space)?;
        if let Some(engine) = self.engines.get(stem) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_SPACES {
            return Err(io::Error::other("too many spaces"));
        }

        // Two connections may race to open the same space; the entry lock
        // makes sure only one of them replays the WAL.
        let engine = match self.engines.entry(stem.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(e) => {
                let wal_path = self.data_dir.join(format!("{stem}.wal"));
                let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()), self.policy)?);
                e.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(maintenance::run_compactor(engine.clone(), self.compact_threshold));
        metrics::gauge!(crate::observability::SPACES_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("space {stem} loaded");
        Ok(engine)
    }

    pub fn loaded(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("coworkd_test_space").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> SpaceManager {
        SpaceManager::new(dir, 1000, BookingPolicy::default())
    }

    #[tokio::test]
    async fn spaces_are_isolated() {
        let sm = manager(test_data_dir("isolation"));
        let tunis = sm.get_or_create("tunis").unwrap();
        let sfax = sm.get_or_create("sfax").unwrap();

        let rid = Ulid::new();
        tunis
            .create_resource(&Caller::Admin, rid, "Desk A1".into(), ResourceKind::Desk, None)
            .await
            .unwrap();

        assert_eq!(tunis.list_resources().await.len(), 1);
        assert!(sfax.list_resources().await.is_empty());
        assert!(matches!(
            sfax.is_available(rid, 1_737_363_600_000, 1_737_367_200_000).await,
            Err(crate::engine::EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn wal_created_lazily() {
        let dir = test_data_dir("lazy");
        let sm = manager(dir.clone());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _engine = sm.get_or_create("la_marsa").unwrap();
        assert!(dir.join("la_marsa.wal").exists());
        assert_eq!(sm.loaded(), 1);
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let sm = manager(test_data_dir("same"));
        let a = sm.get_or_create("tunis").unwrap();
        let b = sm.get_or_create("tunis").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn unsafe_names_rejected() {
        let dir = test_data_dir("unsafe");
        let sm = manager(dir.clone());
        for name in ["../evil", "../..", "acme.hq", "la marsa", ""] {
            let err = sm.get_or_create(name).err().unwrap();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{name}");
        }
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        assert_eq!(sm.loaded(), 0);
    }

    #[tokio::test]
    async fn similar_names_get_distinct_engines() {
        let sm = manager(test_data_dir("similar"));
        let plain = sm.get_or_create("acmehq").unwrap();
        let dashed = sm.get_or_create("acme-hq").unwrap();
        let underscored = sm.get_or_create("acme_hq").unwrap();
        assert!(!Arc::ptr_eq(&plain, &dashed));
        assert!(!Arc::ptr_eq(&plain, &underscored));
        assert!(!Arc::ptr_eq(&dashed, &underscored));
        assert!(sm.get_or_create("acme.hq").is_err());

        plain
            .create_resource(&Caller::Admin, Ulid::new(), "Desk A1".into(), ResourceKind::Desk, None)
            .await
            .unwrap();
        assert!(dashed.list_resources().await.is_empty());
        assert!(underscored.list_resources().await.is_empty());
    }

    #[tokio::test]
    async fn name_too_long() {
        let sm = manager(test_data_dir("too_long"));
        let err = sm
            .get_or_create(&"x".repeat(MAX_SPACE_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("space name too long"));
    }
}
