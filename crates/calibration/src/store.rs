use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use core_types::CalibrationBundle;
use serde::{Deserialize, Serialize};
use vol_indicators::IndicatorState;

pub const SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_FILE: &str = "calibration.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedCalibration {
    pub version: u32,
    pub market_id: String,
    pub saved_at_ms: i64,
    pub bundle: CalibrationBundle,
    #[serde(default)]
    pub indicators: Option<IndicatorState>,
}

impl PersistedCalibration {
    pub fn new(
        market_id: &str,
        saved_at_ms: i64,
        bundle: CalibrationBundle,
        indicators: Option<IndicatorState>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            market_id: market_id.to_string(),
            saved_at_ms,
            bundle,
            indicators,
        }
    }
}

/// One directory per market under `root`, one JSON snapshot per directory.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    root: PathBuf,
}

impl CalibrationStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, market_id: &str) -> PathBuf {
        self.root.join(market_slug(market_id)).join(SNAPSHOT_FILE)
    }

    /// Creates the market directory and checks a file can be written there.
    pub fn check_writable(&self, market_id: &str) -> Result<()> {
        let dir = self.root.join(market_slug(market_id));
        fs::create_dir_all(&dir)
            .with_context(|| format!("create state dir {}", dir.display()))?;
        let marker = dir.join(".write_check");
        fs::write(&marker, b"ok").with_context(|| format!("write {}", marker.display()))?;
        let _ = fs::remove_file(&marker);
        Ok(())
    }

    pub fn save(&self, snapshot: &PersistedCalibration) -> Result<PathBuf> {
        let target = self.path_for(&snapshot.market_id);
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).with_context(|| format!("create state dir {}", dir.display()))?;
        }
        let tmp = target.with_extension("json.tmp");
        let payload =
            serde_json::to_vec_pretty(snapshot).context("serialize calibration snapshot")?;

        {
            let mut file = File::create(&tmp).context("create calibration tmp")?;
            file.write_all(&payload).context("write calibration tmp")?;
            file.sync_all().context("sync calibration tmp")?;
        }

        // The previous snapshot stays in place until the rename lands.
        if let Err(err) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(err)
                .with_context(|| format!("replace calibration file {}", target.display()));
        }
        Ok(target)
    }

    /// `Ok(None)` when nothing was saved yet. A snapshot that fails to parse,
    /// has an unknown version, or belongs to another market is an error.
    pub fn load(&self, market_id: &str) -> Result<Option<PersistedCalibration>> {
        let path = self.path_for(market_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        let snapshot: PersistedCalibration = serde_json::from_str(&raw)
            .with_context(|| format!("parse calibration snapshot {}", path.display()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            bail!(
                "calibration snapshot version {} unsupported (expected {SNAPSHOT_VERSION})",
                snapshot.version
            );
        }
        if snapshot.market_id != market_id {
            bail!(
                "calibration snapshot belongs to {}, not {market_id}",
                snapshot.market_id
            );
        }
        if let Some(ind) = &snapshot.indicators {
            if ind.market_id != market_id {
                bail!("indicator state belongs to {}, not {market_id}", ind.market_id);
            }
        }
        snapshot
            .bundle
            .validate()
            .context("persisted calibration bundle")?;
        Ok(Some(snapshot))
    }
}

/// Filesystem-safe market directory name.
pub fn market_slug(market_id: &str) -> String {
    let slug: String = market_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::Provenance;
    use vol_indicators::{IndicatorParams, ToxicityConfig};

    fn temp_store() -> CalibrationStore {
        let dir = std::env::temp_dir().join(format!("polyquote-store-{}", uuid::Uuid::new_v4()));
        CalibrationStore::new(dir)
    }

    #[test]
    fn missing_snapshot_loads_as_none() {
        let store = temp_store();
        assert!(matches!(store.load("0xabc"), Ok(None)));
    }

    #[test]
    fn save_then_load_restores_bundle_and_indicators() {
        let store = temp_store();
        let bundle = CalibrationBundle {
            dt_sample_s: 2.0,
            provenance: Provenance::MetaCalibrated,
            ..CalibrationBundle::default()
        };
        let params = IndicatorParams::new(&bundle, &ToxicityConfig::default());
        let (state, _) = IndicatorState::new("0xABC", &params).advance(&params, 1_000, 0.42, 0.0);
        let snap = PersistedCalibration::new("0xABC", 5_000, bundle, Some(state));

        let path = store.save(&snap).unwrap();
        assert!(path.ends_with("0xabc/calibration.json"));
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = store.load("0xABC").unwrap().unwrap();
        assert_eq!(loaded, snap);

        // Second save replaces the first.
        let snap2 = PersistedCalibration { saved_at_ms: 9_000, ..snap };
        store.save(&snap2).unwrap();
        assert_eq!(store.load("0xABC").unwrap().unwrap().saved_at_ms, 9_000);
        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn corrupt_or_foreign_snapshot_is_an_error() {
        let store = temp_store();
        store.check_writable("m1").unwrap();
        fs::write(store.path_for("m1"), b"{not json").unwrap();
        assert!(store.load("m1").is_err());

        let foreign = PersistedCalibration::new("m2", 0, CalibrationBundle::default(), None);
        let raw = serde_json::to_string(&foreign).unwrap();
        fs::write(store.path_for("m1"), raw).unwrap();
        assert!(store.load("m1").is_err());
        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn failed_replace_keeps_what_is_on_disk() {
        let store = temp_store();
        let snap = PersistedCalibration::new("m1", 1_000, CalibrationBundle::default(), None);
        let target = store.path_for("m1");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("keep"), b"previous").unwrap();

        let err = store.save(&snap).unwrap_err();
        assert!(format!("{err:#}").contains("replace calibration file"));
        assert_eq!(fs::read(target.join("keep")).unwrap(), b"previous");
        assert!(!target.with_extension("json.tmp").exists());
        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn slug_is_filesystem_safe() {
        assert_eq!(market_slug("Will X/Y happen?"), "will_x_y_happen_");
        assert_eq!(market_slug(""), "unnamed");
    }
}
