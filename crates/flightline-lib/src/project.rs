//! Project configuration and pipeline orchestration
//!
//! A project is one folder: a JSON config file, a `raw_data` tree of staged
//! device downloads and a single SQLite store. [`FlightlineProject`] ties
//! them together and exposes the operations the CLI runs, from staging a
//! device export through segmentation and the per-load layer rebuilds.
//!
//! # Architecture
//!
//! - [`ProjectConfig`] is the serde layer over `flightline_project.json`;
//!   missing fields fall back to defaults so old configs keep loading.
//! - Every mutation runs inside [`SpatialStore::edit_session`], one session
//!   per pipeline stage, so a failed stage rolls back without poisoning the
//!   stages before it.
//! - Rebuilds compute before they delete: a load whose build fails keeps
//!   its previous rows.

use crate::ingest::{
    archive_batch, classify_source, valid_source_folders, BatchFolder, SourceKind, TrackReader,
};
use crate::model::{LoadSite, LoadSummary, Machine};
use crate::segmentation::{assign_load_numbers, SegmentationConfig};
use crate::store::SpatialStore;
use crate::summary::summarize_segments;
use crate::{coverage, flight_path, DataError, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Config file name inside the project folder
pub const CONFIG_FILE: &str = "flightline_project.json";

fn default_raw_data_folder() -> String {
    "raw_data".to_string()
}

fn default_store_file() -> String {
    "flightline.sqlite".to_string()
}

fn default_op_day() -> String {
    Local::now().format("%d%m%Y").to_string()
}

fn default_site_ceiling() -> f64 {
    50.0
}

/// Project settings persisted as `flightline_project.json`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProjectConfig {
    /// Folder holding the config, the raw data tree and the store. Always
    /// reset to the folder the config was loaded from.
    #[serde(default)]
    pub project_folder: PathBuf,

    /// Raw data tree name, relative to the project folder
    #[serde(default = "default_raw_data_folder")]
    pub raw_data_folder: String,

    /// Store file name, relative to the project folder
    #[serde(default = "default_store_file")]
    pub store_file: String,

    /// Operational day staged batches belong to, `ddmmyyyy`
    #[serde(default = "default_op_day")]
    pub op_day: String,

    /// Device path the last export was read from
    #[serde(default)]
    pub last_source_location: String,

    /// Fallback altitude ceiling in meters for load sites without their own
    /// elevation trigger
    #[serde(default = "default_site_ceiling")]
    pub site_ceiling: f64,
}

impl ProjectConfig {
    /// Default config rooted at `folder`
    pub fn new(folder: &Path) -> Self {
        ProjectConfig {
            project_folder: folder.to_path_buf(),
            raw_data_folder: default_raw_data_folder(),
            store_file: default_store_file(),
            op_day: default_op_day(),
            last_source_location: String::new(),
            site_ceiling: default_site_ceiling(),
        }
    }

    /// Load the config from a project folder
    pub fn load(folder: &Path) -> Result<Self> {
        let path = folder.join(CONFIG_FILE);
        if !path.exists() {
            return Err(DataError::MissingConfig(path));
        }
        let mut config: ProjectConfig = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        config.project_folder = folder.to_path_buf();
        Ok(config)
    }

    /// Write the config back to its project folder
    pub fn save(&self) -> Result<()> {
        let path = self.project_folder.join(CONFIG_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Raw data tree under the project folder
    #[inline]
    pub fn raw_data_path(&self) -> PathBuf {
        self.project_folder.join(&self.raw_data_folder)
    }

    /// Store file under the project folder
    #[inline]
    pub fn store_path(&self) -> PathBuf {
        self.project_folder.join(&self.store_file)
    }
}

/// Row counts and sown area from one load's coverage rebuild
#[derive(Clone, Copy, Debug)]
pub struct CoverageReport {
    pub detailed: usize,
    pub merged: usize,
    pub buffered: usize,
    pub hectares: f64,
}

/// Rebuild outcome for one load
#[derive(Clone, Debug)]
pub struct LoadReport {
    pub load_number: i64,
    /// `None` when the load has no sowing points
    pub coverage: Option<CoverageReport>,
    pub flight_path_rows: usize,
    /// Whether a summary row was written
    pub summarized: bool,
}

/// Per-stage outcome of processing one device export
#[derive(Clone, Debug)]
pub struct ProcessReport {
    pub batch_id: String,
    pub staged_folder: PathBuf,
    pub kind: SourceKind,
    pub folders_read: usize,
    pub points_read: usize,
    pub points_inserted: usize,
    pub loads: Vec<LoadReport>,
}

/// An open project: config plus store
pub struct FlightlineProject {
    config: ProjectConfig,
    store: SpatialStore,
}

impl FlightlineProject {
    /// Create the folder layout, a default config and an empty store, then
    /// open the project. An existing config is kept as is.
    pub fn init(folder: &Path) -> Result<Self> {
        std::fs::create_dir_all(folder)?;
        let config = match ProjectConfig::load(folder) {
            Ok(existing) => existing,
            Err(DataError::MissingConfig(_)) => {
                let config = ProjectConfig::new(folder);
                config.save()?;
                config
            }
            Err(err) => return Err(err),
        };
        std::fs::create_dir_all(config.raw_data_path())?;
        let store = SpatialStore::open(&config.store_path())?;
        tracing::info!(folder = %folder.display(), "initialized project");
        Ok(FlightlineProject { config, store })
    }

    /// Open an existing project folder
    pub fn open(folder: &Path) -> Result<Self> {
        let config = ProjectConfig::load(folder)?;
        let store = SpatialStore::open(&config.store_path())?;
        Ok(FlightlineProject { config, store })
    }

    #[inline]
    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    #[inline]
    pub fn config_mut(&mut self) -> &mut ProjectConfig {
        &mut self.config
    }

    #[inline]
    pub fn store(&self) -> &SpatialStore {
        &self.store
    }

    #[inline]
    pub fn store_mut(&mut self) -> &mut SpatialStore {
        &mut self.store
    }

    fn require_machine(&self, machine_code: &str) -> Result<Machine> {
        self.store
            .machine(machine_code)?
            .ok_or_else(|| DataError::UnknownMachine(machine_code.to_string()))
    }

    /// Stage and ingest one device export, then rebuild every load it
    /// touched
    ///
    /// The export is copied to `raw_data/{machine}/{op_day}_{HHMM}` with the
    /// minute bumped past folders already staged, classified from its first
    /// valid data folder and read whole. Points already stored (same
    /// `src_id`) are skipped, segmentation assigns load numbers to the rest
    /// and every load the numbering touched gets its coverage, flight path
    /// and summary rebuilt. `download_time` defaults to the current wall
    /// clock `HHMM`.
    ///
    /// # Returns
    ///
    /// A per-stage report; a staged batch without data folders reports zero
    /// counts rather than failing, the copy is kept for inspection.
    pub fn process_export(
        &mut self,
        source: &Path,
        machine_code: &str,
        download_time: Option<&str>,
    ) -> Result<ProcessReport> {
        let machine = self.require_machine(machine_code)?;
        let requested_time = match download_time {
            Some(time) => time.to_string(),
            None => Local::now().format("%H%M").to_string(),
        };

        let mut batch = BatchFolder::new(
            &self.config.raw_data_path(),
            &machine.machine_code,
            &self.config.op_day,
            &requested_time,
        );
        batch.bump_until_free()?;
        if batch.download_time() != requested_time {
            tracing::warn!(
                requested = %requested_time,
                staged = %batch.download_time(),
                "download time already staged, bumped"
            );
        }
        batch.stage_from(source)?;

        let batch_id = batch.batch_id();
        let staged_folder = batch.folder();
        let folders = valid_source_folders(&staged_folder)?;
        let Some(first) = folders.first() else {
            tracing::warn!(folder = %staged_folder.display(), "staged batch holds no data");
            return Ok(ProcessReport {
                batch_id,
                staged_folder,
                kind: SourceKind::Unrecognized,
                folders_read: 0,
                points_read: 0,
                points_inserted: 0,
                loads: Vec::new(),
            });
        };
        let kind = classify_source(first)?;

        // Swath widths are only corrected for machines flagged active;
        // historic machines keep their recorded widths.
        let swath_translation = if machine.active {
            machine.swath_translation.clone()
        } else {
            BTreeMap::new()
        };
        let reader = TrackReader::new(
            kind,
            &machine.machine_code,
            &batch_id,
            machine.default_bucket_size,
            swath_translation,
        );
        let mut points = BTreeMap::new();
        for folder in &folders {
            points.extend(reader.read_folder(folder)?);
        }
        let points_read = points.len();
        let points_inserted = self
            .store
            .edit_session(|store| store.insert_new_points(&machine.machine_code, &points))?;

        let touched = self.segment_loads(&machine.machine_code)?;
        let mut loads = Vec::with_capacity(touched.len());
        for load_number in touched {
            loads.push(self.rebuild_load(&machine, load_number)?);
        }

        self.config.last_source_location = source.display().to_string();
        self.config.save()?;
        tracing::info!(
            batch_id = %batch_id,
            points_read,
            points_inserted,
            loads = loads.len(),
            "processed export"
        );
        Ok(ProcessReport {
            batch_id,
            staged_folder,
            kind,
            folders_read: folders.len(),
            points_read,
            points_inserted,
            loads,
        })
    }

    /// Assign load numbers to a machine's unnumbered points
    ///
    /// # Returns
    ///
    /// The distinct load numbers that received points, ascending.
    pub fn segment_loads(&mut self, machine_code: &str) -> Result<Vec<i64>> {
        let points = self.store.points_by_machine(machine_code)?;
        let sites = self.store.active_load_sites()?;
        let config = SegmentationConfig {
            site_ceiling: self.config.site_ceiling,
        };
        let assignments = assign_load_numbers(&points, &sites, &config);
        let touched: BTreeSet<i64> = assignments.values().copied().collect();
        let updated = self
            .store
            .edit_session(|store| store.assign_load_numbers(&assignments))?;
        tracing::info!(
            machine_code,
            points = points.len(),
            updated,
            loads = touched.len(),
            "segmented loads"
        );
        Ok(touched.into_iter().collect())
    }

    /// Rebuild one load's three coverage tables
    ///
    /// # Returns
    ///
    /// Row counts and hectares, or `None` when the load has no sowing
    /// points; either way the load's old coverage rows are gone.
    pub fn build_coverage(
        &mut self,
        machine_code: &str,
        load_number: i64,
    ) -> Result<Option<CoverageReport>> {
        let machine = self.require_machine(machine_code)?;
        let points = self
            .store
            .points_by_machine_load(&machine.machine_code, load_number)?;
        let build = coverage::build_coverage(&points, &machine.swath_translation)?;
        self.store.edit_session(|store| {
            store.delete_coverage_rows(&machine.machine_code, load_number)?;
            if let Some(build) = &build {
                store.insert_detailed_segments(&build.detailed)?;
                store.insert_merged_lines(&build.merged)?;
                store.insert_buffered_swaths(&build.buffered)?;
            }
            Ok(())
        })?;
        Ok(build.map(|build| CoverageReport {
            detailed: build.detailed.len(),
            merged: build.merged.len(),
            buffered: build.buffered.len(),
            hectares: build.hectares(),
        }))
    }

    /// Rebuild one load's flight path rows
    pub fn build_flight_path(&mut self, machine_code: &str, load_number: i64) -> Result<usize> {
        let points = self.store.points_by_machine_load(machine_code, load_number)?;
        let rows = flight_path::build_flight_path_rows(&points)?;
        self.store.edit_session(|store| {
            store.delete_flight_path_rows(machine_code, load_number)?;
            store.insert_flight_path_rows(&rows)
        })?;
        Ok(rows.len())
    }

    /// Recompute one load's summary row
    ///
    /// # Returns
    ///
    /// The stored summary, or `None` when the load has no detailed coverage
    /// rows to aggregate (nothing is written then).
    pub fn summarize_load(
        &mut self,
        machine_code: &str,
        load_number: i64,
    ) -> Result<Option<LoadSummary>> {
        let machine = self.require_machine(machine_code)?;
        let segments = self
            .store
            .detailed_segments(&machine.machine_code, load_number)?;
        let Some(summary) = summarize_segments(&segments, &machine, &self.config.raw_data_path())
        else {
            return Ok(None);
        };
        self.store
            .edit_session(|store| store.upsert_summary(&summary))?;
        Ok(Some(summary))
    }

    /// Coverage, flight path and summary for one load, in that order
    fn rebuild_load(&mut self, machine: &Machine, load_number: i64) -> Result<LoadReport> {
        let coverage = self.build_coverage(&machine.machine_code, load_number)?;
        let flight_path_rows = self.build_flight_path(&machine.machine_code, load_number)?;
        let summarized = self
            .summarize_load(&machine.machine_code, load_number)?
            .is_some();
        Ok(LoadReport {
            load_number,
            coverage,
            flight_path_rows,
            summarized,
        })
    }

    /// Merge several loads into the lowest of their numbers
    ///
    /// The machine's points in `loads` are renumbered to `min(loads)` and
    /// carry the earliest involved record's batch id; `bucket_size`
    /// overrides theirs when positive. Derived rows of every involved load
    /// are dropped, then the surviving load is rebuilt.
    pub fn combine_loads(
        &mut self,
        machine_code: &str,
        loads: &[i64],
        bucket_size: Option<i64>,
    ) -> Result<LoadReport> {
        let machine = self.require_machine(machine_code)?;
        let Some(&new_load) = loads.iter().min() else {
            return Err(DataError::DataIntegrityViolation {
                reason: format!("no loads requested for machine {}", machine.machine_code),
            });
        };
        let known: BTreeSet<i64> = self
            .store
            .machine_loads(&machine.machine_code)?
            .into_iter()
            .collect();
        let missing: Vec<i64> = loads
            .iter()
            .copied()
            .filter(|load| !known.contains(load))
            .collect();
        if !missing.is_empty() {
            return Err(DataError::UnknownLoads {
                machine: machine.machine_code.clone(),
                loads: missing,
            });
        }
        let batch_id = self
            .store
            .first_batch_for_loads(&machine.machine_code, loads)?
            .ok_or_else(|| DataError::DataIntegrityViolation {
                reason: format!(
                    "no batch id on loads {loads:?} of machine {}",
                    machine.machine_code
                ),
            })?;
        let bucket_override = bucket_size.filter(|&size| size > 0);

        self.store.edit_session(|store| {
            store.renumber_loads(
                &machine.machine_code,
                loads,
                new_load,
                &batch_id,
                bucket_override,
            )?;
            for &load in loads {
                store.delete_load_rows(&machine.machine_code, load)?;
            }
            Ok(())
        })?;
        tracing::info!(
            machine_code = %machine.machine_code,
            ?loads,
            new_load,
            "combined loads"
        );
        self.rebuild_load(&machine, new_load)
    }

    /// Renumber a machine's track from scratch and rebuild every load
    ///
    /// The repair entry point after load site or registry edits. The scan
    /// is deterministic, so a second run reproduces the same numbering and
    /// the same rows.
    pub fn recalculate_machine(&mut self, machine_code: &str) -> Result<Vec<LoadReport>> {
        let machine = self.require_machine(machine_code)?;
        self.store.edit_session(|store| {
            store.clear_load_numbers(&machine.machine_code)?;
            store.delete_machine_rows(&machine.machine_code)?;
            Ok(())
        })?;
        let touched = self.segment_loads(&machine.machine_code)?;
        let mut reports = Vec::with_capacity(touched.len());
        for load_number in touched {
            reports.push(self.rebuild_load(&machine, load_number)?);
        }
        tracing::info!(
            machine_code = %machine.machine_code,
            loads = reports.len(),
            "recalculated machine"
        );
        Ok(reports)
    }

    /// Remove one batch's rows from every working table and archive its
    /// staged folder
    ///
    /// # Returns
    ///
    /// Rows deleted and the archive path when the folder still existed.
    pub fn delete_batch(&mut self, batch_id: &str) -> Result<(usize, Option<PathBuf>)> {
        let deleted = self
            .store
            .edit_session(|store| store.delete_batch_rows(batch_id))?;
        let archived = archive_batch(&self.config.raw_data_path(), batch_id)?;
        tracing::info!(batch_id, deleted, archived = archived.is_some(), "deleted batch");
        Ok((deleted, archived))
    }

    /// Remove one load's coverage, flight path and summary rows
    ///
    /// Track points keep their load numbers, so the per-load operations can
    /// rebuild everything deleted here.
    ///
    /// # Returns
    ///
    /// The number of rows deleted.
    pub fn delete_machine_load(&mut self, machine_code: &str, load_number: i64) -> Result<usize> {
        let deleted = self
            .store
            .edit_session(|store| store.delete_load_rows(machine_code, load_number))?;
        tracing::info!(machine_code, load_number, deleted, "deleted load");
        Ok(deleted)
    }

    /// Swap every working table aside under the next backup number
    pub fn backup_data(&mut self) -> Result<u32> {
        self.store.backup_tables()
    }

    /// Drop the numbered backup tables accumulated by [`Self::backup_data`]
    pub fn cleanup_backups(&mut self) -> Result<Vec<String>> {
        self.store.cleanup_backup_tables()
    }

    // === Read surfaces and registry edits ===

    /// Machines in the registry
    pub fn registered_machines(&self) -> Result<Vec<Machine>> {
        self.store.machines()
    }

    /// Machine codes present in the track data, registered or not
    pub fn tracked_machines(&self) -> Result<Vec<String>> {
        self.store.distinct_machines()
    }

    /// Batch ids present in the track data
    pub fn batches(&self) -> Result<Vec<String>> {
        self.store.distinct_batches()
    }

    /// Load numbers present for one machine
    pub fn loads(&self, machine_code: &str) -> Result<Vec<i64>> {
        self.store.machine_loads(machine_code)
    }

    /// Register or update a machine
    ///
    /// The bucket size and sow rate must both be positive; the summary
    /// target calculations divide by each.
    pub fn add_machine(&mut self, machine: &Machine) -> Result<()> {
        if machine.default_bucket_size <= 0
            || machine.target_sow_rate <= 0.0
            || machine.target_sow_rate.is_nan()
        {
            return Err(DataError::DataIntegrityViolation {
                reason: format!(
                    "machine {} needs a positive bucket size and sow rate",
                    machine.machine_code
                ),
            });
        }
        self.store
            .edit_session(|store| store.upsert_machine(machine))
    }

    /// Register or update a load site
    pub fn add_load_site(&mut self, site: &LoadSite) -> Result<()> {
        self.store.edit_session(|store| store.upsert_load_site(site))
    }
}
