//! SQLite-backed spatial table store
//!
//! One file holds every working table plus the machine and load-site
//! registries. Geometries are stored as JSON renderings of the `geo` types
//! in a TEXT column and timestamps as `%Y-%m-%dT%H:%M:%S` strings, which
//! sort chronologically under SQLite's default collation. Machine codes
//! compare case-insensitively.
//!
//! # Architecture
//!
//! - Working tables (`track_points`, the three coverage tables,
//!   `flight_paths`, `load_summary`) are rebuilt by processing and swapped
//!   aside wholesale by [`SpatialStore::backup_tables`].
//! - Registry tables (`machines`, `load_sites`) survive backups.
//! - Multi-statement mutations run through [`SpatialStore::edit_session`].

use crate::model::{
    BucketState, BufferedSwath, CoverageSegment, DetailedSegment, FlightPathRow, LoadSite,
    LoadSummary, Machine, MergedLine, TrackPoint, DATE_TIME_FORMAT,
};
use crate::Result;
use chrono::NaiveDateTime;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Tables rebuilt by processing, in backup/delete order
const WORKING_TABLES: [&str; 6] = [
    "track_points",
    "coverage_detailed",
    "coverage_lines",
    "coverage_buffered",
    "flight_paths",
    "load_summary",
];

/// Per-load derived tables, cleared before a rebuild
const DERIVED_TABLES: [&str; 5] = [
    "coverage_detailed",
    "coverage_lines",
    "coverage_buffered",
    "flight_paths",
    "load_summary",
];

const COVERAGE_TABLES: [&str; 3] = ["coverage_detailed", "coverage_lines", "coverage_buffered"];

const POINT_COLUMNS: &str = "id, src_id, date_time, speed, heading, altitude, width, \
     machine_code, bucket_size, load_number, batch_id, bucket_state, geom";

const COVERAGE_COLUMNS: &str = "src_id, date_time, speed, heading, altitude, width, \
     machine_code, bucket_size, load_number, batch_id, bucket_state, \
     coverage_rate, hectares, distance, seconds, line_number, geom";

const SUMMARY_COLUMNS: &str = "machine_code, batch_id, load_number, start_time, end_time, \
     bucket_size, sum_hectares, coverage_rate, average_speed, runout_time, \
     distance_spreading, dir_location, target_speed";

fn format_time(value: NaiveDateTime) -> String {
    value.format(DATE_TIME_FORMAT).to_string()
}

fn parse_time(value: &str) -> Result<NaiveDateTime> {
    Ok(NaiveDateTime::parse_from_str(value, DATE_TIME_FORMAT)?)
}

fn geom_to_sql<G: Serialize>(geom: &G) -> Result<String> {
    Ok(serde_json::to_string(geom)?)
}

fn geom_from_sql<G: DeserializeOwned>(text: &str) -> Result<G> {
    Ok(serde_json::from_str(text)?)
}

fn read_point(row: &Row) -> Result<TrackPoint> {
    Ok(TrackPoint {
        id: row.get(0)?,
        src_id: row.get(1)?,
        date_time: parse_time(&row.get::<_, String>(2)?)?,
        speed: row.get(3)?,
        heading: row.get(4)?,
        altitude: row.get(5)?,
        width: row.get(6)?,
        machine_code: row.get(7)?,
        bucket_size: row.get(8)?,
        load_number: row.get(9)?,
        batch_id: row.get(10)?,
        bucket_state: BucketState::from(row.get::<_, i64>(11)?),
        geom: geom_from_sql(&row.get::<_, String>(12)?)?,
    })
}

fn read_coverage<G: DeserializeOwned>(row: &Row) -> Result<CoverageSegment<G>> {
    Ok(CoverageSegment {
        src_id: row.get(0)?,
        date_time: parse_time(&row.get::<_, String>(1)?)?,
        speed: row.get(2)?,
        heading: row.get(3)?,
        altitude: row.get(4)?,
        width: row.get(5)?,
        machine_code: row.get(6)?,
        bucket_size: row.get(7)?,
        load_number: row.get(8)?,
        batch_id: row.get(9)?,
        bucket_state: BucketState::from(row.get::<_, i64>(10)?),
        coverage_rate: row.get(11)?,
        hectares: row.get(12)?,
        distance: row.get(13)?,
        seconds: row.get(14)?,
        line_number: row.get(15)?,
        geom: geom_from_sql(&row.get::<_, String>(16)?)?,
    })
}

fn read_summary(row: &Row) -> Result<LoadSummary> {
    Ok(LoadSummary {
        machine_code: row.get(0)?,
        batch_id: row.get(1)?,
        load_number: row.get(2)?,
        start_time: parse_time(&row.get::<_, String>(3)?)?,
        end_time: parse_time(&row.get::<_, String>(4)?)?,
        bucket_size: row.get(5)?,
        sum_hectares: row.get(6)?,
        coverage_rate: row.get(7)?,
        average_speed: row.get(8)?,
        runout_time: row.get(9)?,
        distance_spreading: row.get(10)?,
        dir_location: row.get(11)?,
        target_speed: row.get(12)?,
    })
}

fn read_machine(row: &Row) -> Result<Machine> {
    Ok(Machine {
        machine_code: row.get(0)?,
        company: row.get(1)?,
        pilot: row.get(2)?,
        default_bucket_size: row.get(3)?,
        target_sow_rate: row.get(4)?,
        swath_translation: serde_json::from_str(&row.get::<_, String>(5)?)?,
        active: row.get(6)?,
    })
}

fn read_load_site(row: &Row) -> Result<LoadSite> {
    Ok(LoadSite {
        name: row.get(0)?,
        active: row.get(1)?,
        elevation_trigger: row.get(2)?,
        geom: geom_from_sql(&row.get::<_, String>(3)?)?,
    })
}

/// SQLite-backed store for track, coverage and registry tables
pub struct SpatialStore {
    conn: Connection,
}

impl SpatialStore {
    /// Open (or create) the store file and ensure the schema exists
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = SpatialStore { conn };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS track_points (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                src_id TEXT NOT NULL,
                date_time TEXT NOT NULL,
                speed REAL NOT NULL,
                heading REAL NOT NULL,
                altitude REAL NOT NULL,
                width REAL NOT NULL,
                machine_code TEXT NOT NULL COLLATE NOCASE,
                bucket_size INTEGER NOT NULL,
                load_number INTEGER,
                batch_id TEXT NOT NULL,
                bucket_state INTEGER NOT NULL,
                geom TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_track_points_machine_time
                ON track_points(machine_code, date_time);
            CREATE INDEX IF NOT EXISTS idx_track_points_batch
                ON track_points(batch_id);

            CREATE TABLE IF NOT EXISTS flight_paths (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_code TEXT NOT NULL COLLATE NOCASE,
                load_number INTEGER NOT NULL,
                batch_id TEXT NOT NULL,
                line_number INTEGER NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                geom TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_flight_paths_machine_load
                ON flight_paths(machine_code, load_number);

            CREATE TABLE IF NOT EXISTS load_summary (
                machine_code TEXT NOT NULL COLLATE NOCASE,
                batch_id TEXT NOT NULL,
                load_number INTEGER NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                bucket_size INTEGER NOT NULL,
                sum_hectares REAL NOT NULL,
                coverage_rate REAL NOT NULL,
                average_speed REAL NOT NULL,
                runout_time REAL NOT NULL,
                distance_spreading REAL NOT NULL,
                dir_location TEXT NOT NULL,
                target_speed REAL NOT NULL,
                PRIMARY KEY (machine_code, load_number)
            );

            CREATE TABLE IF NOT EXISTS machines (
                machine_code TEXT PRIMARY KEY COLLATE NOCASE,
                company TEXT,
                pilot TEXT,
                default_bucket_size INTEGER NOT NULL,
                target_sow_rate REAL NOT NULL,
                swath_translation TEXT NOT NULL,
                active INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS load_sites (
                name TEXT PRIMARY KEY,
                active INTEGER NOT NULL,
                elevation_trigger REAL,
                geom TEXT NOT NULL
            );
        "#,
        )?;

        for table in COVERAGE_TABLES {
            self.conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    src_id TEXT NOT NULL,
                    date_time TEXT NOT NULL,
                    speed REAL NOT NULL,
                    heading REAL NOT NULL,
                    altitude REAL NOT NULL,
                    width REAL NOT NULL,
                    machine_code TEXT NOT NULL COLLATE NOCASE,
                    bucket_size INTEGER NOT NULL,
                    load_number INTEGER NOT NULL,
                    batch_id TEXT NOT NULL,
                    bucket_state INTEGER NOT NULL,
                    coverage_rate REAL NOT NULL,
                    hectares REAL NOT NULL,
                    distance REAL NOT NULL,
                    seconds REAL NOT NULL,
                    line_number INTEGER NOT NULL,
                    geom TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_machine_load
                    ON {table}(machine_code, load_number);
                CREATE INDEX IF NOT EXISTS idx_{table}_batch
                    ON {table}(batch_id);
            "#
            ))?;
        }

        Ok(())
    }

    /// Run `f` inside a transaction, committing on `Ok` and rolling back on
    /// error. Sessions do not nest.
    pub fn edit_session<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.conn.execute_batch("BEGIN")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    }

    // === Track points ===

    /// Insert points whose `src_id` is not already present for the machine.
    ///
    /// # Returns
    ///
    /// The number of rows actually inserted.
    pub fn insert_new_points(
        &mut self,
        machine_code: &str,
        points: &BTreeMap<String, TrackPoint>,
    ) -> Result<usize> {
        let existing = self.existing_src_ids(machine_code)?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO track_points (src_id, date_time, speed, heading, altitude, width, \
             machine_code, bucket_size, load_number, batch_id, bucket_state, geom) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?;
        let mut inserted = 0;
        for (src_id, point) in points {
            if existing.contains(src_id) {
                continue;
            }
            stmt.execute(params![
                point.src_id,
                format_time(point.date_time),
                point.speed,
                point.heading,
                point.altitude,
                point.width,
                point.machine_code,
                point.bucket_size,
                point.load_number,
                point.batch_id,
                i64::from(point.bucket_state),
                geom_to_sql(&point.geom)?,
            ])?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Source keys already stored for a machine
    pub fn existing_src_ids(&self, machine_code: &str) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT src_id FROM track_points WHERE machine_code = ?1")?;
        let ids = stmt
            .query_map(params![machine_code], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// Full track of one machine, ordered by time
    pub fn points_by_machine(&self, machine_code: &str) -> Result<Vec<TrackPoint>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {POINT_COLUMNS} FROM track_points \
             WHERE machine_code = ?1 ORDER BY date_time, id"
        ))?;
        let mut rows = stmt.query(params![machine_code])?;
        let mut points = Vec::new();
        while let Some(row) = rows.next()? {
            points.push(read_point(row)?);
        }
        Ok(points)
    }

    /// Track of one machine and load, ordered by time
    pub fn points_by_machine_load(
        &self,
        machine_code: &str,
        load_number: i64,
    ) -> Result<Vec<TrackPoint>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {POINT_COLUMNS} FROM track_points \
             WHERE machine_code = ?1 AND load_number = ?2 ORDER BY date_time, id"
        ))?;
        let mut rows = stmt.query(params![machine_code, load_number])?;
        let mut points = Vec::new();
        while let Some(row) = rows.next()? {
            points.push(read_point(row)?);
        }
        Ok(points)
    }

    /// Write fresh load-number assignments keyed by point id
    pub fn assign_load_numbers(&mut self, assignments: &BTreeMap<i64, i64>) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare("UPDATE track_points SET load_number = ?1 WHERE id = ?2")?;
        let mut updated = 0;
        for (id, load_number) in assignments {
            updated += stmt.execute(params![load_number, id])?;
        }
        Ok(updated)
    }

    /// Renumber every point of `loads` to `new_load`, rewriting the batch id
    /// and optionally the bucket size
    pub fn renumber_loads(
        &mut self,
        machine_code: &str,
        loads: &[i64],
        new_load: i64,
        batch_id: &str,
        bucket_size: Option<i64>,
    ) -> Result<usize> {
        if loads.is_empty() {
            return Ok(0);
        }
        let mut values: Vec<rusqlite::types::Value> =
            vec![new_load.into(), batch_id.to_string().into()];
        let set_clause = match bucket_size {
            Some(size) => {
                values.push(size.into());
                "load_number = ?1, batch_id = ?2, bucket_size = ?3"
            }
            None => "load_number = ?1, batch_id = ?2",
        };
        let machine_index = values.len() + 1;
        values.push(machine_code.to_string().into());
        values.extend(loads.iter().map(|load| rusqlite::types::Value::from(*load)));

        let placeholders = (machine_index + 1..machine_index + 1 + loads.len())
            .map(|n| format!("?{n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE track_points SET {set_clause} \
             WHERE machine_code = ?{machine_index} AND load_number IN ({placeholders})"
        );
        let updated = self.conn.execute(&sql, params_from_iter(values))?;
        Ok(updated)
    }

    /// Clear every load number for a machine; returns the row count touched
    pub fn clear_load_numbers(&mut self, machine_code: &str) -> Result<usize> {
        let updated = self.conn.execute(
            "UPDATE track_points SET load_number = NULL WHERE machine_code = ?1",
            params![machine_code],
        )?;
        Ok(updated)
    }

    /// Earliest batch id among the given loads of a machine
    pub fn first_batch_for_loads(
        &self,
        machine_code: &str,
        loads: &[i64],
    ) -> Result<Option<String>> {
        if loads.is_empty() {
            return Ok(None);
        }
        let placeholders = (2..2 + loads.len())
            .map(|n| format!("?{n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut values: Vec<rusqlite::types::Value> = vec![machine_code.to_string().into()];
        values.extend(loads.iter().map(|load| rusqlite::types::Value::from(*load)));
        let batch = self
            .conn
            .query_row(
                &format!(
                    "SELECT batch_id FROM track_points \
                     WHERE machine_code = ?1 AND load_number IN ({placeholders}) \
                     ORDER BY date_time, id LIMIT 1"
                ),
                params_from_iter(values),
                |row| row.get(0),
            )
            .optional()?;
        Ok(batch)
    }

    // === Coverage tables ===

    fn insert_coverage_rows<G: Serialize>(
        &mut self,
        table: &str,
        rows: &[CoverageSegment<G>],
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(&format!(
            "INSERT INTO {table} ({COVERAGE_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        ))?;
        for row in rows {
            stmt.execute(params![
                row.src_id,
                format_time(row.date_time),
                row.speed,
                row.heading,
                row.altitude,
                row.width,
                row.machine_code,
                row.bucket_size,
                row.load_number,
                row.batch_id,
                i64::from(row.bucket_state),
                row.coverage_rate,
                row.hectares,
                row.distance,
                row.seconds,
                row.line_number,
                geom_to_sql(&row.geom)?,
            ])?;
        }
        Ok(())
    }

    fn coverage_rows<G: DeserializeOwned>(
        &self,
        table: &str,
        machine_code: &str,
        load_number: i64,
        order: &str,
    ) -> Result<Vec<CoverageSegment<G>>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COVERAGE_COLUMNS} FROM {table} \
             WHERE machine_code = ?1 AND load_number = ?2 ORDER BY {order}"
        ))?;
        let mut rows = stmt.query(params![machine_code, load_number])?;
        let mut segments = Vec::new();
        while let Some(row) = rows.next()? {
            segments.push(read_coverage(row)?);
        }
        Ok(segments)
    }

    pub fn insert_detailed_segments(&mut self, segments: &[DetailedSegment]) -> Result<()> {
        self.insert_coverage_rows("coverage_detailed", segments)
    }

    pub fn insert_merged_lines(&mut self, lines: &[MergedLine]) -> Result<()> {
        self.insert_coverage_rows("coverage_lines", lines)
    }

    pub fn insert_buffered_swaths(&mut self, swaths: &[BufferedSwath]) -> Result<()> {
        self.insert_coverage_rows("coverage_buffered", swaths)
    }

    /// Detailed segments of one load, ordered by time
    pub fn detailed_segments(
        &self,
        machine_code: &str,
        load_number: i64,
    ) -> Result<Vec<DetailedSegment>> {
        self.coverage_rows(
            "coverage_detailed",
            machine_code,
            load_number,
            "date_time, id",
        )
    }

    /// Merged lines of one load, ordered by line number
    pub fn merged_lines(&self, machine_code: &str, load_number: i64) -> Result<Vec<MergedLine>> {
        self.coverage_rows("coverage_lines", machine_code, load_number, "line_number")
    }

    /// Buffered swaths of one load, ordered by line number
    pub fn buffered_swaths(
        &self,
        machine_code: &str,
        load_number: i64,
    ) -> Result<Vec<BufferedSwath>> {
        self.coverage_rows("coverage_buffered", machine_code, load_number, "line_number")
    }

    // === Flight paths ===

    pub fn insert_flight_path_rows(&mut self, rows: &[FlightPathRow]) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO flight_paths \
             (machine_code, load_number, batch_id, line_number, start_time, end_time, geom) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.machine_code,
                row.load_number,
                row.batch_id,
                row.line_number,
                format_time(row.start_time),
                format_time(row.end_time),
                geom_to_sql(&row.geom)?,
            ])?;
        }
        Ok(())
    }

    /// Flight path rows of one load, ordered by line number
    pub fn flight_path_rows(
        &self,
        machine_code: &str,
        load_number: i64,
    ) -> Result<Vec<FlightPathRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT machine_code, load_number, batch_id, line_number, start_time, end_time, geom \
             FROM flight_paths WHERE machine_code = ?1 AND load_number = ?2 \
             ORDER BY line_number",
        )?;
        let mut rows = stmt.query(params![machine_code, load_number])?;
        let mut paths = Vec::new();
        while let Some(row) = rows.next()? {
            paths.push(FlightPathRow {
                machine_code: row.get(0)?,
                load_number: row.get(1)?,
                batch_id: row.get(2)?,
                line_number: row.get(3)?,
                start_time: parse_time(&row.get::<_, String>(4)?)?,
                end_time: parse_time(&row.get::<_, String>(5)?)?,
                geom: geom_from_sql(&row.get::<_, String>(6)?)?,
            });
        }
        Ok(paths)
    }

    // === Load summary ===

    /// Insert or replace the one summary row per machine and load
    pub fn upsert_summary(&mut self, summary: &LoadSummary) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO load_summary ({SUMMARY_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                summary.machine_code,
                summary.batch_id,
                summary.load_number,
                format_time(summary.start_time),
                format_time(summary.end_time),
                summary.bucket_size,
                summary.sum_hectares,
                summary.coverage_rate,
                summary.average_speed,
                summary.runout_time,
                summary.distance_spreading,
                summary.dir_location,
                summary.target_speed,
            ],
        )?;
        Ok(())
    }

    pub fn summary(&self, machine_code: &str, load_number: i64) -> Result<Option<LoadSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM load_summary \
             WHERE machine_code = ?1 AND load_number = ?2"
        ))?;
        let mut rows = stmt.query(params![machine_code, load_number])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_summary(row)?)),
            None => Ok(None),
        }
    }

    // === Registries ===

    pub fn upsert_machine(&mut self, machine: &Machine) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO machines \
             (machine_code, company, pilot, default_bucket_size, target_sow_rate, \
              swath_translation, active) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                machine.machine_code,
                machine.company,
                machine.pilot,
                machine.default_bucket_size,
                machine.target_sow_rate,
                serde_json::to_string(&machine.swath_translation)?,
                machine.active,
            ],
        )?;
        Ok(())
    }

    /// Registry row for a machine, if registered
    pub fn machine(&self, machine_code: &str) -> Result<Option<Machine>> {
        let mut stmt = self.conn.prepare(
            "SELECT machine_code, company, pilot, default_bucket_size, target_sow_rate, \
             swath_translation, active FROM machines WHERE machine_code = ?1",
        )?;
        let mut rows = stmt.query(params![machine_code])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_machine(row)?)),
            None => Ok(None),
        }
    }

    pub fn machines(&self) -> Result<Vec<Machine>> {
        let mut stmt = self.conn.prepare(
            "SELECT machine_code, company, pilot, default_bucket_size, target_sow_rate, \
             swath_translation, active FROM machines ORDER BY machine_code",
        )?;
        let mut rows = stmt.query([])?;
        let mut machines = Vec::new();
        while let Some(row) = rows.next()? {
            machines.push(read_machine(row)?);
        }
        Ok(machines)
    }

    pub fn upsert_load_site(&mut self, site: &LoadSite) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO load_sites (name, active, elevation_trigger, geom) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                site.name,
                site.active,
                site.elevation_trigger,
                geom_to_sql(&site.geom)?,
            ],
        )?;
        Ok(())
    }

    /// Active load-site polygons for the spatial join
    pub fn active_load_sites(&self) -> Result<Vec<LoadSite>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, active, elevation_trigger, geom FROM load_sites \
             WHERE active = 1 ORDER BY name",
        )?;
        let mut rows = stmt.query([])?;
        let mut sites = Vec::new();
        while let Some(row) = rows.next()? {
            sites.push(read_load_site(row)?);
        }
        Ok(sites)
    }

    // === Listings ===

    /// Machines that have track points, whether registered or not
    pub fn distinct_machines(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT machine_code FROM track_points ORDER BY machine_code")?;
        let machines = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(machines)
    }

    /// Load numbers assigned for a machine, ascending
    pub fn machine_loads(&self, machine_code: &str) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT load_number FROM track_points \
             WHERE machine_code = ?1 AND load_number IS NOT NULL ORDER BY load_number",
        )?;
        let loads = stmt
            .query_map(params![machine_code], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(loads)
    }

    pub fn distinct_batches(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT batch_id FROM track_points ORDER BY batch_id")?;
        let batches = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(batches)
    }

    pub fn max_load_number(&self, machine_code: &str) -> Result<Option<i64>> {
        let max = self.conn.query_row(
            "SELECT MAX(load_number) FROM track_points WHERE machine_code = ?1",
            params![machine_code],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(max)
    }

    // === Deletes ===

    /// Delete one batch's rows from every working table
    pub fn delete_batch_rows(&mut self, batch_id: &str) -> Result<usize> {
        let mut total = 0;
        for table in WORKING_TABLES {
            let count = self.conn.execute(
                &format!("DELETE FROM {table} WHERE batch_id = ?1"),
                params![batch_id],
            )?;
            tracing::debug!(table, count, batch_id, "deleted batch rows");
            total += count;
        }
        Ok(total)
    }

    /// Delete one load's rows from every derived table; track points keep
    /// their numbering
    pub fn delete_load_rows(&mut self, machine_code: &str, load_number: i64) -> Result<usize> {
        let mut total = 0;
        for table in DERIVED_TABLES {
            total += self.conn.execute(
                &format!("DELETE FROM {table} WHERE machine_code = ?1 AND load_number = ?2"),
                params![machine_code, load_number],
            )?;
        }
        Ok(total)
    }

    /// Delete one load's rows from the three coverage tables only
    pub fn delete_coverage_rows(&mut self, machine_code: &str, load_number: i64) -> Result<usize> {
        let mut total = 0;
        for table in COVERAGE_TABLES {
            total += self.conn.execute(
                &format!("DELETE FROM {table} WHERE machine_code = ?1 AND load_number = ?2"),
                params![machine_code, load_number],
            )?;
        }
        Ok(total)
    }

    /// Delete one load's flight path rows
    pub fn delete_flight_path_rows(
        &mut self,
        machine_code: &str,
        load_number: i64,
    ) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM flight_paths WHERE machine_code = ?1 AND load_number = ?2",
            params![machine_code, load_number],
        )?;
        Ok(deleted)
    }

    /// Delete a machine's rows from every derived table
    pub fn delete_machine_rows(&mut self, machine_code: &str) -> Result<usize> {
        let mut total = 0;
        for table in DERIVED_TABLES {
            total += self.conn.execute(
                &format!("DELETE FROM {table} WHERE machine_code = ?1"),
                params![machine_code],
            )?;
        }
        Ok(total)
    }

    // === Backup ===

    /// Copy every working table to `{table}_{n}` with the next free numeric
    /// suffix and recreate an empty working set. Registries are untouched.
    ///
    /// # Returns
    ///
    /// The backup number used for the suffix.
    pub fn backup_tables(&mut self) -> Result<u32> {
        let number = self.next_backup_number()?;
        self.edit_session(|store| {
            for table in WORKING_TABLES {
                store.conn.execute_batch(&format!(
                    "CREATE TABLE {table}_{number} AS SELECT * FROM {table}; \
                     DROP TABLE {table};"
                ))?;
            }
            Ok(())
        })?;
        self.create_schema()?;
        tracing::info!(number, "backed up working tables");
        Ok(number)
    }

    fn next_backup_number(&self) -> Result<u32> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'track_points_%'",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok());
        let highest = names
            .filter_map(|name| {
                name.strip_prefix("track_points_")
                    .and_then(|suffix| suffix.parse::<u32>().ok())
            })
            .max();
        Ok(highest.map_or(1, |n| n + 1))
    }

    /// Drop every numbered backup copy of the working tables
    ///
    /// # Returns
    ///
    /// The dropped table names; the next backup restarts at number 1.
    pub fn cleanup_backup_tables(&mut self) -> Result<Vec<String>> {
        let names: Vec<String> = {
            let mut stmt = self
                .conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.filter_map(|r| r.ok()).collect()
        };
        let backups: Vec<String> = names
            .into_iter()
            .filter(|name| {
                WORKING_TABLES.iter().any(|table| {
                    name.strip_prefix(&format!("{table}_"))
                        .is_some_and(|suffix| suffix.parse::<u32>().is_ok())
                })
            })
            .collect();
        self.edit_session(|store| {
            for name in &backups {
                store.conn.execute_batch(&format!("DROP TABLE {name}"))?;
            }
            Ok(())
        })?;
        tracing::info!(dropped = backups.len(), "dropped backup tables");
        Ok(backups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use geo::{Coord, LineString, Point};
    use tempfile::TempDir;

    fn base_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 11, 2)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    fn create_test_store() -> (TempDir, SpatialStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SpatialStore::open(&dir.path().join("flightline.sqlite")).unwrap();
        (dir, store)
    }

    fn create_test_point(seconds: i64, machine: &str, load: Option<i64>) -> TrackPoint {
        TrackPoint {
            id: None,
            src_id: format!("2023-11-02T09:30:{seconds:02}|55"),
            date_time: base_time() + Duration::seconds(seconds),
            speed: 55.0,
            heading: 90.0,
            altitude: 150.0,
            width: 120.0,
            machine_code: machine.to_string(),
            bucket_size: 600,
            load_number: load,
            batch_id: format!("{machine}_02112023_0930"),
            bucket_state: BucketState::Open,
            geom: Point::new(seconds as f64 * 10.0, 0.0),
        }
    }

    fn create_test_segment(machine: &str, load: i64, line_number: i64) -> DetailedSegment {
        CoverageSegment {
            src_id: format!("seg_{line_number}"),
            date_time: base_time() + Duration::seconds(line_number),
            speed: 10.0,
            heading: 90.0,
            altitude: 100.0,
            width: 120.0,
            machine_code: machine.to_string(),
            bucket_size: 600,
            load_number: load,
            batch_id: format!("{machine}_02112023_0930"),
            bucket_state: BucketState::Open,
            coverage_rate: 4.0,
            hectares: 0.1,
            distance: 10.0,
            seconds: 0.5,
            line_number,
            geom: LineString(vec![Coord { x: 0.0, y: 0.0 }, Coord { x: 10.0, y: 0.0 }]),
        }
    }

    fn point_map(points: Vec<TrackPoint>) -> BTreeMap<String, TrackPoint> {
        points.into_iter().map(|p| (p.src_id.clone(), p)).collect()
    }

    #[test]
    fn test_insert_skips_existing_src_ids() {
        let (_dir, mut store) = create_test_store();
        let first = point_map(vec![
            create_test_point(0, "PBX", None),
            create_test_point(1, "PBX", None),
            create_test_point(2, "PBX", None),
        ]);
        assert_eq!(store.insert_new_points("PBX", &first).unwrap(), 3);

        let second = point_map(vec![
            create_test_point(2, "PBX", None),
            create_test_point(3, "PBX", None),
            create_test_point(4, "PBX", None),
        ]);
        assert_eq!(store.insert_new_points("PBX", &second).unwrap(), 2);
        assert_eq!(store.points_by_machine("PBX").unwrap().len(), 5);
    }

    #[test]
    fn test_points_round_trip_ordered_by_time() {
        let (_dir, mut store) = create_test_store();
        let points = point_map(vec![
            create_test_point(5, "PBX", Some(1)),
            create_test_point(1, "PBX", Some(1)),
            create_test_point(3, "PBX", Some(1)),
        ]);
        store.insert_new_points("PBX", &points).unwrap();

        let read = store.points_by_machine("PBX").unwrap();
        let times: Vec<NaiveDateTime> = read.iter().map(|p| p.date_time).collect();
        assert_eq!(
            times,
            vec![
                base_time() + Duration::seconds(1),
                base_time() + Duration::seconds(3),
                base_time() + Duration::seconds(5),
            ]
        );
        assert_eq!(read[0].geom, Point::new(10.0, 0.0));
        assert_eq!(read[0].bucket_state, BucketState::Open);
        assert!(read[0].id.is_some());
    }

    #[test]
    fn test_machine_code_filter_is_case_insensitive() {
        let (_dir, mut store) = create_test_store();
        let points = point_map(vec![create_test_point(0, "PBX", None)]);
        store.insert_new_points("PBX", &points).unwrap();
        assert_eq!(store.points_by_machine("pbx").unwrap().len(), 1);
    }

    #[test]
    fn test_assign_and_clear_load_numbers() {
        let (_dir, mut store) = create_test_store();
        let points = point_map(vec![
            create_test_point(0, "PBX", None),
            create_test_point(1, "PBX", None),
        ]);
        store.insert_new_points("PBX", &points).unwrap();

        let ids: Vec<i64> = store
            .points_by_machine("PBX")
            .unwrap()
            .iter()
            .filter_map(|p| p.id)
            .collect();
        let assignments: BTreeMap<i64, i64> = ids.iter().map(|id| (*id, 2)).collect();
        assert_eq!(store.assign_load_numbers(&assignments).unwrap(), 2);
        assert_eq!(store.machine_loads("PBX").unwrap(), vec![2]);
        assert_eq!(store.max_load_number("PBX").unwrap(), Some(2));

        assert_eq!(store.clear_load_numbers("PBX").unwrap(), 2);
        assert!(store.machine_loads("PBX").unwrap().is_empty());
        assert_eq!(store.max_load_number("PBX").unwrap(), None);
    }

    #[test]
    fn test_renumber_loads_rewrites_batch_and_bucket() {
        let (_dir, mut store) = create_test_store();
        let mut late = create_test_point(10, "PBX", Some(3));
        late.batch_id = "PBX_02112023_1100".to_string();
        let points = point_map(vec![
            create_test_point(0, "PBX", Some(2)),
            create_test_point(1, "PBX", Some(2)),
            late,
        ]);
        store.insert_new_points("PBX", &points).unwrap();

        let batch = store
            .first_batch_for_loads("PBX", &[2, 3])
            .unwrap()
            .unwrap();
        assert_eq!(batch, "PBX_02112023_0930");

        let updated = store
            .renumber_loads("PBX", &[2, 3], 2, &batch, Some(750))
            .unwrap();
        assert_eq!(updated, 3);

        let read = store.points_by_machine("PBX").unwrap();
        assert!(read.iter().all(|p| p.load_number == Some(2)));
        assert!(read.iter().all(|p| p.batch_id == "PBX_02112023_0930"));
        assert!(read.iter().all(|p| p.bucket_size == 750));
        assert_eq!(store.machine_loads("PBX").unwrap(), vec![2]);
    }

    #[test]
    fn test_renumber_without_bucket_override_keeps_bucket() {
        let (_dir, mut store) = create_test_store();
        let points = point_map(vec![create_test_point(0, "PBX", Some(3))]);
        store.insert_new_points("PBX", &points).unwrap();

        store
            .renumber_loads("PBX", &[3], 2, "PBX_02112023_0930", None)
            .unwrap();
        let read = store.points_by_machine("PBX").unwrap();
        assert_eq!(read[0].load_number, Some(2));
        assert_eq!(read[0].bucket_size, 600);
    }

    #[test]
    fn test_coverage_rows_round_trip() {
        let (_dir, mut store) = create_test_store();
        let segments = vec![
            create_test_segment("PBX", 1, 0),
            create_test_segment("PBX", 1, 1),
        ];
        store.insert_detailed_segments(&segments).unwrap();

        let read = store.detailed_segments("PBX", 1).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].geom, segments[0].geom);
        assert_eq!(read[0].date_time, segments[0].date_time);
        assert!((read[1].coverage_rate - 4.0).abs() < 1e-9);
        assert!(store.detailed_segments("PBX", 2).unwrap().is_empty());
    }

    #[test]
    fn test_delete_scoping_by_load_and_batch() {
        let (_dir, mut store) = create_test_store();
        store
            .insert_detailed_segments(&[
                create_test_segment("PBX", 1, 0),
                create_test_segment("PBX", 2, 0),
            ])
            .unwrap();
        store
            .insert_detailed_segments(&[create_test_segment("ZKH", 1, 0)])
            .unwrap();

        store.delete_load_rows("PBX", 1).unwrap();
        assert!(store.detailed_segments("PBX", 1).unwrap().is_empty());
        assert_eq!(store.detailed_segments("PBX", 2).unwrap().len(), 1);
        assert_eq!(store.detailed_segments("ZKH", 1).unwrap().len(), 1);

        let points = point_map(vec![create_test_point(0, "PBX", Some(2))]);
        store.insert_new_points("PBX", &points).unwrap();
        let deleted = store.delete_batch_rows("PBX_02112023_0930").unwrap();
        // One remaining detailed row plus one track point for the batch.
        assert_eq!(deleted, 2);
        assert!(store.points_by_machine("PBX").unwrap().is_empty());
        assert_eq!(store.detailed_segments("ZKH", 1).unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_summary_replaces_existing_row() {
        let (_dir, mut store) = create_test_store();
        let mut summary = LoadSummary {
            machine_code: "PBX".to_string(),
            batch_id: "PBX_02112023_0930".to_string(),
            load_number: 1,
            start_time: base_time(),
            end_time: base_time() + Duration::seconds(60),
            bucket_size: 600,
            sum_hectares: 10.0,
            coverage_rate: 4.0,
            average_speed: 55.0,
            runout_time: 120.0,
            distance_spreading: 9000.0,
            dir_location: "raw_data/PBX/PBX_02112023_0930".to_string(),
            target_speed: 80.0,
        };
        store.upsert_summary(&summary).unwrap();

        summary.sum_hectares = 12.5;
        store.upsert_summary(&summary).unwrap();

        let read = store.summary("PBX", 1).unwrap().unwrap();
        assert!((read.sum_hectares - 12.5).abs() < 1e-9);
        assert_eq!(read.start_time, base_time());
        assert!(store.summary("PBX", 2).unwrap().is_none());
    }

    #[test]
    fn test_backup_numbering_and_fresh_working_set() {
        let (_dir, mut store) = create_test_store();
        let points = point_map(vec![create_test_point(0, "PBX", Some(1))]);
        store.insert_new_points("PBX", &points).unwrap();
        store
            .upsert_machine(&Machine {
                machine_code: "PBX".to_string(),
                company: None,
                pilot: None,
                default_bucket_size: 600,
                target_sow_rate: 6.0,
                swath_translation: BTreeMap::new(),
                active: true,
            })
            .unwrap();

        assert_eq!(store.backup_tables().unwrap(), 1);
        assert!(store.points_by_machine("PBX").unwrap().is_empty());
        // Registry survives the backup.
        assert!(store.machine("PBX").unwrap().is_some());

        assert_eq!(store.backup_tables().unwrap(), 2);
    }

    #[test]
    fn test_cleanup_drops_numbered_backup_copies() {
        let (_dir, mut store) = create_test_store();
        assert!(store.cleanup_backup_tables().unwrap().is_empty());

        let points = point_map(vec![create_test_point(0, "PBX", Some(1))]);
        store.insert_new_points("PBX", &points).unwrap();
        store.backup_tables().unwrap();
        store.insert_new_points("PBX", &points).unwrap();
        store.backup_tables().unwrap();

        let dropped = store.cleanup_backup_tables().unwrap();
        assert_eq!(dropped.len(), WORKING_TABLES.len() * 2);
        assert!(dropped.iter().any(|name| name == "track_points_1"));
        assert!(dropped.iter().any(|name| name == "track_points_2"));

        // Numbering restarts once the copies are gone.
        store.insert_new_points("PBX", &points).unwrap();
        assert_eq!(store.backup_tables().unwrap(), 1);
    }

    #[test]
    fn test_machine_registry_round_trip() {
        let (_dir, mut store) = create_test_store();
        let mut translation = BTreeMap::new();
        translation.insert("120".to_string(), 90.0);
        let machine = Machine {
            machine_code: "PBX".to_string(),
            company: Some("Heli Ops".to_string()),
            pilot: Some("A. Pilot".to_string()),
            default_bucket_size: 600,
            target_sow_rate: 6.0,
            swath_translation: translation,
            active: true,
        };
        store.upsert_machine(&machine).unwrap();

        let read = store.machine("pbx").unwrap().unwrap();
        assert_eq!(read, machine);
        assert_eq!(read.swath_translation.get("120"), Some(&90.0));
        assert!(store.machine("ZKH").unwrap().is_none());
    }

    #[test]
    fn test_edit_session_rolls_back_on_error() {
        let (_dir, mut store) = create_test_store();
        let points = point_map(vec![create_test_point(0, "PBX", None)]);
        let result: Result<()> = store.edit_session(|s| {
            s.insert_new_points("PBX", &points)?;
            Err(crate::DataError::DataIntegrityViolation {
                reason: "forced".to_string(),
            })
        });
        assert!(result.is_err());
        assert!(store.points_by_machine("PBX").unwrap().is_empty());
    }
}
