//! Command line for the aerial baiting flight data pipeline
//!
//! Thin dispatch over [`flightline_lib::FlightlineProject`]: every command
//! opens the project folder, runs one library operation and prints a
//! human-readable result. Logs go to stderr so stdout stays clean.

use anyhow::Context;
use clap::{Parser, Subcommand};
use flightline_lib::{
    read_site_polygon, FlightlineProject, LoadReport, LoadSite, Machine,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "flightline")]
#[command(about = "Aerial baiting track processing")]
#[command(version)]
struct Cli {
    /// Project folder
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the project folder layout, config and store
    Init,

    /// Stage a device export and run the full pipeline on it
    ProcessExport {
        /// Device folder holding the export
        #[arg(short, long)]
        source: PathBuf,
        /// Machine code the export belongs to
        #[arg(short, long)]
        machine: String,
        /// Download time as HHMM; defaults to the current time
        #[arg(short, long)]
        time: Option<String>,
    },

    /// Assign load numbers to a machine's unnumbered points
    Segment {
        #[arg(short, long)]
        machine: String,
    },

    /// Rebuild one load's coverage tables
    Coverage {
        #[arg(short, long)]
        machine: String,
        #[arg(short, long)]
        load: i64,
    },

    /// Rebuild one load's flight path rows
    FlightPath {
        #[arg(short, long)]
        machine: String,
        #[arg(short, long)]
        load: i64,
    },

    /// Recompute one load's summary row
    Summarize {
        #[arg(short, long)]
        machine: String,
        #[arg(short, long)]
        load: i64,
    },

    /// Merge loads into the lowest of their numbers
    CombineLoads {
        #[arg(short, long)]
        machine: String,
        /// Load numbers to merge, comma separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        loads: Vec<i64>,
        /// Override the bucket size on the combined points
        #[arg(short, long)]
        bucket_size: Option<i64>,
    },

    /// Renumber a machine from scratch and rebuild every load
    Recalculate {
        #[arg(short, long)]
        machine: String,
    },

    /// Delete a batch's rows and archive its staged folder
    DeleteBatch {
        /// Batch id, MACHINE_ddmmyyyy_HHMM
        batch_id: String,
    },

    /// Delete one load's coverage, flight path and summary rows
    DeleteLoad {
        #[arg(short, long)]
        machine: String,
        #[arg(short, long)]
        load: i64,
    },

    /// Move the working tables aside under the next backup number
    Backup,

    /// Drop the numbered backup tables
    CleanupBackups,

    /// List registered and tracked machines
    Machines,

    /// List batch ids present in the track data
    Batches,

    /// List load numbers for a machine
    Loads {
        #[arg(short, long)]
        machine: String,
    },

    /// Register or update a machine
    AddMachine {
        /// Machine code, e.g. PBX
        #[arg(short, long)]
        code: String,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        pilot: Option<String>,
        /// Default bucket size in kg
        #[arg(short, long)]
        bucket_size: i64,
        /// Prescribed sow rate in kg/ha
        #[arg(short, long)]
        sow_rate: f64,
        /// Swath width correction as recorded:actual, repeatable (e.g. 120:90)
        #[arg(long = "swath")]
        swaths: Vec<String>,
        /// Register without applying swath corrections on ingest
        #[arg(long)]
        inactive: bool,
    },

    /// Register or update a load site from a polygon file
    AddLoadSite {
        /// Site name
        #[arg(short, long)]
        name: String,
        /// GeoJSON file with the site polygon in lon/lat
        #[arg(short, long)]
        file: PathBuf,
        /// Altitude ceiling in meters; the project default applies otherwise
        #[arg(short, long)]
        elevation: Option<f64>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flightline=info,flightline_lib=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let folder = cli.project;

    match cli.command {
        Commands::Init => cmd_init(&folder),
        Commands::ProcessExport {
            source,
            machine,
            time,
        } => cmd_process_export(
            &mut open_project(&folder)?,
            &source,
            &machine,
            time.as_deref(),
        ),
        Commands::Segment { machine } => cmd_segment(&mut open_project(&folder)?, &machine),
        Commands::Coverage { machine, load } => {
            cmd_coverage(&mut open_project(&folder)?, &machine, load)
        }
        Commands::FlightPath { machine, load } => {
            cmd_flight_path(&mut open_project(&folder)?, &machine, load)
        }
        Commands::Summarize { machine, load } => {
            cmd_summarize(&mut open_project(&folder)?, &machine, load)
        }
        Commands::CombineLoads {
            machine,
            loads,
            bucket_size,
        } => cmd_combine_loads(&mut open_project(&folder)?, &machine, &loads, bucket_size),
        Commands::Recalculate { machine } => {
            cmd_recalculate(&mut open_project(&folder)?, &machine)
        }
        Commands::DeleteBatch { batch_id } => {
            cmd_delete_batch(&mut open_project(&folder)?, &batch_id)
        }
        Commands::DeleteLoad { machine, load } => {
            cmd_delete_load(&mut open_project(&folder)?, &machine, load)
        }
        Commands::Backup => cmd_backup(&mut open_project(&folder)?),
        Commands::CleanupBackups => cmd_cleanup_backups(&mut open_project(&folder)?),
        Commands::Machines => cmd_machines(&open_project(&folder)?),
        Commands::Batches => cmd_batches(&open_project(&folder)?),
        Commands::Loads { machine } => cmd_loads(&open_project(&folder)?, &machine),
        Commands::AddMachine {
            code,
            company,
            pilot,
            bucket_size,
            sow_rate,
            swaths,
            inactive,
        } => {
            let machine = Machine {
                machine_code: code,
                company,
                pilot,
                default_bucket_size: bucket_size,
                target_sow_rate: sow_rate,
                swath_translation: parse_swath_map(&swaths)?,
                active: !inactive,
            };
            cmd_add_machine(&mut open_project(&folder)?, &machine)
        }
        Commands::AddLoadSite {
            name,
            file,
            elevation,
        } => cmd_add_load_site(&mut open_project(&folder)?, &name, &file, elevation),
    }
}

fn open_project(folder: &Path) -> anyhow::Result<FlightlineProject> {
    FlightlineProject::open(folder)
        .with_context(|| format!("opening project {}", folder.display()))
}

fn cmd_init(folder: &Path) -> anyhow::Result<()> {
    let project = FlightlineProject::init(folder)?;
    println!(
        "Initialized project at {}",
        project.config().project_folder.display()
    );
    println!("Store: {}", project.config().store_path().display());
    Ok(())
}

fn cmd_process_export(
    project: &mut FlightlineProject,
    source: &Path,
    machine: &str,
    time: Option<&str>,
) -> anyhow::Result<()> {
    let report = project.process_export(source, machine, time)?;
    println!(
        "Staged batch {} at {}",
        report.batch_id,
        report.staged_folder.display()
    );
    println!(
        "{:?} export: {} folders, {} points read, {} new",
        report.kind, report.folders_read, report.points_read, report.points_inserted
    );
    if report.loads.is_empty() {
        println!("No loads touched");
    } else {
        println!("Rebuilt {} loads:", report.loads.len());
        for load in &report.loads {
            print_load_report(load);
        }
    }
    Ok(())
}

fn cmd_segment(project: &mut FlightlineProject, machine: &str) -> anyhow::Result<()> {
    let loads = project.segment_loads(machine)?;
    if loads.is_empty() {
        println!("No unnumbered points for {machine}");
    } else {
        println!("Loads touched: {}", join_loads(&loads));
    }
    Ok(())
}

fn cmd_coverage(project: &mut FlightlineProject, machine: &str, load: i64) -> anyhow::Result<()> {
    match project.build_coverage(machine, load)? {
        Some(report) => println!(
            "Load {load}: {} segments, {} lines, {} swaths, {:.1} ha",
            report.detailed, report.merged, report.buffered, report.hectares
        ),
        None => println!("Load {load} of {machine} has no sowing data"),
    }
    Ok(())
}

fn cmd_flight_path(
    project: &mut FlightlineProject,
    machine: &str,
    load: i64,
) -> anyhow::Result<()> {
    let rows = project.build_flight_path(machine, load)?;
    println!("Load {load}: {rows} transit lines");
    Ok(())
}

fn cmd_summarize(project: &mut FlightlineProject, machine: &str, load: i64) -> anyhow::Result<()> {
    match project.summarize_load(machine, load)? {
        Some(summary) => {
            println!(
                "Load {} of {} ({})",
                summary.load_number, summary.machine_code, summary.batch_id
            );
            println!("  window:   {} .. {}", summary.start_time, summary.end_time);
            println!(
                "  sown:     {:.2} ha at {:.1} kg/ha",
                summary.sum_hectares, summary.coverage_rate
            );
            println!(
                "  speed:    {:.1} kn average, {:.1} kn target",
                summary.average_speed, summary.target_speed
            );
            println!(
                "  runout:   {:.0} s over {:.0} m",
                summary.runout_time, summary.distance_spreading
            );
            println!("  raw data: {}", summary.dir_location);
        }
        None => println!("Load {load} of {machine} has no detailed coverage"),
    }
    Ok(())
}

fn cmd_combine_loads(
    project: &mut FlightlineProject,
    machine: &str,
    loads: &[i64],
    bucket_size: Option<i64>,
) -> anyhow::Result<()> {
    let report = project.combine_loads(machine, loads, bucket_size)?;
    println!("Combined {} into load {}", join_loads(loads), report.load_number);
    print_load_report(&report);
    Ok(())
}

fn cmd_recalculate(project: &mut FlightlineProject, machine: &str) -> anyhow::Result<()> {
    let reports = project.recalculate_machine(machine)?;
    println!("Rebuilt {} loads for {machine}:", reports.len());
    for report in &reports {
        print_load_report(report);
    }
    Ok(())
}

fn cmd_delete_batch(project: &mut FlightlineProject, batch_id: &str) -> anyhow::Result<()> {
    let (rows, archived) = project.delete_batch(batch_id)?;
    match archived {
        Some(path) => println!("Deleted {rows} rows, folder archived at {}", path.display()),
        None => println!("Deleted {rows} rows, no staged folder to archive"),
    }
    Ok(())
}

fn cmd_delete_load(
    project: &mut FlightlineProject,
    machine: &str,
    load: i64,
) -> anyhow::Result<()> {
    let rows = project.delete_machine_load(machine, load)?;
    println!("Deleted {rows} rows for load {load} of {machine}");
    Ok(())
}

fn cmd_backup(project: &mut FlightlineProject) -> anyhow::Result<()> {
    let number = project.backup_data()?;
    println!("Working tables moved to backup {number}");
    Ok(())
}

fn cmd_cleanup_backups(project: &mut FlightlineProject) -> anyhow::Result<()> {
    let dropped = project.cleanup_backups()?;
    if dropped.is_empty() {
        println!("No backup tables to drop");
    } else {
        println!("Dropped {} backup tables", dropped.len());
    }
    Ok(())
}

fn cmd_machines(project: &FlightlineProject) -> anyhow::Result<()> {
    let registered = project.registered_machines()?;
    if registered.is_empty() {
        println!("No machines registered");
    } else {
        println!("Registered:");
        for machine in &registered {
            let pilot = machine
                .pilot
                .as_deref()
                .map(|name| format!(", pilot {name}"))
                .unwrap_or_default();
            println!(
                "  {}: bucket {} kg, sow rate {} kg/ha{}{}",
                machine.machine_code,
                machine.default_bucket_size,
                machine.target_sow_rate,
                pilot,
                if machine.active { "" } else { " (inactive)" },
            );
        }
    }
    let unregistered: Vec<String> = project
        .tracked_machines()?
        .into_iter()
        .filter(|code| {
            !registered
                .iter()
                .any(|machine| machine.machine_code.eq_ignore_ascii_case(code))
        })
        .collect();
    if !unregistered.is_empty() {
        println!("In track data only: {}", unregistered.join(", "));
    }
    Ok(())
}

fn cmd_batches(project: &FlightlineProject) -> anyhow::Result<()> {
    for batch in project.batches()? {
        println!("{batch}");
    }
    Ok(())
}

fn cmd_loads(project: &FlightlineProject, machine: &str) -> anyhow::Result<()> {
    let loads = project.loads(machine)?;
    if loads.is_empty() {
        println!("No loads for {machine}");
    } else {
        println!("{}", join_loads(&loads));
    }
    Ok(())
}

fn cmd_add_machine(project: &mut FlightlineProject, machine: &Machine) -> anyhow::Result<()> {
    project.add_machine(machine)?;
    println!("Machine {} registered", machine.machine_code);
    Ok(())
}

fn cmd_add_load_site(
    project: &mut FlightlineProject,
    name: &str,
    file: &Path,
    elevation: Option<f64>,
) -> anyhow::Result<()> {
    let geom = read_site_polygon(file)?;
    project.add_load_site(&LoadSite {
        name: name.to_string(),
        active: true,
        elevation_trigger: elevation,
        geom,
    })?;
    println!("Load site {name} registered");
    Ok(())
}

fn print_load_report(report: &LoadReport) {
    match &report.coverage {
        Some(coverage) => println!(
            "  load {}: {} segments, {} lines, {} swaths, {:.1} ha, {} transit lines{}",
            report.load_number,
            coverage.detailed,
            coverage.merged,
            coverage.buffered,
            coverage.hectares,
            report.flight_path_rows,
            if report.summarized { ", summarized" } else { "" },
        ),
        None => println!(
            "  load {}: no sowing data, {} transit lines",
            report.load_number, report.flight_path_rows
        ),
    }
}

fn join_loads(loads: &[i64]) -> String {
    loads
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_swath_map(pairs: &[String]) -> anyhow::Result<BTreeMap<String, f64>> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        let (recorded, actual) = pair
            .split_once(':')
            .with_context(|| format!("swath pair {pair:?} is not recorded:actual"))?;
        let actual: f64 = actual
            .trim()
            .parse()
            .with_context(|| format!("swath width {actual:?} is not a number"))?;
        map.insert(recorded.trim().to_string(), actual);
    }
    Ok(map)
}
