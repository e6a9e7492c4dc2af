//! BackUP - Command-line interface for the backup engine.
//!
//! Manages the work list and runs selected works in parallel, reporting
//! progress to stderr.

use chrono::Local;
use clap::{Parser, Subcommand};
use engine::{
    run_observed, BackupType, BackupWork, ChecksumAlgorithm, EngineSettings, JobEngine, JobObserver, JobSnapshot,
    JobState, WorkList,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// BackUP - Parallel backup tool
#[derive(Parser, Debug)]
#[command(name = "backup")]
#[command(version = "0.1.0")]
#[command(about = "Run backup works in parallel with progress tracking")]
struct Cli {
    /// Enable verbose output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run backup works
    Run {
        /// Work list file
        #[arg(long, value_name = "PATH", default_value = "works.json")]
        works: PathBuf,

        /// Engine settings file
        #[arg(long, value_name = "PATH")]
        settings: Option<PathBuf>,

        /// Works to run, 1-based: "1-3" for a range, "1;3" for a list. All by default
        #[arg(long, value_name = "SELECTION")]
        jobs: Option<String>,

        /// Verify every copied file with this checksum: md5, sha256, blake3
        #[arg(long, value_name = "ALGORITHM")]
        verify: Option<String>,
    },
    /// List configured works
    List {
        #[arg(long, value_name = "PATH", default_value = "works.json")]
        works: PathBuf,
    },
    /// Add a work to the list
    Add {
        #[arg(long, value_name = "PATH", default_value = "works.json")]
        works: PathBuf,

        /// Unique work name
        #[arg(long)]
        name: String,

        /// Source directory
        #[arg(long, value_name = "PATH")]
        src: PathBuf,

        /// Destination directory
        #[arg(long, value_name = "PATH")]
        dst: PathBuf,

        /// Backup type: full or differential
        #[arg(long = "type", value_name = "TYPE", default_value = "full")]
        backup_type: String,
    },
    /// Remove a work by its 1-based number
    Remove {
        #[arg(long, value_name = "PATH", default_value = "works.json")]
        works: PathBuf,

        /// Work number as shown by `list`
        number: usize,
    },
}

/// CLI implementation of JobObserver for displaying backup progress
struct CliObserver {
    verbose: bool,
    start_time: Instant,
    last_progress_update: Option<Instant>,
    progress: BTreeMap<usize, f64>,
    files_copied: usize,
    bytes_copied: u64,
    failures: Vec<(String, PathBuf, String)>,
    verification_mismatches: Vec<PathBuf>,
    final_states: BTreeMap<usize, (String, JobState)>,
}

impl CliObserver {
    fn new(verbose: bool) -> Self {
        CliObserver {
            verbose,
            start_time: Instant::now(),
            last_progress_update: None,
            progress: BTreeMap::new(),
            files_copied: 0,
            bytes_copied: 0,
            failures: Vec::new(),
            verification_mismatches: Vec::new(),
            final_states: BTreeMap::new(),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn print_progress_bar(percent: u32) -> String {
        let percent = percent.min(100);
        let filled = (percent / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }

    fn file_name(path: &Path) -> &str {
        path.file_name().and_then(|n| n.to_str()).unwrap_or("(unknown)")
    }

    fn overall_percent(&self) -> u32 {
        if self.progress.is_empty() {
            return 0;
        }
        (self.progress.values().sum::<f64>() / self.progress.len() as f64) as u32
    }
}

impl JobObserver for CliObserver {
    fn on_state_changed(&mut self, job: &JobSnapshot, previous: JobState) {
        self.progress.entry(job.index).or_insert(0.0);
        if job.state.is_terminal() {
            self.final_states.insert(job.index, (job.work_name.clone(), job.state));
        }
        if self.verbose || matches!(job.state, JobState::Stopped | JobState::Error) {
            eprintln!();
            eprintln!("[{}] {}: {} -> {}", job.index + 1, job.work_name, previous, job.state);
        }
    }

    fn on_job_progress(&mut self, job: &JobSnapshot, percent: f64) {
        self.progress.insert(job.index, percent);

        // Throttle progress updates to avoid spam (max once per 200ms)
        if let Some(last) = self.last_progress_update {
            if last.elapsed().as_millis() < 200 && percent < 100.0 {
                return;
            }
        }
        self.last_progress_update = Some(Instant::now());

        eprint!(
            "\rProgress: {} | {} copied",
            Self::print_progress_bar(self.overall_percent()),
            Self::format_bytes(self.bytes_copied)
        );
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }

    fn on_business_blocked(&mut self, job: &JobSnapshot) {
        eprintln!();
        eprintln!("[{}] {}: waiting for business software to exit", job.index + 1, job.work_name);
    }

    fn on_business_released(&mut self, job: &JobSnapshot) {
        eprintln!();
        eprintln!("[{}] {}: resumed", job.index + 1, job.work_name);
    }

    fn on_file_transferred(&mut self, work_name: &str, source: &Path, size: u64, elapsed: Duration) {
        self.files_copied += 1;
        self.bytes_copied += size;
        if self.verbose {
            eprintln!();
            eprintln!(
                "{}: {} ({}, {} ms)",
                work_name,
                Self::file_name(source),
                Self::format_bytes(size),
                elapsed.as_millis()
            );
        }
    }

    fn on_file_error(&mut self, work_name: &str, source: &Path, fault: &str) {
        self.failures
            .push((work_name.to_string(), source.to_path_buf(), fault.to_string()));
    }

    fn on_file_verified(&mut self, destination: &Path, matches: bool) {
        if !matches {
            self.verification_mismatches.push(destination.to_path_buf());
        }
    }

    fn on_all_completed(&mut self) {
        eprintln!();
        eprintln!("Backup complete!");

        let count = |state: JobState| self.final_states.values().filter(|(_, s)| *s == state).count();
        eprintln!(
            "Summary: {} done, {} stopped, {} failed",
            count(JobState::Done),
            count(JobState::Stopped),
            count(JobState::Error)
        );
        eprintln!(
            "Files copied: {} ({})",
            self.files_copied,
            Self::format_bytes(self.bytes_copied)
        );
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));

        if !self.failures.is_empty() {
            eprintln!();
            eprintln!("Failed files:");
            for (work, source, fault) in &self.failures {
                eprintln!("  {} / {}: {}", work, Self::file_name(source), fault);
            }
        }

        if !self.verification_mismatches.is_empty() {
            eprintln!();
            eprintln!("Verification mismatches:");
            for destination in &self.verification_mismatches {
                eprintln!(
                    "  {}: source and destination checksums differ",
                    Self::file_name(destination)
                );
            }
        }
    }
}

/// Parse a 1-based job selection ("1-3", "1;3", "2") into 0-based indices.
///
/// Duplicates are dropped; order of first appearance is kept.
fn parse_selection(selection: &str, count: usize) -> Result<Vec<usize>, String> {
    let parse_number = |s: &str| -> Result<usize, String> {
        let n: usize = s
            .trim()
            .parse()
            .map_err(|_| format!("Invalid job number '{}'", s.trim()))?;
        if n == 0 || n > count {
            return Err(format!("Job number {} is out of range 1-{}", n, count));
        }
        Ok(n - 1)
    };

    let mut indices = Vec::new();
    for part in selection.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let range = match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse_number(start)?, parse_number(end)?);
                if start > end {
                    return Err(format!("Invalid range '{}'", part));
                }
                start..=end
            }
            None => {
                let n = parse_number(part)?;
                n..=n
            }
        };
        for index in range {
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
    }

    if indices.is_empty() {
        return Err(format!("Empty job selection '{}'", selection));
    }
    Ok(indices)
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .try_init();
}

/// Parse command-line arguments, then run the requested command
fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Exit code tracking
    let exit_code = match run_cli(&cli) {
        Ok(()) => 0,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
fn run_cli(cli: &Cli) -> Result<(), String> {
    match &cli.command {
        Command::Run {
            works,
            settings,
            jobs,
            verify,
        } => run_works(works, settings.as_deref(), jobs.as_deref(), verify.as_deref(), cli.verbose),
        Command::List { works } => {
            let list = load_works(works)?;
            if list.is_empty() {
                println!("No works configured in {}", works.display());
            }
            for (i, work) in list.works().iter().enumerate() {
                println!(
                    "{:3}. {} [{}]\n     {} -> {}",
                    i + 1,
                    work.name,
                    work.backup_type,
                    work.source.display(),
                    work.destination.display()
                );
            }
            Ok(())
        }
        Command::Add {
            works,
            name,
            src,
            dst,
            backup_type,
        } => {
            let backup_type: BackupType = backup_type.parse()?;
            let mut list = load_works(works)?;
            list.add(BackupWork::new(name.as_str(), src, dst, backup_type))
                .map_err(|e| e.to_string())?;
            list.save(works).map_err(|e| format!("Failed to save work list: {}", e))?;
            println!("Added work {}: {}", list.len(), name);
            Ok(())
        }
        Command::Remove { works, number } => {
            let mut list = load_works(works)?;
            if *number == 0 {
                return Err("Work numbers start at 1".to_string());
            }
            let removed = list.remove(number - 1).map_err(|e| e.to_string())?;
            list.save(works).map_err(|e| format!("Failed to save work list: {}", e))?;
            println!("Removed work {}: {}", number, removed.name);
            Ok(())
        }
    }
}

fn load_works(path: &Path) -> Result<WorkList, String> {
    WorkList::load(path).map_err(|e| format!("Failed to load work list: {}", e))
}

fn run_works(
    works_path: &Path,
    settings_path: Option<&Path>,
    selection: Option<&str>,
    verify: Option<&str>,
    verbose: bool,
) -> Result<(), String> {
    let works = load_works(works_path)?;
    if works.is_empty() {
        return Err(format!("No works configured in {}", works_path.display()));
    }

    let mut settings = match settings_path {
        Some(path) => EngineSettings::load(path).map_err(|e| format!("Failed to load settings: {}", e))?,
        None => EngineSettings::default(),
    };
    if let Some(algorithm) = verify {
        settings.verify_after_copy = Some(algorithm.parse::<ChecksumAlgorithm>()?);
    }

    let indices = match selection {
        Some(selection) => parse_selection(selection, works.len())?,
        None => (0..works.len()).collect(),
    };

    eprintln!("Backup started at {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    for &i in &indices {
        if let Some(work) = works.get(i) {
            eprintln!("  [{}] {} ({})", i + 1, work.name, work.backup_type);
        }
    }
    eprintln!();

    let engine = JobEngine::new(works, settings);
    let mut observer = CliObserver::new(verbose);
    run_observed(&engine, &indices, &mut observer).map_err(|e| format!("Backup failed: {}", e))?;

    // Determine exit code based on job results
    let failed = engine
        .runners()
        .iter()
        .filter(|r| r.state() == JobState::Error)
        .count();
    if failed > 0 {
        Err(format!("{} job(s) failed", failed))
    } else {
        Ok(())
    }
}
