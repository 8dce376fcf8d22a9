use chrono::{Local, NaiveDate};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use repeat_predictor::config::Config;
use repeat_predictor::dates::{format_dmy, parse_dmy};
use repeat_predictor::db::{resolve_db_path, ConnectOptions, Database};
use repeat_predictor::export::{
    performance_summary, predictions_csv, predictions_json, predictions_table, ExportFormat,
    Performance,
};
use repeat_predictor::import::import_calls;
use repeat_predictor::init::init_project;
use repeat_predictor::logging::init_tracing;
use repeat_predictor::pipeline::{run_schedule, RunReport, Schedule};
use repeat_predictor::predict::reconcile;
use repeat_predictor::record::FeatureSchema;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "repeat-predictor")]
#[command(author, version, about = "Predict which attended service calls will need a repeat visit")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Call database (default: .repeat-predictor/calls.db, or REPEAT_PREDICTOR_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train, calibrate and write predictions
    ///
    /// Without --start-date a single run is made as of today minus the repeat
    /// window. With it, runs start at start-date minus the repeat window and
    /// step forward by --interval-days.
    Run {
        /// Database user
        username: String,

        /// Database password
        password: String,

        /// First date of a historical sweep (dd/mm/yyyy)
        #[arg(long, value_parser = parse_date)]
        start_date: Option<NaiveDate>,

        /// Days between historical runs
        #[arg(long, default_value = "7", value_parser = clap::value_parser!(u32).range(1..))]
        interval_days: u32,
    },

    /// Fill in outcomes and verdicts for an earlier run date
    Reconcile {
        /// Run date (dd/mm/yyyy)
        #[arg(long, value_parser = parse_date)]
        date: NaiveDate,
    },

    /// Show the predictions stored for a run date
    Predictions {
        /// Run date (dd/mm/yyyy)
        #[arg(long, value_parser = parse_date)]
        date: NaiveDate,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: ExportFormat,
    },

    /// List run dates and recent analysis log entries
    Log {
        /// Number of log entries to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },

    /// Import call records from a JSON array (upsert by incident)
    Import {
        /// JSON file of call records
        file: PathBuf,
    },

    /// Create .repeat-predictor with a default config and empty database
    Init,

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        shell: Shell,
    },
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    parse_dmy(s)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Run {
            username,
            password,
            start_date,
            interval_days,
        } => cmd_run(cli.db, username, password, start_date, interval_days),
        Command::Reconcile { date } => cmd_reconcile(cli.db, date),
        Command::Predictions { date, format } => cmd_predictions(cli.db, date, format),
        Command::Log { limit } => cmd_log(cli.db, limit),
        Command::Import { file } => cmd_import(cli.db, file),
        Command::Init => cmd_init(),
        Command::Completion { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "repeat-predictor", &mut io::stdout());
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn open_db(db: Option<PathBuf>, config: &Config) -> Result<Database, String> {
    let path = resolve_db_path(db.as_deref(), config);
    Database::open_existing(&path).map_err(|e| e.to_string())
}

fn cmd_run(
    db: Option<PathBuf>,
    username: String,
    password: String,
    start_date: Option<NaiveDate>,
    interval_days: u32,
) -> Result<(), String> {
    let config = Config::load();
    let repeat_days = config.pipeline.repeat_days;
    let today = Local::now().date_naive();

    let schedule = match start_date {
        None => Schedule::live(today, repeat_days),
        Some(start) => Schedule::historical(start, interval_days, today, repeat_days)
            .map_err(|e| e.to_string())?,
    };

    let options = ConnectOptions {
        database_path: resolve_db_path(db.as_deref(), &config),
        username,
        password,
    };
    tracing::info!(runs = schedule.len(), db = %options.database_path.display(), "starting");

    let report = run_schedule(&options, &config, &FeatureSchema::standard(), &schedule)
        .map_err(|failure| failure.to_string())?;

    for run in &report.runs {
        print_run(run);
    }
    for failure in &report.failures {
        println!(
            "{} {} ({})",
            "Failed".red().bold(),
            format_dmy(failure.as_of),
            failure.error
        );
    }

    println!(
        "\n{} runs completed, {} failed",
        report.runs.len().to_string().green(),
        report.failures.len().to_string().red()
    );

    if report.all_succeeded() {
        Ok(())
    } else {
        Err(format!("{} of {} runs failed", report.failures.len(), schedule.len()))
    }
}

fn print_run(run: &RunReport) {
    println!("\n{} {}", "Run as of".cyan().bold(), format_dmy(run.as_of).bold());
    println!("   Id:          {}", run.run_id.dimmed());
    println!(
        "   Window:      {} to {} ({} calls, {} repeats, {} features)",
        format_dmy(run.window_start),
        format_dmy(run.window_end),
        run.records_loaded,
        run.repeats_loaded,
        run.feature_columns
    );
    println!(
        "   Split:       {} training, {} validation, {} calibration, {} to predict",
        run.training_rows, run.validation_rows, run.calibration_rows, run.prediction_rows
    );
    let val_loss = run
        .best_val_loss
        .map(|l| format!("{:.4}", l))
        .unwrap_or_else(|| "n/a".to_string());
    println!(
        "   Training:    {} epochs{}, best validation loss {}",
        run.epochs,
        if run.stopped_early { " (stopped early)" } else { "" },
        val_loss
    );
    println!(
        "   Threshold:   {:.2} ({}, TP {} / FP {})",
        run.calibration.threshold,
        run.calibration.rule,
        run.calibration.confusion.true_positives,
        run.calibration.confusion.false_positives
    );
    println!(
        "   Predictions: {} written, {} flagged as repeats",
        run.predictions_written,
        run.flagged.to_string().yellow()
    );
    println!(
        "   Reconciled:  {} correct, {} incorrect, {} pending",
        run.reconciled.correct.to_string().green(),
        run.reconciled.incorrect.to_string().red(),
        run.reconciled.pending
    );
}

fn cmd_reconcile(db: Option<PathBuf>, date: NaiveDate) -> Result<(), String> {
    let config = Config::load();
    let db = open_db(db, &config)?;
    let summary = reconcile(&db, date).map_err(|e| e.to_string())?;
    if summary.total() == 0 {
        println!("No predictions stored for {}", format_dmy(date));
        return Ok(());
    }
    println!(
        "Reconciled {} predictions for {}: {} correct, {} incorrect, {} pending",
        summary.total(),
        format_dmy(date),
        summary.correct.to_string().green(),
        summary.incorrect.to_string().red(),
        summary.pending
    );
    Ok(())
}

fn cmd_predictions(db: Option<PathBuf>, date: NaiveDate, format: ExportFormat) -> Result<(), String> {
    let config = Config::load();
    let db = open_db(db, &config)?;
    let records = db.get_predictions(date).map_err(|e| e.to_string())?;

    match format {
        ExportFormat::Json => {
            let json = predictions_json(date, &records).map_err(|e| e.to_string())?;
            println!("{}", json);
        }
        ExportFormat::Csv => print!("{}", predictions_csv(&records)),
        ExportFormat::Table => {
            if records.is_empty() {
                println!("No predictions stored for {}", format_dmy(date));
                return Ok(());
            }
            print!("{}", predictions_table(&records));
            println!();
            print!("{}", performance_summary(&Performance::from_records(&records)));
        }
    }
    Ok(())
}

fn cmd_log(db: Option<PathBuf>, limit: i64) -> Result<(), String> {
    let config = Config::load();
    let db = open_db(db, &config)?;

    let dates = db.run_dates().map_err(|e| e.to_string())?;
    println!("{}", "Run dates".cyan().bold());
    if dates.is_empty() {
        println!("   (none)");
    }
    for d in dates {
        println!("   {}  {} predictions", format_dmy(d.run_date), d.predictions);
    }

    println!("\n{}", "Analysis log".cyan().bold());
    for entry in db.recent_log_entries(limit).map_err(|e| e.to_string())? {
        println!("   {}  {}", entry.logged_at.dimmed(), entry.description);
    }
    Ok(())
}

fn cmd_import(db: Option<PathBuf>, file: PathBuf) -> Result<(), String> {
    let config = Config::load();
    let db = open_db(db, &config)?;
    let summary = import_calls(&db, &file).map_err(|e| e.to_string())?;
    println!(
        "{} {} calls from {} ({} with known outcome)",
        "Imported".green(),
        summary.read,
        file.display(),
        summary.with_outcome
    );
    Ok(())
}

fn cmd_init() -> Result<(), String> {
    let cwd = std::env::current_dir().map_err(|e| format!("Could not get current directory: {}", e))?;
    init_project(&cwd).map(|_| ())
}
