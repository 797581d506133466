//! scangrade - turns scanned exam batches into per-problem grading documents.

mod aggregate;
mod assemble;
mod config;
mod console;
mod error;
mod identity;
mod ledger;
mod make_exams;
mod pdf;
mod pipeline;
mod readers;
mod reconcile;
mod roster;
mod score_table;
mod scores;
mod server;
mod session;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aggregate::AggregationEngine;
use config::{GradingConfig, Layout};
use console::ConsoleResolver;
use make_exams::ExamCopies;
use pipeline::ScanSelection;
use reconcile::{ReconciliationEngine, Resolver};
use roster::Roster;
use session::Session;

#[derive(Parser)]
#[command(name = "scangrade")]
#[command(about = "Prepare scanned exams for grading")]
#[command(version)]
struct Cli {
    /// Main directory of the grading session.
    #[arg(long, env = "SCANGRADE_DIR", default_value = ".")]
    dir: PathBuf,

    /// Gradebook file name inside the main directory.
    #[arg(long, env = "SCANGRADE_GRADEBOOK")]
    gradebook: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write copies of an exam with an identity code on every page.
    MakeExams {
        template: PathBuf,

        /// Number of copies.
        #[arg(short = 'n', long)]
        copies: u32,

        /// Exam name printed in front of every code.
        #[arg(long, default_value = "")]
        prefix: String,

        /// Defaults to the main directory.
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Add a "not graded" page after every page.
        #[arg(long)]
        backpages: bool,
    },

    /// Write the session config file.
    Config {
        #[arg(long)]
        exam_name: Option<String>,

        /// Max score per page, comma separated; the last entry repeats.
        #[arg(long, value_delimiter = ',')]
        max_points: Vec<u32>,

        /// Rotate scanned pages clockwise by this many degrees.
        #[arg(long)]
        rotate: Option<i32>,
    },

    /// Import a roster (csv, xlsx, xlsm, xlsb) as the session gradebook.
    ImportRoster { source: PathBuf },

    /// Read scans, stamp score tables and update the grading documents.
    Prepare {
        /// Read every scan file, processed or not.
        #[arg(long, conflicts_with = "files")]
        all: bool,

        /// Read only these scan files.
        #[arg(long, num_args = 1..)]
        files: Vec<String>,

        /// Ask about pages that cannot be resolved.
        #[arg(long)]
        interactive: bool,

        /// Reset the grading state first.
        #[arg(long)]
        init: bool,
    },

    /// Ask about every pending page, then update the grading documents.
    Resolve,

    /// Rebuild every grading document from the committed pages.
    Rebuild,

    /// Write every page of the grading documents out as a single page.
    Split { dest: PathBuf },

    /// Read the marked scores of the graded documents into the gradebook.
    ReadScores {
        /// Write the scored gradebook here instead of replacing it.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Regroup graded pages into one document per exam copy.
    Assemble,

    /// Serve the review API for pending pages.
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        bind: String,
    },

    /// Forget all progress and committed pages.
    Reset,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scangrade=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let layout = Layout::new(&cli.dir, cli.gradebook.as_deref());

    match cli.command {
        Commands::MakeExams {
            template,
            copies,
            prefix,
            output_dir,
            backpages,
        } => {
            let written = make_exams::make_exams(&ExamCopies {
                template,
                copies,
                prefix,
                output_dir: output_dir.unwrap_or_else(|| layout.main_dir.clone()),
                backpages,
            })?;
            println!("Wrote {} exam copies", written.len());
        }
        Commands::Config {
            exam_name,
            max_points,
            rotate,
        } => {
            let mut config = GradingConfig::load(&layout.config_file)?;
            if exam_name.is_some() {
                config.exam_name = exam_name;
            }
            if !max_points.is_empty() {
                config.max_points = max_points;
            }
            if rotate.is_some() {
                config.rotate = rotate;
            }
            config.validate()?;
            config.save(&layout.config_file)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::ImportRoster { source } => {
            let roster = Roster::import(&source)
                .with_context(|| format!("Failed to import roster {:?}", source))?;
            std::fs::create_dir_all(&layout.main_dir)?;
            roster.save(&layout.gradebook)?;
            println!("Imported {} students into {:?}", roster.len(), layout.gradebook);
        }
        Commands::Prepare {
            all,
            files,
            interactive,
            init,
        } => {
            if init {
                pipeline::reset(&layout)?;
            }
            let selection = if all {
                ScanSelection::All
            } else if !files.is_empty() {
                ScanSelection::Only(files)
            } else {
                ScanSelection::New
            };
            let mut session = open_session(layout)?;
            let engine = ReconciliationEngine::from_config(&session.config);
            let mut console = console_resolver(&session);
            let resolver: Option<&mut dyn Resolver> = if interactive {
                Some(&mut console)
            } else {
                None
            };
            let report = pipeline::prepare_grading(&mut session, &engine, &selection, resolver)?;
            println!(
                "Read {} scan files: {} pages committed, {} grading documents created, {} extended",
                report.scans.len(),
                report.pages.committed.len(),
                report.aggregates.built.len(),
                report.aggregates.extended.len()
            );
            if report.pages.unreadable > 0 {
                println!(
                    "{} pages had no readable image and were set aside.",
                    report.pages.unreadable
                );
            }
            print_pending(report.pending);
        }
        Commands::Resolve => {
            let mut session = open_session(layout)?;
            let engine = ReconciliationEngine::from_config(&session.config);
            let mut console = console_resolver(&session);
            let report = engine.resolve_pending(&mut session, Some(&mut console))?;
            let (_, aggregates) = pipeline::finish_pass(&mut session)?;
            println!(
                "{} pages committed, {} grading documents updated",
                report.committed.len(),
                aggregates.built.len() + aggregates.extended.len()
            );
            print_pending(session.ledger.pending_pages.len());
        }
        Commands::Rebuild => {
            let mut session = open_session(layout)?;
            let report = AggregationEngine::rebuild_all(&mut session)?;
            println!("Rebuilt {} grading documents", report.built.len());
        }
        Commands::Split { dest } => {
            let session = open_session(layout)?;
            let written = AggregationEngine::split_aggregates(&session, &dest)?;
            println!("Wrote {} pages to {:?}", written, dest);
        }
        Commands::ReadScores { output } => {
            let mut session = open_session(layout)?;
            let sheet = scores::read_scores(&session)?;
            let scored = scores::record_scores(&mut session.roster, &sheet)?;
            let dest = output.unwrap_or_else(|| session.layout.gradebook.clone());
            session.roster.save(&dest)?;
            println!(
                "Recorded scores of {} pages for {} students in {:?}",
                sheet.pages.len(),
                scored,
                dest
            );
        }
        Commands::Assemble => {
            let session = open_session(layout)?;
            let written = assemble::assemble_by_student(&session)?;
            println!(
                "Assembled {} graded exams in {:?}",
                written.len(),
                session.layout.graded_dir
            );
        }
        Commands::Serve { bind } => {
            let session = open_session(layout)?;
            let engine = ReconciliationEngine::from_config(&session.config);
            let state = server::AppState::new(server::Reviewer::new(session, engine));
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(server::serve(state, &bind))?;
        }
        Commands::Reset => {
            pipeline::reset(&layout)?;
            println!("Grading state in {:?} reset", layout.main_dir);
        }
    }
    Ok(())
}

fn open_session(layout: Layout) -> anyhow::Result<Session> {
    let config = GradingConfig::load(&layout.config_file)?;
    info!("Grading session in {:?}", layout.main_dir);
    Session::open(layout, config).context("Failed to open grading session")
}

fn console_resolver(
    session: &Session,
) -> ConsoleResolver<std::io::StdinLock<'static>, std::io::Stdout> {
    let preview = session.layout.carryover.with_file_name("pending_page.png");
    ConsoleResolver::new(std::io::stdin().lock(), std::io::stdout()).with_preview(preview)
}

fn print_pending(pending: usize) {
    match pending {
        0 => println!("All pages were processed successfully."),
        1 => println!("There is 1 page with a missing code or person number."),
        n => println!("There are {} pages with a missing code or person number.", n),
    }
}
