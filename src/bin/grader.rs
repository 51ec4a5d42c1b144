//! CLI binary for homework-grader.
//!
//! A thin shim over the library crate: `split` runs the per-student PDF
//! splitter on its own, `grade` submits a file through the task queue and
//! polls it to completion.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use homework_grader::{
    split_pdf, GraderConfig, GradingProgressCallback, GradingResult, HomeworkService, Layout,
    PdfiumToolkit, SplitOptions, Subject, Submission, TaskStatus,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

const AFTER_HELP: &str = r#"EXAMPLES:
  # Split a class scan into 2-page student documents
  grader split class-3b.pdf --pages-per-student 2 --output-dir out/

  # Grade a single photo of English homework
  grader grade photo.jpg --subject english

  # Split and grade a class scan, two-column worksheets
  grader grade class-3b.pdf --subject math --layout double --pages-per-student 2

  # Try the pipeline without an API key
  grader grade class-3b.pdf --pages-per-student 2 --mock --json

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key
  OPENAI_API_KEY          OpenAI API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (gemini, openai, anthropic, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium; the system library is used otherwise
  GRADER_*                Every flag can also be set through its GRADER_ variable
"#;

/// Split and grade scanned homework with a multimodal model.
#[derive(Parser, Debug)]
#[command(
    name = "grader",
    version,
    about = "Split and grade scanned homework with a multimodal model",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "GRADER_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and results.
    #[arg(short, long, global = true, env = "GRADER_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split a PDF into one document per student.
    Split(SplitArgs),
    /// Grade a PDF or image, optionally splitting it per student first.
    Grade(GradeArgs),
}

#[derive(Args, Debug)]
struct SplitArgs {
    /// PDF to split.
    pdf: PathBuf,

    /// Pages belonging to each student.
    #[arg(short, long, env = "GRADER_PAGES_PER_STUDENT",
          value_parser = clap::value_parser!(u32).range(1..))]
    pages_per_student: u32,

    /// Directory that receives the session folder.
    #[arg(short, long, env = "GRADER_OUTPUT_DIR", default_value = "uploads/split")]
    output_dir: PathBuf,

    /// Fail when a student document has the wrong number of pages.
    #[arg(long, env = "GRADER_STRICT_PAGE_COUNT")]
    strict: bool,

    /// Print the split outcome as JSON.
    #[arg(long, env = "GRADER_JSON")]
    json: bool,
}

#[derive(Args, Debug)]
struct GradeArgs {
    /// PDF, JPEG or PNG to grade.
    file: PathBuf,

    /// english, chinese, math or general.
    #[arg(short, long, env = "GRADER_SUBJECT", default_value = "general")]
    subject: Subject,

    /// single or double (two-column pages).
    #[arg(short, long, env = "GRADER_LAYOUT", default_value = "single")]
    layout: Layout,

    /// Split a PDF into units of this many pages, one per student.
    #[arg(short, long, env = "GRADER_PAGES_PER_STUDENT",
          value_parser = clap::value_parser!(u32).range(1..))]
    pages_per_student: Option<u32>,

    /// Replace the default task prompt.
    #[arg(long, env = "GRADER_PROMPT")]
    prompt: Option<String>,

    /// Use canned results instead of calling a model.
    #[arg(long, env = "GRADER_MOCK")]
    mock: bool,

    /// LLM model ID (e.g. gemini-2.0-flash, gpt-4.1-mini).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: gemini, openai, anthropic, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Students graded at once across tasks.
    #[arg(short, long, env = "GRADER_WORKERS", default_value_t = 5)]
    workers: usize,

    /// Model attempts per student before giving up.
    #[arg(long, env = "GRADER_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    /// Per-call model timeout in seconds (grows by 30s per retry).
    #[arg(long, env = "GRADER_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Root for split output.
    #[arg(long, env = "GRADER_UPLOAD_ROOT", default_value = "uploads")]
    upload_root: PathBuf,

    /// Fail when a student document has the wrong number of pages.
    #[arg(long, env = "GRADER_STRICT_PAGE_COUNT")]
    strict: bool,

    /// Print the final status report as JSON.
    #[arg(long, env = "GRADER_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Split(args) => run_split(args, cli.quiet).await,
        Command::Grade(args) => run_grade(args, cli.quiet).await,
    }
}

// ── split ────────────────────────────────────────────────────────────────

async fn run_split(args: SplitArgs, quiet: bool) -> Result<()> {
    let outcome = split_pdf(
        Arc::new(PdfiumToolkit::new()),
        &args.pdf,
        args.pages_per_student as usize,
        &args.output_dir,
        SplitOptions {
            strict_page_count: args.strict,
        },
    )
    .await
    .with_context(|| format!("Failed to split {}", args.pdf.display()))?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome).context("Failed to serialise split outcome")?
        );
        return Ok(());
    }

    for unit in &outcome.units {
        println!("{}", unit.output.display());
    }
    if !quiet {
        eprintln!(
            "{} {} pages → {} students  {}",
            green("✔"),
            outcome.total_pages,
            bold(&outcome.units.len().to_string()),
            dim(&outcome.session_dir.display().to_string()),
        );
    }
    Ok(())
}

// ── grade ────────────────────────────────────────────────────────────────

/// Prints one line per student above the polling bar.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl GradingProgressCallback for CliProgressCallback {
    fn on_unit_complete(&self, _task_id: &str, unit: usize, total: usize) {
        self.bar
            .println(format!("  {} Student {:>3}/{:<3}", green("✓"), unit, total));
    }

    fn on_unit_error(&self, _task_id: &str, unit: usize, total: usize, error: &str) {
        let msg = match error.char_indices().nth(80) {
            Some((cut, _)) => format!("{}\u{2026}", &error[..cut]),
            None => error.to_string(),
        };
        self.bar.println(format!(
            "  {} Student {:>3}/{:<3}  {}",
            red("✗"),
            unit,
            total,
            red(&msg)
        ));
    }
}

fn polling_bar(hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} students  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    bar.set_prefix("Grading");
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

async fn run_grade(args: GradeArgs, quiet: bool) -> Result<()> {
    let mut builder = GraderConfig::builder()
        .worker_count(args.workers)
        .max_attempts(args.max_attempts)
        .api_timeout(Duration::from_secs(args.api_timeout))
        .upload_root(args.upload_root.clone())
        .strict_page_count(args.strict)
        .mock_grading(args.mock);
    if let Some(model) = &args.model {
        builder = builder.model(model.clone());
    }
    if let Some(provider) = &args.provider {
        builder = builder.provider_name(provider.clone());
    }
    let config = builder.build().context("Invalid configuration")?;

    let bar = polling_bar(quiet || args.json);
    let service = HomeworkService::new(config)
        .context("Failed to initialise the grading service")?
        .with_progress(Arc::new(CliProgressCallback { bar: bar.clone() }));

    let mut submission = Submission::new(&args.file)
        .subject(args.subject)
        .layout(args.layout);
    if let Some(pages) = args.pages_per_student {
        submission = submission.pages_per_student(pages as usize);
    }
    if let Some(prompt) = &args.prompt {
        submission = submission.prompt(prompt.clone());
    }

    let task_id = service
        .submit(submission)
        .await
        .with_context(|| format!("Failed to submit {}", args.file.display()))?;

    let report = loop {
        let report = service
            .get_task_status(&task_id)
            .context("Task disappeared while polling")?;
        bar.set_length(report.total as u64);
        bar.set_position(report.processed as u64);
        if report.is_terminal() {
            break report;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    };
    bar.finish_and_clear();

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if report.status == TaskStatus::Failed {
        eprintln!(
            "{} {}",
            red("✘"),
            report.error.as_deref().unwrap_or("task failed")
        );
    } else {
        let slots = service
            .queue()
            .get_task(&task_id)
            .map(|t| t.results().to_vec())
            .unwrap_or_default();
        for (i, slot) in slots.iter().enumerate() {
            print_student(i + 1, slot.as_deref());
        }
        if !quiet {
            eprintln!(
                "{} {}/{} students graded",
                if report.processed == report.total {
                    green("✔")
                } else {
                    cyan("⚠")
                },
                bold(&report.processed.to_string()),
                report.total
            );
        }
    }

    service.shutdown().await;
    if report.status == TaskStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_student(number: usize, payload: Option<&str>) {
    let Some(payload) = payload else {
        println!("{} Student {number}: {}", red("✗"), dim("not graded"));
        return;
    };
    let Ok(result) = serde_json::from_str::<GradingResult>(payload) else {
        println!("{} Student {number}: {payload}", cyan("?"));
        return;
    };

    let (correct, judged) = result.tally();
    let score = match &result.overall_score {
        Some(homework_grader::grading::Score::Number(n)) => format!("score {n}"),
        Some(homework_grader::grading::Score::Text(s)) => format!("score {s}"),
        None => String::new(),
    };
    println!(
        "{} {}  {}  {}",
        green("◆"),
        bold(&format!("Student {number}")),
        if judged > 0 {
            format!("{correct}/{judged} correct")
        } else {
            format!("{} answers", result.answers.len())
        },
        dim(&score)
    );
    for answer in &result.answers {
        let mark = match answer.is_correct {
            Some(true) => green("✓"),
            Some(false) => red("✗"),
            None => dim("·"),
        };
        println!("   {mark} Q{}: {}", answer.question_number, answer.student_answer);
        if let Some(fix) = answer.correct_answer.as_deref().or(answer.correct_steps.as_deref()) {
            println!("       {}", dim(fix));
        }
    }
    if let Some(feedback) = &result.feedback {
        println!("   {}", dim(feedback));
    }
}
