use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_connectome::config::ConfigLoader;
use kira_connectome::domain::{DatasetId, DatasetKind};
use kira_connectome::error::KiraError;
use kira_connectome::extract::AtlasAverager;
use kira_connectome::merge::DatasetMerger;
use kira_connectome::migrate::{UpgradeOptions, upgrade_dir};
use kira_connectome::nifti::NiftiLoader;
use kira_connectome::output::{JsonOutput, LogProgress, SanitizeResult};
use kira_connectome::pipeline::Pipeline;
use kira_connectome::sanitize::MatrixSanitizer;
use kira_connectome::store::{WriteOutcome, format_matrix, read_matrix, write_new};

#[derive(Parser)]
#[command(name = "kira-cg")]
#[command(about = "Trial-based functional-connectivity graph builder")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Build per-trial graph records from the configured scans")]
    Build(BuildArgs),
    #[command(about = "Repair non-finite values in a precomputed connectivity matrix")]
    Sanitize(SanitizeArgs),
    #[command(about = "Add missing task and dataset fields to existing records")]
    Upgrade(UpgradeArgs),
    #[command(about = "Merge record directories into one de-duplicated corpus")]
    Merge(MergeArgs),
}

#[derive(Args)]
struct BuildArgs {
    #[arg(long)]
    config: Option<String>,
}

#[derive(Args)]
struct SanitizeArgs {
    input: Utf8PathBuf,

    /// Defaults to `<input stem>.sanitized.txt` next to the input.
    #[arg(long)]
    output: Option<Utf8PathBuf>,

    #[arg(long, default_value_t = 1.0)]
    diagonal: f64,

    #[arg(long, default_value_t = 0.0)]
    nan: f64,

    #[arg(long, default_value_t = 1.0)]
    pos_inf: f64,

    #[arg(long, default_value_t = -1.0, allow_negative_numbers = true)]
    neg_inf: f64,
}

#[derive(Args)]
struct UpgradeArgs {
    dir: Utf8PathBuf,

    #[arg(long)]
    dataset: String,

    #[arg(long)]
    kind: DatasetKind,

    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct MergeArgs {
    corpus: Utf8PathBuf,

    #[arg(required = true)]
    sources: Vec<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::MissingConfig
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::ConfigInvalid(_)
        | KiraError::InvalidIdentifier(_)
        | KiraError::InvalidDatasetKind(_) => 2,
        KiraError::AtlasUnavailable(_)
        | KiraError::InputUnreadable { .. }
        | KiraError::InvalidMatrix(_)
        | KiraError::OutputUnwritable(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build(args) => run_build(args),
        Commands::Sanitize(args) => run_sanitize(args),
        Commands::Upgrade(args) => run_upgrade(args),
        Commands::Merge(args) => run_merge(args),
    }
}

fn run_build(args: BuildArgs) -> miette::Result<()> {
    let config = ConfigLoader::resolve(args.config.as_deref())?;
    let pipeline = Pipeline::new(config, NiftiLoader, AtlasAverager);
    let result = pipeline.run(&LogProgress)?;
    JsonOutput::print_build(&result).into_diagnostic()?;
    Ok(())
}

fn run_sanitize(args: SanitizeArgs) -> miette::Result<()> {
    let sanitizer = MatrixSanitizer {
        nan: args.nan,
        pos_inf: args.pos_inf,
        neg_inf: args.neg_inf,
        diagonal: args.diagonal,
    };
    sanitizer.validate()?;

    let mut matrix = read_matrix(args.input.as_std_path())?;
    let report = sanitizer.sanitize_in_place(&mut matrix)?;
    let output = args.output.unwrap_or_else(|| {
        let stem = args.input.file_stem().unwrap_or("matrix");
        args.input.with_file_name(format!("{stem}.sanitized.txt"))
    });
    if write_new(&output, format_matrix(matrix.view()).as_bytes())? == WriteOutcome::AlreadyExists {
        return Err(miette::Report::msg(format!(
            "{output} already exists, refusing to overwrite"
        )));
    }

    JsonOutput::print_sanitize(&SanitizeResult {
        input: args.input.to_string(),
        output: output.to_string(),
        size: matrix.nrows(),
        report,
    })
    .into_diagnostic()?;
    Ok(())
}

fn run_upgrade(args: UpgradeArgs) -> miette::Result<()> {
    let dataset: DatasetId = args.dataset.parse()?;
    let options = UpgradeOptions {
        dataset,
        kind: args.kind,
        force: args.force,
    };
    let summary = upgrade_dir(&args.dir, &options)?;
    JsonOutput::print_upgrade(&summary).into_diagnostic()?;
    Ok(())
}

fn run_merge(args: MergeArgs) -> miette::Result<()> {
    let merger = DatasetMerger::new(args.corpus);
    let summary = merger.merge(&args.sources)?;
    JsonOutput::print_merge(&summary).into_diagnostic()?;
    Ok(())
}
