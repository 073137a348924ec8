use std::io::{self, BufRead};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use droma_broker::app::{Broker, LoadRequest, OperationRequest, PreloadFailure};
use droma_broker::bridge::{RscriptBridge, RuntimeBridge};
use droma_broker::config::{ConfigLoader, ResolvedConfig};
use droma_broker::domain::{DataType, DatasetId, DatasetKind, MolecularType, Operation};
use droma_broker::error::{DromaError, ErrorCategory};
use droma_broker::output::{ErrorPayload, JsonOutput, OutputMode};
use droma_broker::registry::RegistryListing;

#[derive(Parser)]
#[command(name = "droma-broker")]
#[command(about = "Dataset registry and result cache for DROMA drug-omics analyses")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Serve line commands from stdin, one JSON reply per line")]
    Session,
    #[command(about = "Check the R runtime and configured paths")]
    Doctor,
    #[command(about = "Print the resolved configuration")]
    Config,
}

#[derive(Parser)]
#[command(no_binary_name = true)]
struct SessionLine {
    #[command(subcommand)]
    command: SessionCommand,
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    #[command(about = "Load a dataset from the database")]
    Load(LoadArgs),
    #[command(about = "Unload a dataset and release its runtime object")]
    Unload(DatasetArgs),
    #[command(about = "Make a loaded dataset the active one")]
    Activate(DatasetArgs),
    #[command(about = "List loaded datasets")]
    Datasets {
        #[arg(long)]
        details: bool,
    },
    #[command(about = "Fetch molecular profiles into the cache")]
    Profiles(ProfilesArgs),
    #[command(about = "Fetch treatment response into the cache")]
    Response(ResponseArgs),
    #[command(about = "Audit the normalization of a cached result")]
    Audit { key: String },
    #[command(about = "Show one cached result, or all of them")]
    Cache { key: Option<String> },
    #[command(about = "Export a cached table as CSV")]
    Export {
        key: String,
        #[arg(long)]
        filename: Option<String>,
    },
    #[command(about = "Evict stale cache entries and exports")]
    Evict {
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
    #[command(about = "Drop every cached result")]
    ClearCache,
    #[command(about = "List CSV exports")]
    Exports,
    #[command(about = "End the session")]
    Quit,
}

#[derive(Debug, Args)]
struct LoadArgs {
    id: String,

    #[arg(long, value_enum)]
    kind: Option<DatasetKind>,

    #[arg(long)]
    db_path: Option<Utf8PathBuf>,

    #[arg(long)]
    no_activate: bool,
}

#[derive(Debug, Args)]
struct DatasetArgs {
    id: String,

    #[arg(long, value_enum)]
    kind: Option<DatasetKind>,
}

#[derive(Debug, Args)]
struct FilterArgs {
    #[arg(long)]
    dataset: Option<String>,

    #[arg(long)]
    multi: bool,

    #[arg(long, value_enum, ignore_case = true, default_value_t = DataType::All)]
    data_type: DataType,

    #[arg(long, default_value = "all")]
    tumor_type: String,

    #[arg(long)]
    overlap_only: bool,

    #[arg(long, help = "Skip z-score normalization")]
    raw: bool,
}

#[derive(Debug, Args)]
struct ProfilesArgs {
    #[arg(value_enum, ignore_case = true)]
    molecular_type: MolecularType,

    #[arg(long, value_delimiter = ',')]
    features: Vec<String>,

    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Debug, Args)]
struct ResponseArgs {
    #[arg(long, value_delimiter = ',')]
    drugs: Vec<String>,

    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Serialize)]
struct SessionReady<'a> {
    status: &'static str,
    loaded: RegistryListing,
    preload_failures: &'a [PreloadFailure],
}

#[derive(Serialize)]
struct DoctorReport {
    rscript: Option<String>,
    runtime_version: Option<String>,
    r_libs: Option<String>,
    db_path: Option<String>,
    db_path_exists: bool,
    workspace_dir: String,
    exports_dir: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(droma) = report.downcast_ref::<DromaError>() {
            return ExitCode::from(map_exit_code(droma));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &DromaError) -> u8 {
    match error.category() {
        ErrorCategory::NotFound => 2,
        ErrorCategory::BridgeUnavailable | ErrorCategory::RuntimeFailure => 3,
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
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Session => run_session(config),
        Commands::Doctor => run_doctor(config),
        Commands::Config => JsonOutput::new(OutputMode::Pretty)
            .print_json(&config)
            .into_diagnostic(),
    }
}

fn build_bridge(config: &ResolvedConfig) -> RscriptBridge {
    RscriptBridge::new(
        config.rscript.clone(),
        config.r_libs.clone(),
        config.workspace_dir.clone(),
    )
}

fn run_doctor(config: ResolvedConfig) -> miette::Result<()> {
    let bridge = build_bridge(&config);
    let report = DoctorReport {
        rscript: bridge.rscript().map(|path| path.display().to_string()),
        runtime_version: bridge.runtime_version(),
        r_libs: config.r_libs.clone(),
        db_path_exists: config
            .db_path
            .as_ref()
            .is_some_and(|path| path.as_std_path().exists()),
        db_path: config.db_path.as_ref().map(|path| path.to_string()),
        workspace_dir: bridge.workspace().to_string(),
        exports_dir: config.exports_dir.to_string(),
    };
    JsonOutput::new(OutputMode::Pretty)
        .print_json(&report)
        .into_diagnostic()
}

fn run_session(config: ResolvedConfig) -> miette::Result<()> {
    let bridge = build_bridge(&config);
    if bridge.rscript().is_none() {
        warn!("Rscript not found; only cache and registry introspection will work");
    }
    let broker = Broker::new(config, bridge);
    let output = JsonOutput::new(OutputMode::Line);

    let failures = broker.preload();
    output
        .print_json(&SessionReady {
            status: "ready",
            loaded: broker.registry().list(),
            preload_failures: &failures,
        })
        .into_diagnostic()?;

    let sweep_every = broker.config().cache_max_age;
    let mut last_sweep = Instant::now();
    for line in io::stdin().lock().lines() {
        let line = line.into_diagnostic()?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if last_sweep.elapsed() >= sweep_every {
            match broker.sweep(None) {
                Ok(result) => info!(
                    cache_entries = result.cache_entries_removed,
                    exports = result.exports_removed,
                    "periodic sweep"
                ),
                Err(err) => warn!(error = %err, "periodic sweep failed"),
            }
            last_sweep = Instant::now();
        }

        let command = match parse_line(trimmed) {
            Ok(command) => command,
            Err(message) => {
                output
                    .print_json(&ErrorPayload {
                        status: "error",
                        category: "invalid_input",
                        message,
                    })
                    .into_diagnostic()?;
                continue;
            }
        };
        if matches!(command, SessionCommand::Quit) {
            break;
        }
        execute(&broker, &output, command).into_diagnostic()?;
    }

    broker.shutdown();
    Ok(())
}

// Quoted arguments keep their spaces: `--tumor-type "breast cancer"`.
fn parse_line(line: &str) -> Result<SessionCommand, String> {
    let words = shlex::split(line).ok_or_else(|| "unbalanced quotes".to_string())?;
    SessionLine::try_parse_from(words)
        .map(|parsed| parsed.command)
        .map_err(|err| err.render().to_string().trim().to_string())
}

fn execute<B: RuntimeBridge>(
    broker: &Broker<B>,
    output: &JsonOutput,
    command: SessionCommand,
) -> io::Result<()> {
    match command {
        SessionCommand::Load(args) => respond(
            output,
            load_request(args).and_then(|request| broker.load_dataset(&request)),
            JsonOutput::print_load,
        ),
        SessionCommand::Unload(args) => respond(
            output,
            dataset_target(&args).and_then(|(id, kind)| broker.unload_dataset(&id, kind)),
            JsonOutput::print_unload,
        ),
        SessionCommand::Activate(args) => respond(
            output,
            dataset_target(&args).and_then(|(id, kind)| broker.set_active_dataset(&id, kind)),
            |out, listing| out.print_json(listing),
        ),
        SessionCommand::Datasets { details } => {
            output.print_datasets(&broker.list_datasets(details))
        }
        SessionCommand::Profiles(args) => respond(
            output,
            profiles_request(args).and_then(|request| broker.run_operation(&request)),
            JsonOutput::print_operation,
        ),
        SessionCommand::Response(args) => respond(
            output,
            response_request(args).and_then(|request| broker.run_operation(&request)),
            JsonOutput::print_operation,
        ),
        SessionCommand::Audit { key } => respond(
            output,
            broker.check_normalization(&key),
            JsonOutput::print_audit,
        ),
        SessionCommand::Cache { key } => respond(
            output,
            broker.cached_info(key.as_deref()),
            JsonOutput::print_cache,
        ),
        SessionCommand::Export { key, filename } => respond(
            output,
            broker.export_cached(&key, filename.as_deref()),
            |out, record| out.print_json(record),
        ),
        SessionCommand::Evict { max_age_hours } => respond(
            output,
            broker.sweep(max_age_hours.map(|hours| Duration::from_secs(hours.saturating_mul(3600)))),
            JsonOutput::print_sweep,
        ),
        SessionCommand::ClearCache => respond(output, broker.clear_cache(), |out, removed| {
            out.print_json(&serde_json::json!({ "status": "success", "removed": removed }))
        }),
        SessionCommand::Exports => output.print_json(&broker.exports().list()),
        SessionCommand::Quit => Ok(()),
    }
}

fn respond<T>(
    output: &JsonOutput,
    result: Result<T, DromaError>,
    print: impl FnOnce(&JsonOutput, &T) -> io::Result<()>,
) -> io::Result<()> {
    match result {
        Ok(value) => print(output, &value),
        Err(err) => {
            warn!(error = %err, "command failed");
            output.print_error(&err)
        }
    }
}

fn load_request(args: LoadArgs) -> Result<LoadRequest, DromaError> {
    let dataset_id: DatasetId = args.id.parse()?;
    Ok(LoadRequest {
        kind: args.kind.unwrap_or_else(|| dataset_id.default_kind()),
        dataset_id,
        db_path: args.db_path,
        set_active: !args.no_activate,
    })
}

fn dataset_target(args: &DatasetArgs) -> Result<(DatasetId, DatasetKind), DromaError> {
    let id: DatasetId = args.id.parse()?;
    let kind = args.kind.unwrap_or_else(|| id.default_kind());
    Ok((id, kind))
}

fn filtered_request(operation: Operation, filter: FilterArgs) -> Result<OperationRequest, DromaError> {
    let dataset = filter.dataset.map(|id| id.parse::<DatasetId>()).transpose()?;
    Ok(OperationRequest {
        dataset,
        overlap_only: filter.overlap_only,
        data_type: filter.data_type,
        tumor_type: filter.tumor_type,
        zscore: !filter.raw,
        ..OperationRequest::new(operation)
    })
}

fn profiles_request(args: ProfilesArgs) -> Result<OperationRequest, DromaError> {
    let operation = if args.filter.multi {
        Operation::MultiMolecularProfiles
    } else {
        Operation::MolecularProfiles
    };
    let mut request = filtered_request(operation, args.filter)?;
    request.molecular_type = Some(args.molecular_type);
    request.features = (!args.features.is_empty()).then_some(args.features);
    Ok(request)
}

fn response_request(args: ResponseArgs) -> Result<OperationRequest, DromaError> {
    let operation = if args.filter.multi {
        Operation::MultiTreatmentResponse
    } else {
        Operation::TreatmentResponse
    };
    let mut request = filtered_request(operation, args.filter)?;
    request.drugs = (!args.drugs.is_empty()).then_some(args.drugs);
    Ok(request)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn parse(line: &str) -> SessionCommand {
        parse_line(line).unwrap()
    }

    #[test]
    fn quoted_values_keep_their_spaces() {
        let SessionCommand::Profiles(args) =
            parse(r#"profiles mRNA --tumor-type "breast cancer" --data-type CellLine"#)
        else {
            panic!("expected profiles");
        };
        let request = profiles_request(args).unwrap();
        assert_eq!(request.tumor_type, "breast cancer");
        assert_eq!(request.data_type, DataType::CellLine);

        let SessionCommand::Response(args) = parse("response --tumor-type 'lung cancer'") else {
            panic!("expected response");
        };
        assert_eq!(response_request(args).unwrap().tumor_type, "lung cancer");
    }

    #[test]
    fn unbalanced_quotes_are_rejected() {
        let err = parse_line(r#"profiles mRNA --tumor-type "breast cancer"#).unwrap_err();
        assert_eq!(err, "unbalanced quotes");
    }

    #[test]
    fn profiles_line_builds_request() {
        let SessionCommand::Profiles(args) =
            parse("profiles mrna --features TP53,EGFR --dataset CCLE --raw")
        else {
            panic!("expected profiles");
        };
        let request = profiles_request(args).unwrap();
        assert_eq!(request.operation, Operation::MolecularProfiles);
        assert_eq!(request.molecular_type, Some(MolecularType::Mrna));
        assert_eq!(
            request.features,
            Some(vec!["TP53".to_string(), "EGFR".to_string()])
        );
        assert!(!request.zscore);
        assert_eq!(request.dataset.unwrap().as_str(), "CCLE");
    }

    #[test]
    fn multi_response_line_selects_multi_operation() {
        let SessionCommand::Response(args) = parse("response --multi --overlap-only") else {
            panic!("expected response");
        };
        let request = response_request(args).unwrap();
        assert_eq!(request.operation, Operation::MultiTreatmentResponse);
        assert!(request.overlap_only);
        assert_eq!(request.drugs, None);
    }

    #[test]
    fn load_infers_kind_from_id() {
        let SessionCommand::Load(args) = parse("load CCLE,gCSI --no-activate") else {
            panic!("expected load");
        };
        let request = load_request(args).unwrap();
        assert_eq!(request.kind, DatasetKind::Multi);
        assert!(!request.set_active);
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert!(parse_line("frobnicate").is_err());
        assert_matches!(parse("clear-cache"), SessionCommand::ClearCache);
    }

    #[test]
    fn exit_codes_follow_error_category() {
        assert_eq!(
            map_exit_code(&DromaError::DatasetNotFound("x".to_string())),
            2
        );
        assert_eq!(map_exit_code(&DromaError::BridgeUnavailable), 3);
        assert_eq!(map_exit_code(&DromaError::ConfigParse("x".to_string())), 1);
    }
}
