use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use mera_xfer::aggregate::GlobalIndex;
use mera_xfer::app::{App, BatchResult, ProgressSink};
use mera_xfer::config::{ConfigLoader, ResolvedConfig};
use mera_xfer::domain::{DateRange, LocationId, VariableName, VariableRequest};
use mera_xfer::error::XferError;
use mera_xfer::index::IndexLoader;
use mera_xfer::output::{JsonOutput, OutputMode, TextOutput};
use mera_xfer::store::LocalStore;
use mera_xfer::transport::{FtpTransport, LocalTransport, SshTransport, Transport, TransportKind};

const DEFAULT_INDEX_DIR: &str = "filesystems";

#[derive(Parser)]
#[command(name = "mera-xfer")]
#[command(about = "Find MERA archive files across storage locations and copy them locally")]
#[command(version)]
struct Cli {
    /// Config file (default: ./mera-xfer.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Directory holding merafiles_*.txt listings
    #[arg(long, global = true)]
    index_dir: Option<Utf8PathBuf>,

    /// Explicit listing file; repeat for several
    #[arg(long = "index", global = true)]
    index: Vec<Utf8PathBuf>,

    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List loaded storage locations")]
    Locations,
    #[command(about = "Report where requested variables are archived")]
    Locate(LocateArgs),
    #[command(about = "Copy requested files into the local mirror")]
    Fetch(FetchArgs),
    #[command(about = "Print all loaded locations as one concatenated listing")]
    Export,
}

#[derive(Args, Clone)]
struct RequestArgs {
    /// Comma-separated variable names
    #[arg(long, value_delimiter = ',')]
    vars: Vec<String>,

    /// START_END, each YYYY-MM or YYYY-MM-DD
    #[arg(long)]
    dates: Option<String>,

    #[arg(long)]
    location: Option<String>,
}

#[derive(Args, Clone)]
struct LocateArgs {
    #[command(flatten)]
    request: RequestArgs,
}

#[derive(Args, Clone)]
struct FetchArgs {
    #[command(flatten)]
    request: RequestArgs,

    #[arg(long)]
    local_root: Option<Utf8PathBuf>,

    #[arg(long)]
    transport: Option<TransportKind>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    max_attempts: Option<u32>,

    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<XferError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &XferError) -> u8 {
    match error {
        XferError::MalformedIndex { .. }
        | XferError::IndexRead(_)
        | XferError::NoIndices(_)
        | XferError::InvalidLocation(_)
        | XferError::UnknownLocation(_)
        | XferError::UnknownVariable(_)
        | XferError::InvalidVariable(_)
        | XferError::InvalidDateRange(_)
        | XferError::InvalidTemplate { .. }
        | XferError::ConfigRead(_)
        | XferError::ConfigParse(_)
        | XferError::InvalidConfig(_) => 2,
        XferError::Connection { .. } | XferError::MissingTool(_) => 3,
        XferError::IncompleteTransfer { .. } => 4,
        XferError::Filesystem(_) => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let index = load_index(&cli, &config)?;

    match cli.command {
        Commands::Locations => {
            let app = read_only_app(config, index)?;
            let result = app.locations();
            let printed = match output_mode {
                OutputMode::Json => JsonOutput::print_locations(&result),
                OutputMode::Text => TextOutput::print_locations(&result),
            };
            printed.into_diagnostic()
        }
        Commands::Export => {
            let app = read_only_app(config, index)?;
            print!("{}", app.export());
            Ok(())
        }
        Commands::Locate(args) => {
            let request = build_request(&args.request, &config)?;
            let location = parse_location(&args.request)?;
            let app = read_only_app(config, index)?;
            let report = app.locate(&request, location.as_ref(), sink(output_mode))?;
            let printed = match output_mode {
                OutputMode::Json => JsonOutput::print_report(&report),
                OutputMode::Text => TextOutput::print_report(&report),
            };
            printed.into_diagnostic()
        }
        Commands::Fetch(args) => run_fetch(args, config, index, output_mode),
    }
}

fn run_fetch(
    args: FetchArgs,
    mut config: ResolvedConfig,
    index: GlobalIndex,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let request = build_request(&args.request, &config)?;
    let location = parse_location(&args.request)?;

    if let Some(user) = args.user {
        config.transfer.remote_user = Some(user);
    }
    if let Some(max_attempts) = args.max_attempts {
        if max_attempts == 0 {
            return Err(
                XferError::InvalidConfig("--max-attempts must be at least 1".to_string()).into(),
            );
        }
        config.transfer.max_attempts = max_attempts;
    }
    let root = match args.local_root.or_else(|| config.transfer.local_root.clone()) {
        Some(root) => root,
        None => LocalStore::default_root()?,
    };
    let store = LocalStore::new(root);
    let options = config.transfer.transfer_options();

    // A dry run never connects, so it does not need the ssh tools.
    let kind = args.transport.unwrap_or(config.transfer.transport);
    if args.dry_run || kind == TransportKind::Local {
        let app = App::new(config.catalog, index, store, LocalTransport, options);
        return finish_fetch(&app, &request, location.as_ref(), args.dry_run, output_mode);
    }
    if kind == TransportKind::Ftp {
        let transport = FtpTransport::new(config.transfer.ftp_options());
        let app = App::new(config.catalog, index, store, transport, options);
        return finish_fetch(&app, &request, location.as_ref(), args.dry_run, output_mode);
    }
    let transport = SshTransport::new(config.transfer.ssh_options())?;
    let app = App::new(config.catalog, index, store, transport, options);
    finish_fetch(&app, &request, location.as_ref(), args.dry_run, output_mode)
}

fn finish_fetch<T: Transport>(
    app: &App<T>,
    request: &VariableRequest,
    location: Option<&LocationId>,
    dry_run: bool,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let result = app.fetch(request, location, dry_run, sink(output_mode))?;
    let printed = match output_mode {
        OutputMode::Json => JsonOutput::print_fetch(&result),
        OutputMode::Text => TextOutput::print_fetch(&result),
    };
    printed.into_diagnostic()?;

    if let Some(BatchResult::Unreachable {
        location, host, reason, ..
    }) = result.unreachable().next()
    {
        return Err(XferError::Connection {
            location: location.to_string(),
            host: host.clone(),
            message: reason.clone(),
        }
        .into());
    }
    let failed = result.failed_files();
    if failed > 0 {
        return Err(XferError::IncompleteTransfer {
            failed,
            total: result.total_files(),
        }
        .into());
    }
    Ok(())
}

fn sink(output_mode: OutputMode) -> &'static dyn ProgressSink {
    match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Text => &TextOutput,
    }
}

fn read_only_app(
    config: ResolvedConfig,
    index: GlobalIndex,
) -> miette::Result<App<LocalTransport>> {
    let root = match config.transfer.local_root.clone() {
        Some(root) => root,
        None => LocalStore::default_root()?,
    };
    Ok(App::new(
        config.catalog,
        index,
        LocalStore::new(root),
        LocalTransport,
        config.transfer.transfer_options(),
    ))
}

fn load_index(cli: &Cli, config: &ResolvedConfig) -> Result<GlobalIndex, XferError> {
    let files = if cli.index.is_empty() {
        let dir = cli
            .index_dir
            .clone()
            .or_else(|| config.index_dir.clone())
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_INDEX_DIR));
        IndexLoader::discover(&dir)?
    } else {
        cli.index.clone()
    };

    let mut load = IndexLoader::load_files(&files);
    if load.indices.is_empty() {
        if let Some(err) = load.rejected.pop() {
            return Err(err);
        }
    }
    Ok(GlobalIndex::from_locations(load.indices))
}

fn build_request(
    args: &RequestArgs,
    config: &ResolvedConfig,
) -> Result<VariableRequest, XferError> {
    let variables = if args.vars.is_empty() {
        config.variables.clone()
    } else {
        args.vars
            .iter()
            .map(|name| name.parse::<VariableName>())
            .collect::<Result<Vec<_>, _>>()?
    };
    if variables.is_empty() {
        return Err(XferError::InvalidConfig(
            "no variables requested (use --vars or `variables` in the config)".to_string(),
        ));
    }

    let range = match &args.dates {
        Some(dates) => dates.parse::<DateRange>()?,
        None => config.dates.ok_or_else(|| {
            XferError::InvalidDateRange(
                "no date range given (use --dates or `dates` in the config)".to_string(),
            )
        })?,
    };
    Ok(VariableRequest::new(variables, range))
}

fn parse_location(args: &RequestArgs) -> Result<Option<LocationId>, XferError> {
    args.location.as_deref().map(str::parse::<LocationId>).transpose()
}
