use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fnctl::api::{FunctionApi, HttpFunctionApi, Target};
use fnctl::orchestrator::{DEFAULT_CONCURRENCY, patch_function};
use fnctl::{
    DesiredState, FileConfig, FunctionName, Ledger, Namespace, Overrides, RedeployOptions,
    TargetFilter, WaitOptions, create_redeployer,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fnctl")]
#[command(about = "Batch control plane for deployed functions")]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Base URL of the function-management API
    #[arg(long, env = "FNCTL_API_URL", global = true)]
    api_url: Option<String>,
    /// Namespace the functions live in
    #[arg(short, long, env = "FNCTL_NAMESPACE", global = true)]
    namespace: Option<String>,
    #[arg(long, env = "FNCTL_USERNAME", global = true)]
    username: Option<String>,
    #[arg(long, env = "FNCTL_PASSWORD", global = true, hide_env_values = true)]
    password: Option<String>,
    /// Bearer token (takes precedence over username/password)
    #[arg(long, env = "FNCTL_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,
    /// Per-request timeout in seconds
    #[arg(long, global = true)]
    request_timeout: Option<u64>,
}

#[derive(Args)]
struct WaitArgs {
    /// Wait for each function to settle after patching it
    #[arg(long, default_value_t = false)]
    wait: bool,
    /// Seconds to wait for a function to settle
    #[arg(long, default_value_t = 180)]
    wait_timeout: u64,
    /// Seconds between status checks while waiting
    #[arg(long, default_value_t = 2)]
    poll_interval: u64,
}

impl WaitArgs {
    fn options(&self) -> Option<WaitOptions> {
        self.wait.then(|| WaitOptions {
            timeout: Duration::from_secs(self.wait_timeout),
            poll_interval: Duration::from_secs(self.poll_interval.max(1)),
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Redeploy many functions at once
    Redeploy {
        /// Functions to redeploy (all functions in the namespace when omitted)
        functions: Vec<String>,
        /// Comma-separated function names to leave alone
        #[arg(long, value_delimiter = ',')]
        exclude_functions: Vec<String>,
        /// Comma-separated projects whose functions are left alone
        #[arg(long, value_delimiter = ',')]
        exclude_projects: Vec<String>,
        /// Skip functions that request GPU resources
        #[arg(long, default_value_t = false)]
        exclude_functions_with_gpu: bool,
        /// Only redeploy functions in the `imported` state
        #[arg(long, default_value_t = false)]
        imported_only: bool,
        /// Label selector passed to the function listing
        #[arg(long)]
        label_selector: Option<String>,
        /// Retry the retryable failures recorded in the report file
        #[arg(long, default_value_t = false)]
        from_report: bool,
        /// Report file read by --from-report and written by --save-report
        #[arg(long, default_value = "redeploy-report.json")]
        report_file_path: PathBuf,
        /// Save the run report to --report-file-path
        #[arg(long, default_value_t = false)]
        save_report: bool,
        /// Save the report after every function, not only at the end
        #[arg(long, default_value_t = false)]
        checkpoint: bool,
        /// Maximum functions redeployed at once (0 = unbounded)
        #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
        concurrency: usize,
        /// State to converge to: ready or scaledToZero
        #[arg(long, default_value = "ready")]
        desired_state: DesiredState,
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Patch a single function's desired state
    Patch {
        name: String,
        /// State to converge to: ready or scaledToZero
        #[arg(long, default_value = "ready")]
        desired_state: DesiredState,
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Show a saved redeploy report and print its retryable functions
    Report {
        #[arg(default_value = "redeploy-report.json")]
        path: PathBuf,
    },
}

fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling in-flight work");
            signal_cancel.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose { "fnctl=debug" } else { "fnctl=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    let connection = cli.connection;
    let overrides = Overrides {
        api_url: connection.api_url,
        namespace: connection.namespace,
        username: connection.username,
        password: connection.password,
        token: connection.token,
        request_timeout_secs: connection.request_timeout,
    };

    match cli.command {
        Commands::Redeploy {
            functions,
            exclude_functions,
            exclude_projects,
            exclude_functions_with_gpu,
            imported_only,
            label_selector,
            from_report,
            report_file_path,
            save_report,
            checkpoint,
            concurrency,
            desired_state,
            wait,
        } => {
            let settings = FileConfig::load()?.resolve(overrides);
            info!(
                api_url = %settings.client.base_url,
                namespace = %settings.namespace,
                "Starting redeploy"
            );

            let mut options = RedeployOptions::new(Namespace::new(settings.namespace.clone()));
            options.functions = functions.into_iter().map(FunctionName::from).collect();
            options.filter = TargetFilter::allow_all()
                .exclude_functions(exclude_functions)
                .exclude_projects(exclude_projects)
                .exclude_gpu(exclude_functions_with_gpu)
                .imported_only(imported_only);
            options.label_selector = label_selector;
            options.from_report = from_report.then(|| report_file_path.clone());
            options.report_path = (save_report || checkpoint).then(|| report_file_path.clone());
            options.checkpoint = checkpoint;
            options.concurrency = concurrency;
            options.desired_state = desired_state;
            options.wait = wait.options();

            let redeployer = create_redeployer(&settings)?;
            let ledger = redeployer.run(&options, cancel_on_interrupt()).await?;

            let snapshot = ledger.snapshot().await;
            println!(
                "Redeployed {} function(s), skipped {}, failed {}",
                snapshot.success.len(),
                snapshot.skipped.len(),
                snapshot.failed.len()
            );
        }
        Commands::Patch {
            name,
            desired_state,
            wait,
        } => {
            let settings = FileConfig::load()?.resolve(overrides);
            let api = HttpFunctionApi::new(&settings.client)?;
            let namespace = Namespace::new(settings.namespace);
            let name = FunctionName::new(name);

            let record = api
                .get_function(&namespace, &name)
                .await
                .with_context(|| format!("Failed to fetch function {}", name))?;
            let mut target = Target::from_record(&record, &namespace);
            target.name = name.clone();

            patch_function(
                &api,
                &target,
                desired_state,
                wait.options(),
                &cancel_on_interrupt(),
            )
            .await
            .with_context(|| format!("Failed to patch function {}", name))?;

            if wait.wait {
                println!("Function {} is {}", name, desired_state.target_state());
            } else {
                println!("Function {} patched to {}", name, desired_state);
            }
        }
        Commands::Report { path } => {
            let ledger = Ledger::load_from_file(&path)
                .await
                .with_context(|| format!("Failed to load report {}", path.display()))?;
            ledger.log_summary().await;

            for name in ledger.get_retryable_names().await {
                println!("{}", name);
            }
        }
    }

    Ok(())
}
