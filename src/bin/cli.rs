//! sandrun CLI
//!
//! Command-line interface for running snippets and managing the engine.

use clap::{Parser, Subcommand};
use console::style;
use sandrun::config::{
    apply_env_overrides, load_config, load_config_from_path, load_dotenv, sample_config,
    validate_config,
};
use sandrun::sandbox::{
    ContainerRuntime, DockerRuntime, ErrorClassification, LanguageRegistry, WorkspaceDir,
    WorkspaceStore, LABEL_MANAGED,
};
use sandrun::{
    Config, ConstantTag, Error, ExecutionRequest, ExecutionResult, ExecutionStatus, Result,
    SandboxEngine, VERSION,
};
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "sandrun",
    author = "sandrun Contributors",
    version = VERSION,
    about = "sandrun - Sandboxed execution of untrusted code snippets",
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML or JSON5)
    #[arg(long, short, global = true, env = "SANDRUN_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a source file (or stdin) in the sandbox
    Run {
        /// Language id
        language: String,
        /// Source file; `-` or absent reads stdin
        file: Option<PathBuf>,
        /// Inline source instead of a file
        #[arg(long, short = 'e')]
        code: Option<String>,
        /// Session key selecting the workspace
        #[arg(long, short, default_value = "default")]
        session: String,
        /// File name inside the workspace's code directory
        #[arg(long)]
        name: Option<String>,
        /// Timeout in seconds
        #[arg(long, short)]
        timeout: Option<u64>,
        /// Memory ceiling, e.g. 128m
        #[arg(long)]
        memory: Option<String>,
        /// CPU share in cores
        #[arg(long)]
        cpus: Option<f64>,
        /// Constant the program computes (pi, e, golden_ratio, sqrt2, sqrt3, ln2)
        #[arg(long)]
        verify: Option<String>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List supported languages
    Languages,

    /// Validate configuration and check the container runtime
    Check,

    /// Show a workspace and its files
    Workspace {
        /// Session key
        session: String,
        /// Only list one directory (code, data, output)
        #[arg(long)]
        dir: Option<String>,
    },

    /// Pull runtime images ahead of time
    Prepare {
        /// Language ids; all when omitted
        languages: Vec<String>,
    },

    /// Remove units left behind by a crashed process
    Reap,

    /// Print a sample configuration
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // `--config` can come from SANDRUN_CONFIG in .env
    load_dotenv();
    let cli = Cli::parse();

    init_logging(cli.log_json);

    match cli.command {
        Commands::Run {
            language,
            file,
            code,
            session,
            name,
            timeout,
            memory,
            cpus,
            verify,
            json,
        } => {
            let source = read_source(code, file).await?;
            let mut request = ExecutionRequest::new(language, source).with_session(session);
            request.file_name = name;
            request.timeout_secs = timeout;
            request.memory_limit = memory;
            request.cpu_limit = cpus;
            if let Some(tag) = verify {
                request = request.with_verify(tag.parse::<ConstantTag>()?);
            }
            run_code(cli.config, request, json).await
        }
        Commands::Languages => list_languages(cli.config),
        Commands::Check => check_status(cli.config).await,
        Commands::Workspace { session, dir } => show_workspace(cli.config, &session, dir).await,
        Commands::Prepare { languages } => prepare_images(cli.config, languages).await,
        Commands::Reap => reap().await,
        Commands::InitConfig => init_config(),
    }
}

/// Logs go to stderr so program output on stdout stays clean
fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sandrun=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = load_config_from_path(&path)?;
            apply_env_overrides(&mut config);
            Ok(config)
        }
        None => load_config(),
    }
}

async fn read_source(code: Option<String>, file: Option<PathBuf>) -> Result<String> {
    if let Some(code) = code {
        return Ok(code);
    }
    match file {
        Some(path) if path.as_os_str() != "-" => Ok(tokio::fs::read_to_string(&path).await?),
        _ => {
            let mut source = String::new();
            tokio::io::stdin().read_to_string(&mut source).await?;
            Ok(source)
        }
    }
}

/// Run code in the sandbox; Ctrl-C cancels it
async fn run_code(config: Option<PathBuf>, request: ExecutionRequest, json: bool) -> Result<()> {
    let engine = SandboxEngine::connect(load(config)?).await?;

    let mut ticket = engine.spawn(request).await?;
    let id = ticket.execution_id.clone();

    let finished = tokio::select! {
        joined = &mut ticket.join => Some(joined),
        _ = tokio::signal::ctrl_c() => None,
    };
    let joined = match finished {
        Some(joined) => joined,
        None => {
            if engine.cancel(&id) {
                eprintln!("{}", style("Cancelling...").yellow());
            }
            ticket.join.await
        }
    };
    let result = joined.map_err(|e| Error::Internal(format!("execution task failed: {}", e)))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    if !result.success() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_result(result: &ExecutionResult) {
    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
        if !result.stdout.ends_with('\n') {
            println!();
        }
        if result.stdout_truncated {
            println!("{}", style("[stdout truncated]").dim());
        }
    }
    if !result.stderr.is_empty() {
        eprint!("{}", style(&result.stderr).red());
        if result.stderr_truncated {
            eprintln!("{}", style("[stderr truncated]").dim());
        }
    }

    let status = match result.status {
        ExecutionStatus::Completed if result.success() => style("✅ completed".to_string()).green(),
        ExecutionStatus::TimedOut => style("⏱  timed out".to_string()).yellow(),
        ExecutionStatus::Killed => style("🛑 killed".to_string()).yellow(),
        status => style(format!("❌ {}", status)).red(),
    };
    let exit = result
        .exit_code
        .map(|code| format!(", exit {}", code))
        .unwrap_or_default();
    eprintln!(
        "\n{}{} in {:?} ({} · {})",
        status,
        exit,
        result.duration(),
        result.language,
        style(result.execution_id.short()).dim()
    );

    if let Some(classification) = result.error_classification {
        let label = match classification {
            ErrorClassification::SyntaxError => "Syntax error",
            ErrorClassification::RuntimeException => "Runtime exception",
            ErrorClassification::ResourceViolation => "Resource violation",
            ErrorClassification::InfrastructureError => "Infrastructure error",
        };
        eprintln!(
            "{}: {}",
            style(label).red().bold(),
            result.error_summary.as_deref().unwrap_or("")
        );
    }

    if let Some(v) = &result.verification {
        let mark = if v.within_tolerance { "✅" } else { "❌" };
        let actual = v
            .actual
            .map(|a| a.to_string())
            .unwrap_or_else(|| "no number found".to_string());
        eprintln!(
            "{} {}: expected {}, got {} (tolerance {})",
            mark, v.constant, v.expected, actual, v.tolerance
        );
    }
}

fn list_languages(config: Option<PathBuf>) -> Result<()> {
    let config = load(config)?;
    let registry = LanguageRegistry::from_table(&config.languages)?;

    println!("{}", style("Supported languages").bold());
    for language in registry.iter() {
        let sample = language.default_file_name("xxxxxxxx");
        println!(
            "\n  {} ({})",
            style(&language.id).cyan().bold(),
            style(format!(".{}", language.file_extension)).dim()
        );
        println!("    image:   {}", language.runtime_image);
        println!("    command: {}", language.command_for(&sample).join(" "));
        let install = language
            .install_command()
            .unwrap_or_else(|| language.install_template().to_vec());
        println!("    install: {}", install.join(" "));
        if !language.extra_packages.is_empty() {
            println!("    packages: {}", language.extra_packages.join(", "));
        }
    }
    Ok(())
}

async fn check_status(config: Option<PathBuf>) -> Result<()> {
    println!("🔍 sandrun Status\n");

    let config = match load(config) {
        Ok(c) => c,
        Err(e) => {
            println!("❌ Configuration: {}", e);
            return Ok(());
        }
    };

    let validation = validate_config(&config);
    if validation.valid {
        println!("Configuration: ✅ Valid");
    } else {
        println!("Configuration: ❌ Invalid");
    }
    for issue in &validation.errors {
        println!("  {} {}", style("error").red(), issue);
        if let Some(suggestion) = &issue.suggestion {
            println!("        {}", style(suggestion).dim());
        }
    }
    for issue in &validation.warnings {
        println!("  {} {}", style("warning").yellow(), issue);
    }
    println!("  Workspaces: {}", config.workspace.root.display());
    println!(
        "  Policy: timeout {}s (max {}s), memory {}, cpu {}, pids {}",
        config.sandbox.default_timeout_secs,
        config.sandbox.max_timeout_secs,
        config.sandbox.memory_limit,
        config.sandbox.cpu_limit,
        config.sandbox.pids_limit
    );

    match DockerRuntime::connect().await {
        Ok(_) => println!("Docker: ✅ Connected"),
        Err(e) => println!("Docker: ❌ {}", e),
    }

    Ok(())
}

async fn show_workspace(config: Option<PathBuf>, session: &str, dir: Option<String>) -> Result<()> {
    let config = load(config)?;
    let dir = dir.map(|d| d.parse::<WorkspaceDir>()).transpose()?;

    let workspace = WorkspaceStore::new(config.workspace.root).open(session).await?;
    let info = workspace.info().await?;

    println!(
        "{} {}",
        style("Workspace").bold(),
        style(&info.key).cyan().bold()
    );
    println!("  path:   {}", info.path.display());
    println!(
        "  files:  {} code, {} data, {} output ({} bytes)",
        info.code_files, info.data_files, info.output_files, info.total_size
    );

    let files = workspace.list_files(dir).await?;
    if !files.is_empty() {
        println!();
    }
    for file in files {
        let modified = file
            .modified
            .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "  {:<40} {:>10}  {}",
            file.path.display(),
            file.size,
            style(modified).dim()
        );
    }
    Ok(())
}

async fn prepare_images(config: Option<PathBuf>, languages: Vec<String>) -> Result<()> {
    let engine = SandboxEngine::connect(load(config)?).await?;

    let mut failed = false;
    for (language, outcome) in engine.prepare_images(&languages).await {
        match outcome {
            Ok(()) => println!("{} {}", style("✅").green(), language),
            Err(e) => {
                failed = true;
                println!("{} {}: {}", style("❌").red(), language, e);
            }
        }
    }

    if failed {
        return Err(Error::Container("some images could not be prepared".to_string()));
    }
    Ok(())
}

async fn reap() -> Result<()> {
    let runtime = DockerRuntime::connect().await?;
    let reaped = runtime.reap(LABEL_MANAGED).await?;
    println!("Removed {} orphaned unit(s)", reaped);
    Ok(())
}

fn init_config() -> Result<()> {
    println!("{}", sample_config()?);
    Ok(())
}
