use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

use reposcope::config::{default_config_path, load_client_config};
use reposcope::{ClientConfig, ResearchClient, ResearchError};

#[derive(Parser)]
#[command(name = "reposcope", version, about = "Query a repository research MCP server")]
struct Cli {
    /// YAML config file (defaults to the platform config dir, then the environment)
    #[arg(long, env = "REPOSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for reposcope.log
    #[arg(long, env = "REPOSCOPE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Write logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print the connection status and discovered tools
    Status,
    /// Print configuration problems without starting the server
    Check,
    /// Clone and index a repository (e.g. "org/repo")
    Index { repository: String },
    /// Semantic search over an indexed repository
    Search {
        repository: String,
        query: String,
        #[arg(long, default_value_t = 10)]
        max_results: u32,
    },
    /// Pattern search over repository code
    CodeSearch {
        repository: String,
        pattern: String,
        /// Restrict to a file extension (e.g. "rs")
        #[arg(long)]
        file_type: Option<String>,
    },
    /// Print one file of an indexed repository
    ReadFile { repository: String, path: String },
    /// Print the file tree of an indexed repository
    Structure { repository: String },
}

fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<ClientConfig> {
    if let Some(path) = explicit {
        return load_client_config(&path)
            .with_context(|| format!("loading {}", path.display()));
    }
    match default_config_path().filter(|p| p.exists()) {
        Some(path) => load_client_config(&path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(ClientConfig::from_env()),
    }
}

fn exit_error(err: &ResearchError) -> ! {
    let mut body = serde_json::to_value(err).unwrap_or_else(|_| json!({}));
    body["message"] = json!(err.to_string());
    if let Some(hint) = err.hint() {
        body["hint"] = json!(hint);
    }
    eprintln!(
        "{}",
        serde_json::to_string_pretty(&body).unwrap_or_else(|_| err.to_string())
    );
    std::process::exit(1);
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_dir = cli.log_dir.clone().unwrap_or_else(reposcope::data_dir);
    reposcope::init_tracing(&log_dir, cli.log_json).context("initializing logging")?;

    let config = load_config(cli.config)?;

    if let Commands::Check = cli.command {
        let issues = config.validate();
        print_json(&json!({ "valid": issues.is_empty(), "issues": issues }))?;
        return Ok(());
    }

    let client = ResearchClient::start(&config).unwrap_or_else(|e| exit_error(&e));
    client.connect().unwrap_or_else(|e| exit_error(&e));

    let result = match cli.command {
        Commands::Status | Commands::Check => {
            Ok(serde_json::to_value(client.connection_status())?)
        }
        Commands::Index { repository } => client.index(&repository),
        Commands::Search {
            repository,
            query,
            max_results,
        } => client.search(&repository, &query, max_results),
        Commands::CodeSearch {
            repository,
            pattern,
            file_type,
        } => client.code_search(&repository, &pattern, file_type.as_deref()),
        Commands::ReadFile { repository, path } => client.read_file(&repository, &path),
        Commands::Structure { repository } => client.get_structure(&repository),
    };

    // Stops the server before we print and exit.
    drop(client);
    match result {
        Ok(value) => print_json(&value),
        Err(e) => exit_error(&e),
    }
}
