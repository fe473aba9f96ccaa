//! pg-gateway binary: serve the REST API or run one-off queries from the
//! command line.

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};

use pg_gateway::config::Config;
use pg_gateway::models::{QueryRequest, ReturnType};
use pg_gateway::observability;
use pg_gateway::orchestrator::QueryOrchestrator;
use pg_gateway::server;

#[derive(Debug, Parser)]
#[command(name = "pg-gateway", version, about = "Natural-language-to-SQL gateway for PostgreSQL")]
struct Cli {
    /// Configuration file (defaults to config.toml + config.local.toml + env)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the REST API server
    Serve,
    /// Answer one question and print the response as JSON
    Query {
        /// The natural-language question
        question: String,
        /// Target database (optional when exactly one is configured)
        #[arg(short, long)]
        database: Option<String>,
        /// Extra context appended to the generation prompt
        #[arg(long)]
        context: Option<String>,
        /// Generate and validate only, skip execution
        #[arg(long)]
        sql_only: bool,
    },
    /// Introspect a database and print its schema as JSON
    Schema {
        /// Target database (optional when exactly one is configured)
        #[arg(short, long)]
        database: Option<String>,
    },
    /// List configured databases
    Databases,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load configuration from {path}"))?,
        None => Config::load().context("failed to load configuration")?,
    };
    observability::init_tracing(&config.logging);

    match cli.command {
        Command::Serve => {
            let http = config.http.clone();
            if !http.enabled {
                anyhow::bail!("http.enabled is false; nothing to serve");
            }
            let gateway = QueryOrchestrator::from_config(config)?;
            if gateway.start_auto_refresh() {
                tracing::info!("schema auto-refresh enabled");
            }
            server::serve(gateway, http).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Query {
            question,
            database,
            context,
            sql_only,
        } => {
            let gateway = QueryOrchestrator::from_config(config)?;
            let mut request = QueryRequest::new(question);
            request.database = database;
            request.context = context;
            if sql_only {
                request.return_type = ReturnType::Sql;
            }

            let response = gateway.execute_query(request).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            gateway.shutdown().await;
            Ok(if response.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Schema { database } => {
            let gateway = QueryOrchestrator::from_config(config)?;
            let target = match database.or_else(|| gateway.default_database()) {
                Some(name) => name,
                None => anyhow::bail!(
                    "multiple databases configured, pass --database (available: {})",
                    gateway.database_names().join(", ")
                ),
            };
            let schema = gateway.schema(&target).await?;
            println!("{}", serde_json::to_string_pretty(schema.as_ref())?);
            gateway.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Databases => {
            for name in config.database_names() {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
