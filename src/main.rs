use clap::{Parser, Subcommand};
use schema_mcp::Result;
use schema_mcp::commands::{index, serve, show_config, show_status};
use schema_mcp::config::Config;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schema-mcp")]
#[command(about = "MCP server for a relational database with semantic table lookup")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show where configuration is read from
    Config {
        /// Show the effective configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
    /// Index table schemas, then start the MCP server on stdio
    Serve,
    /// Run one indexing pass for tables not indexed yet, then exit
    Index,
    /// Show the state of the database, the vector collection and the ledger
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the MCP protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { show } => {
            show_config(show)?;
        }
        Commands::Serve => {
            serve(Config::load()?).await?;
        }
        Commands::Index => {
            index(Config::load()?).await?;
        }
        Commands::Status => {
            show_status().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn serve_command() {
        let cli = Cli::try_parse_from(["schema-mcp", "serve"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert!(matches!(parsed.command, Commands::Serve));
        }
    }

    #[test]
    fn index_command() {
        let cli = Cli::try_parse_from(["schema-mcp", "index"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert!(matches!(parsed.command, Commands::Index));
        }
    }

    #[test]
    fn status_command() {
        let cli = Cli::try_parse_from(["schema-mcp", "status"]);
        assert!(matches!(cli.map(|c| c.command), Ok(Commands::Status)));
    }

    #[test]
    fn config_show_flag() {
        let cli = Cli::try_parse_from(["schema-mcp", "config", "--show"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Config { show } = parsed.command {
                assert!(show);
            }
        }
    }

    #[test]
    fn config_without_flag() {
        let cli = Cli::try_parse_from(["schema-mcp", "config"]);
        assert!(matches!(
            cli.map(|c| c.command),
            Ok(Commands::Config { show: false })
        ));
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["schema-mcp", "frobnicate"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["schema-mcp", "--help"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
    }
}
