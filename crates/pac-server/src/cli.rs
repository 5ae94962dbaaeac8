use clap::{Parser, Subcommand};

/// Pipelines-as-Code controller
#[derive(Parser, Debug)]
#[command(name = "pac-controller")]
#[command(version = pac_core::VERSION)]
#[command(about = "Runs CI pipelines declared in .tekton/ from forge events", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to listen on, overrides PAC_LISTEN_ADDR
    #[arg(long, global = true)]
    pub listen: Option<String>,

    /// Database URL, overrides DATABASE_URL
    #[arg(long, global = true)]
    pub database_url: Option<String>,
}

#[derive(Subcommand, Debug, Default)]
pub enum Commands {
    /// Run the controller in the foreground (default if no command given)
    #[default]
    Run,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_is_the_default() {
        let cli = Cli::parse_from(["pac-controller"]);
        assert!(cli.command.is_none());

        let cli = Cli::parse_from(["pac-controller", "run", "--listen", "127.0.0.1:9000"]);
        assert!(matches!(cli.command, Some(Commands::Run)));
        assert_eq!(cli.listen.as_deref(), Some("127.0.0.1:9000"));
    }
}
