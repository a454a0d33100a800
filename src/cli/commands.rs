use clap::{Parser, Subcommand};

/// Information-gathering scripts for Linux servers
#[derive(Parser, Debug)]
#[command(
    name = "serverfacts",
    about = "Extract facts from web server configs, databases, containers and checkouts",
    version,
    long_about = "serverfacts gathers information from config files, running services \
                  and version-control checkouts on a Linux server. Each subcommand \
                  writes one JSON fact file for the inventory system plus single-value \
                  scalar files for the monitoring agent."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Verbose output")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - suppress non-error output"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    #[command(about = "Run all extractors in one batch (excludes geoserver)")]
    All,

    #[command(about = "Extract site info from apache configs")]
    Apache,

    #[command(about = "Extract git/package/django info from /srv checkouts")]
    Checkouts,

    #[command(about = "Extract image/container/volume info from docker")]
    Docker,

    #[command(about = "Extract workspace usage and datastores from geoserver")]
    Geoserver,

    #[command(about = "Extract site info from the haproxy config")]
    Haproxy,

    #[command(about = "Extract site info from nginx configs")]
    Nginx,

    #[command(about = "Check the pbis AD bridge status")]
    Pbis,

    #[command(about = "Extract database sizes and usage from postgres")]
    Postgres,

    #[command(about = "Check rabbitmq queue depths against configured limits")]
    Rabbitmq,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_args_verify() {
        // Verify that CLI structure is valid
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_subcommand_parsing() {
        let args = CliArgs::parse_from(["serverfacts", "nginx"]);
        assert_eq!(args.command, Commands::Nginx);
        assert!(!args.verbose);
        assert!(!args.quiet);
    }

    #[test]
    fn test_global_verbose_flag() {
        let args = CliArgs::parse_from(["serverfacts", "-v", "all"]);
        assert!(args.verbose);
        assert!(!args.quiet);
    }

    #[test]
    fn test_global_quiet_flag() {
        let args = CliArgs::parse_from(["serverfacts", "-q", "docker"]);
        assert!(args.quiet);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(CliArgs::try_parse_from(["serverfacts", "-v", "-q", "all"]).is_err());
    }

    #[test]
    fn test_log_level_flag() {
        let args = CliArgs::parse_from(["serverfacts", "--log-level", "debug", "haproxy"]);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(CliArgs::try_parse_from(["serverfacts", "cifs"]).is_err());
    }
}
