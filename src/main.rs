use serverfacts::cli::{CliArgs, Commands};
use serverfacts::extractors::{
    ApacheExtractor, CheckoutsExtractor, DockerExtractor, Extractor, GeoserverExtractor,
    HaproxyExtractor, NginxExtractor, PbisExtractor, PostgresExtractor, RabbitmqExtractor,
};
use serverfacts::fs::RealFileSystem;
use serverfacts::util::logging::{self, LoggingConfig};
use serverfacts::{runner, VERSION};

use clap::Parser;
use tracing::{debug, Level};

fn main() {
    let args = CliArgs::parse();
    init_logging_from_args(&args);

    debug!("serverfacts v{} starting", VERSION);
    debug!("Arguments: {:?}", args);

    let fs = RealFileSystem::new();
    let result = match args.command {
        Commands::All => {
            runner::run_all(&fs);
            Ok(())
        }
        Commands::Apache => ApacheExtractor::default().run(&fs),
        Commands::Checkouts => CheckoutsExtractor::default().run(&fs),
        Commands::Docker => DockerExtractor::default().run(&fs),
        Commands::Geoserver => GeoserverExtractor::default().run(&fs),
        Commands::Haproxy => HaproxyExtractor::default().run(&fs),
        Commands::Nginx => NginxExtractor::default().run(&fs),
        Commands::Pbis => PbisExtractor::default().run(&fs),
        Commands::Postgres => PostgresExtractor::default().run(&fs),
        Commands::Rabbitmq => RabbitmqExtractor::default().run(&fs),
    };

    if let Err(err) = result {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn init_logging_from_args(args: &CliArgs) {
    let level = if let Some(level_str) = &args.log_level {
        logging::parse_level(level_str)
    } else if args.verbose {
        Level::DEBUG
    } else if args.quiet {
        Level::ERROR
    } else {
        Level::WARN
    };

    logging::init_logging(LoggingConfig::with_level(level));
}
