use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use std::process;
use tracing_subscriber::EnvFilter;

fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("FILE")
        .default_value("config/etl.toml")
        .help("Sets a custom config file")
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config_path: &str) -> anyhow::Result<()> {
    let summary = trip_etl::run_etl_pipeline(config_path)
        .await
        .with_context(|| format!("ETL run with config {} failed", config_path))?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn list_partitions(config_path: &str) -> anyhow::Result<()> {
    let keys = trip_etl::list_output_partitions(config_path)
        .await
        .with_context(|| format!("Listing partitions with config {} failed", config_path))?;
    for key in keys {
        println!("{}", key);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = Command::new("trip-etl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Enriches taxi trips with lookup tables and writes partitioned Parquet")
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("run")
                .about("Run the ETL pipeline")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("partitions")
                .about("List the partitions committed at the destination")
                .arg(config_arg()),
        )
        .get_matches();

    init_tracing(matches.get_flag("json"));

    let result = match matches.subcommand() {
        Some(("run", run_matches)) => {
            let config_path = run_matches
                .get_one::<String>("config")
                .map(|s| s.as_str())
                .unwrap_or("config/etl.toml");
            run(config_path).await
        }

        Some(("partitions", list_matches)) => {
            let config_path = list_matches
                .get_one::<String>("config")
                .map(|s| s.as_str())
                .unwrap_or("config/etl.toml");
            list_partitions(config_path).await
        }

        _ => {
            eprintln!("Please specify a valid subcommand");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("{:#}", e);
        process::exit(1);
    }
}
