//! Nyl CLI - render templated Kubernetes packages

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod display;
mod error;
mod exit_codes;

use commands::template::TemplateArgs;

#[derive(Parser)]
#[command(name = "nyl")]
#[command(version)]
#[command(
    about = "Render templated Kubernetes packages with live cluster lookups",
    long_about = None
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a package and everything it instantiates
    Template {
        /// Package directory or single YAML file
        package: PathBuf,

        /// Values file(s) to merge
        #[arg(short = 'f', long = "values")]
        values: Vec<PathBuf>,

        /// Set values on command line (key=value)
        #[arg(long = "set")]
        set: Vec<String>,

        /// Deployment document (secret stores, search path, cluster settings)
        #[arg(long, env = "NYL_DEPLOYMENT")]
        deployment: Option<PathBuf>,

        /// Bind the root package to an Application
        #[arg(long)]
        application: Option<String>,

        /// Default namespace of the bound Application
        #[arg(short, long, requires = "application")]
        namespace: Option<String>,

        /// Write manifests to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Do not contact the cluster; every lookup is deferred
        #[arg(long)]
        offline: bool,

        /// Helm binary used for HelmChart resources
        #[arg(long, env = "NYL_HELM", default_value = "helm")]
        helm_binary: PathBuf,
    },
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    miette::set_panic_hook();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if !err.use_stderr() => err.exit(),
        Err(err) => {
            let _ = err.print();
            std::process::exit(exit_codes::USAGE_ERROR);
        }
    };

    init_tracing(cli.debug);

    let result = match cli.command {
        Commands::Template {
            package,
            values,
            set,
            deployment,
            application,
            namespace,
            output,
            offline,
            helm_binary,
        } => {
            commands::template::run(TemplateArgs {
                package,
                values,
                set,
                deployment,
                application,
                namespace,
                output,
                offline,
                helm_binary,
            })
            .await
        }
    };

    if let Err(err) = result {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}
