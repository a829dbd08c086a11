use anyhow::Result;
use clap::{CommandFactory, Parser};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use fasthttpd::config::{
    apply_edit_exprs, bundle_by_listen, minimal_config, unmarshal_yaml_path, Config,
};
use fasthttpd::logger::rotate_shared;
use fasthttpd::Server;

#[derive(Parser)]
#[command(name = "fasthttpd")]
#[command(about = "FastHttpd is a high-performance HTTP/1.1 server", disable_version_flag = true)]
struct Args {
    /// Configuration file (multi-document YAML, one document per host)
    #[arg(short = 'f', value_name = "file", env = "FASTHTTPD_CONFIG")]
    file: Option<String>,

    /// Edit expression applied to the configuration (eg. -e KEY=VALUE)
    #[arg(short = 'e', value_name = "KEY=VALUE")]
    edit: Vec<String>,

    /// Print version
    #[arg(short = 'v')]
    version: bool,

    /// Enable debug diagnostics
    #[arg(long)]
    verbose: bool,
}

fn load_configs(args: &Args) -> Result<Vec<Config>> {
    let cfgs = match &args.file {
        Some(file) => {
            let cfgs = unmarshal_yaml_path(file)?;
            // Relative paths in the configuration resolve against its
            // directory.
            if let Some(dir) = Path::new(file).parent() {
                if !dir.as_os_str().is_empty() {
                    std::env::set_current_dir(dir)?;
                }
            }
            cfgs
        }
        None => vec![minimal_config()],
    };
    Ok(apply_edit_exprs(cfgs, &args.edit)?)
}

#[cfg(unix)]
fn watch_hangup() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(err) => {
            warn!("failed to install SIGHUP handler: {}", err);
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("signal hup: rotate logs");
            if let Err(err) = rotate_shared() {
                error!("failed to rotate logs: {}", err);
            }
        }
    });
}

#[cfg(not(unix))]
fn watch_hangup() {}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if args.file.is_none() && args.edit.is_empty() {
        Args::command().print_help()?;
        return Ok(());
    }

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("fasthttpd={}", level))
        .init();

    let cfgs = load_configs(&args)?;
    let bundles = bundle_by_listen(cfgs);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut serves = JoinSet::new();
    for (listen, bundle) in bundles {
        let server = Arc::new(Server::new(&listen, bundle)?);
        let listener = server.bind().await?;
        server
            .handler()
            .printf(&format!("starting fasthttpd on {:?}", listen));
        serves.spawn(server.serve(listener, shutdown_tx.subscribe()));
    }

    watch_hangup();

    let shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("signal int: shutdown fasthttpd");
            let _ = shutdown.send(());
        }
    });

    let mut errs: Vec<String> = Vec::new();
    while let Some(joined) = serves.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => errs.push(err.to_string()),
            Err(err) => errs.push(err.to_string()),
        }
    }
    if !errs.is_empty() {
        anyhow::bail!("failed to serve: {}", errs.join("; "));
    }
    info!("fasthttpd shutdown complete");
    Ok(())
}
