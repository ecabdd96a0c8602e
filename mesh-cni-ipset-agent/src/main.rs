use std::process::ExitCode;

use clap::Parser;
use mesh_cni_ipset_agent::config::{Cli, Commands};
use mesh_cni_ipset_agent::reconciler::{self, SystemReconciler};
use mesh_cni_ipset_agent::{Error, Result};
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_subscriber();
    match run(cli.command).await {
        Ok(()) => {
            info!("Exiting...");
            ExitCode::SUCCESS
        }
        Err(e) => {
            if e.is_unrecoverable() {
                error!(%e, "ip sets can no longer be reconciled, exiting");
            } else {
                error!(%e, "exiting with error");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Run(args) => {
            let reconciler = SystemReconciler::from_args(&args.ipset)?;
            let cancel = tokio_util::sync::CancellationToken::new();
            let mut reconciler_handle = tokio::spawn(reconciler::run(
                reconciler,
                args.resync_interval(),
                args.cleanup_interval(),
                cancel.child_token(),
            ));
            let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
            // watch for shutdown and errors
            tokio::select! {
                h = &mut reconciler_handle => exit("reconciler", h),
                _ = &mut shutdown_handle => {
                    cancel.cancel();
                    exit("reconciler", reconciler_handle.await)
                },
            }
        }
        Commands::Apply(args) => {
            tokio::task::spawn_blocking(move || -> Result<()> {
                let mut reconciler = SystemReconciler::from_args(&args)?;
                reconciler.sync()?;
                reconciler.cleanup();
                Ok(())
            })
            .await?
        }
        Commands::Cleanup(args) => {
            tokio::task::spawn_blocking(move || -> Result<()> {
                let mut reconciler = SystemReconciler::from_args(&args)?;
                reconciler.stage()?;
                reconciler.cleanup();
                Ok(())
            })
            .await?
        }
    }
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh_cni_ipset=info,mesh_cni_ipset_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(%e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(%e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {
            info!("captured ctrl_c signal");
        },
        _ = terminate => {
            info!("captured terminate signal");
        },
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) -> Result<()> {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}");
            Err(e)
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}");
            Err(Error::Join(e))
        }
    }
}
