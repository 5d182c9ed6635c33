use clap::{Parser, Subcommand};
use slog::{error, o, Drain};
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::{Coordinator, StaticConfig};

#[derive(Parser)]
#[command(name = "validator-supervisor", about = "Runs one Eth2 validator against remote beacon nodes over authenticated tunnels")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive setup is an external collaborator; this only validates an existing config.
    Setup {
        #[arg(long)]
        config_path: PathBuf,
    },
    /// Run the supervisor daemon.
    Daemon {
        #[arg(long)]
        config_path: PathBuf,
    },
    /// Drive a running daemon's RPC socket.
    Control {
        #[arg(long)]
        config_path: PathBuf,
        #[command(subcommand)]
        action: ControlAction,
    },
}

#[derive(Subcommand)]
enum ControlAction {
    GetHealth,
    Start,
    Stop,
    Connect { host: String, port: Option<u16> },
    Unlock { password: String },
    Shutdown,
}

fn build_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, o!())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let log = build_logger();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime builds");

    match runtime.block_on(run(cli, log.clone())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(log, "fatal error"; "error" => %err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, log: slog::Logger) -> Result<(), supervisor::Error> {
    match cli.command {
        Command::Setup { config_path } => {
            // Interactive setup itself (password capture, config generation) is an external
            // collaborator per spec.md §1; this subcommand only checks the config it produced.
            let _ = StaticConfig::load(&config_path)?;
            println!("{} is valid", config_path.display());
            Ok(())
        }
        Command::Daemon { config_path } => {
            let config = StaticConfig::load(&config_path)?;
            let sock_path = config.rpc_sock_path();
            let coordinator = Coordinator::new(config, log)?;
            install_signal_handlers(coordinator.clone());
            let result = coordinator.run().await;
            let _ = std::fs::remove_file(sock_path);
            result
        }
        Command::Control { config_path, action } => {
            let config = StaticConfig::load(&config_path)?;
            run_control(&config, action).await
        }
    }
}

fn install_signal_handlers(coordinator: std::sync::Arc<Coordinator>) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing a SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        coordinator.request_shutdown();
    });
}

async fn run_control(config: &StaticConfig, action: ControlAction) -> Result<(), supervisor::Error> {
    let (user, auth_key) = config
        .rpc_users
        .iter()
        .next()
        .ok_or_else(|| supervisor::Error::InvalidConfig("no rpc_users configured".to_string()))?;
    let client = rpc::RpcClient::new(user.clone(), auth_key.clone(), config.rpc_sock_path());

    match action {
        ControlAction::GetHealth => {
            let health = client.get_health().await?;
            println!("{}", serde_json::to_string_pretty(&health).expect("health is valid JSON"));
        }
        ControlAction::Start => println!("started: {}", client.start_validator().await?),
        ControlAction::Stop => println!("stopped: {}", client.stop_validator().await?),
        ControlAction::Connect { host, port } => client.connect_eth2_node(host, port).await?,
        ControlAction::Unlock { password } => println!("unlocked: {}", client.unlock(password).await?),
        ControlAction::Shutdown => client.shutdown().await?,
    }
    Ok(())
}
