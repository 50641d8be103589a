use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use sandterm::{
    exit_code_for_error, exit_code_for_io_error, server, telemetry_init, Collaborators, Config,
    DirProjectStore, DockerRuntime, FileSessionStore, JwtVerifier, LifecycleManager,
    Orchestrator, SessionError, SessionStore,
};

mod cli;
mod doctor;

use cli::{Cli, Command, ServeArgs};

fn exit_code(e: &anyhow::Error) -> u8 {
    if let Some(se) = e.downcast_ref::<SessionError>() {
        exit_code_for_error(se)
    } else if let Some(ioe) = e.downcast_ref::<io::Error>() {
        exit_code_for_io_error(ioe)
    } else {
        1
    }
}

fn apply_serve_args(config: &mut Config, args: &ServeArgs) {
    if let Some(b) = args.bind {
        config.bind = b;
    }
    if let Some(img) = &args.image {
        config.sandbox.image = img.clone();
    }
    if let Some(p) = args.on_disconnect {
        config.session.on_disconnect = p;
    }
    if let Some(n) = args.output_buffer {
        config.session.output_buffer = n;
    }
    if let Some(t) = args.slow_client_timeout {
        config.session.slow_client_timeout = t;
    }
}

fn lifecycle_for(config: &Config) -> anyhow::Result<LifecycleManager> {
    let runtime = Arc::new(DockerRuntime::connect(&config.docker).map_err(SessionError::from)?);
    let store = Arc::new(
        FileSessionStore::open(config.session_store_path())
            .with_context(|| format!("opening {}", config.session_store_path().display()))?,
    );
    let projects = Arc::new(DirProjectStore::new(config.projects_root()));
    Ok(LifecycleManager::new(
        runtime,
        store,
        projects,
        config.sandbox.clone(),
    ))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let secret = config.require_jwt_secret()?;
    let runtime = Arc::new(DockerRuntime::connect(&config.docker).map_err(SessionError::from)?);
    let store = Arc::new(
        FileSessionStore::open(config.session_store_path())
            .with_context(|| format!("opening {}", config.session_store_path().display()))?,
    );
    let orch = Orchestrator::new(
        Collaborators {
            verifier: Arc::new(JwtVerifier::new(secret)),
            sessions: store,
            projects: Arc::new(DirProjectStore::new(config.projects_root())),
            runtime,
        },
        config.sandbox.clone(),
        config.session.clone(),
    );
    if let Err(e) = orch.lifecycle().ping().await {
        tracing::warn!(error = %e, "container runtime not reachable yet; sessions will fail until it is");
    }
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    server::serve(listener, orch, server::shutdown_signal()).await?;
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(d) = cli.data_dir {
        config.data_dir = d;
    }
    match cli.command {
        Command::Serve(args) => {
            apply_serve_args(&mut config, &args);
            serve(config).await
        }
        Command::Doctor => Ok(doctor::run_doctor(&config, cli.verbose).await?),
        Command::Start { project, operator } => {
            let lifecycle = lifecycle_for(&config)?;
            let started = lifecycle.start_session(&project, &operator).await?;
            if started.reused {
                eprintln!("sandterm: session already active for {project}");
            }
            println!("{}", started.session_id);
            Ok(())
        }
        Command::Terminate { session } => {
            let lifecycle = lifecycle_for(&config)?;
            let done = lifecycle.terminate(&session).await?;
            println!("{}", done.message());
            Ok(())
        }
        Command::List { operator } => {
            let store = FileSessionStore::open(config.session_store_path())?;
            for r in store
                .list_active_for(&operator)
                .await
                .map_err(SessionError::from)?
            {
                println!(
                    "{}\t{}\t{}\t{}",
                    r.id,
                    r.project_id,
                    r.container_id,
                    r.start_time.to_rfc3339()
                );
            }
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry_init(cli.verbose);

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("sandterm: cannot start async runtime: {e}");
            return ExitCode::from(exit_code_for_io_error(&e));
        }
    };
    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("sandterm: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}
