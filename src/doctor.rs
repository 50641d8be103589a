use sandterm::{Config, ContainerRuntime, DockerRuntime, SessionError};

pub(crate) async fn run_doctor(config: &Config, verbose: bool) -> Result<(), SessionError> {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!("sandterm doctor");
    eprintln!();
    eprintln!("  version: v{}", version);
    eprintln!(
        "  host:    {} / {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    if verbose {
        eprintln!(
            "  build:   {} ({}, {})",
            env!("SANDTERM_BUILD_DATE"),
            env!("SANDTERM_BUILD_TARGET"),
            env!("SANDTERM_BUILD_PROFILE")
        );
    }
    eprintln!();

    eprintln!("  bind:        {}", config.bind);
    eprintln!("  data dir:    {}", config.data_dir.display());
    eprintln!(
        "  jwt secret:  {}",
        if config.jwt_secret.is_some() {
            "set"
        } else {
            "(missing; required for serve)"
        }
    );
    eprintln!();

    let s = &config.sandbox;
    eprintln!("  image:       {}", s.image);
    eprintln!(
        "  limits:      memory {} MiB, swap {} MiB, cpuset {}",
        s.memory_mb, s.swap_mb, s.cpuset
    );
    eprintln!("  network:     {}", s.network_mode);
    let st = &config.session;
    eprintln!("  on disconnect: {:?}", st.on_disconnect);
    eprintln!(
        "  output buffer: {} events, slow client timeout {}",
        st.output_buffer,
        humantime::format_duration(st.slow_client_timeout)
    );
    eprintln!();

    eprintln!("  docker:      {}", config.docker);
    let result = match DockerRuntime::connect(&config.docker) {
        Ok(rt) => rt.ping().await.map_err(SessionError::from),
        Err(e) => Err(SessionError::from(e)),
    };
    match &result {
        Ok(()) => eprintln!("  docker ping: ok"),
        Err(e) => eprintln!("  docker ping: failed ({e})"),
    }

    eprintln!();
    eprintln!("doctor: completed diagnostics.");
    result
}
