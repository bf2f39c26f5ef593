//! Shared plumbing for the fleet tools binaries: tokio runtime construction and
//! tracing setup.

pub mod config;

pub use config::{OutputConfig, RuntimeConfig};

/// Installs the global tracing subscriber. Logs go to stderr so that remote
/// output printed on stdout stays clean. `RUST_LOG` takes precedence over the
/// verbosity flags; `quiet` turns logging off.
pub fn init_tracing(output: &OutputConfig) -> anyhow::Result<()> {
    let default_directive = if output.quiet {
        "off"
    } else {
        output.level().as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(output.verbose > 1)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize tracing: {err}"))
}

fn build_runtime(runtime: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    Ok(builder.build()?)
}

/// Sets up tracing and a tokio runtime and drives `func` to completion on it.
///
/// Returns `None` when anything failed; the error has then already been
/// reported on stderr (unless `quiet` is set).
pub fn run<Fut, T>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<T>
where
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    if let Err(err) = init_tracing(&output) {
        if !output.quiet {
            eprintln!("{err:#}");
        }
        return None;
    }
    let res = build_runtime(&runtime).and_then(|runtime| runtime.block_on(func()));
    match res {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!("run failed: {err:?}");
            if !output.quiet {
                eprintln!("{err:#}");
            }
            None
        }
    }
}
