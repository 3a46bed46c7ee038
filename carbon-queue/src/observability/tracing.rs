use tracing_subscriber::{fmt, EnvFilter};

use crate::{QueueError, QueueResult};

/// Install a global `fmt` subscriber filtered by `RUST_LOG` (default `info`)
pub fn init_tracing(json: bool) -> QueueResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(true);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| QueueError::config(format!("tracing subscriber: {e}")))
}
