//! cistash CLI Application
//!
//! Entry point for the `restore` and `save` phases of a CI cache step.

use cistash::cli::{self, Cli, EXIT_FAILURE, EXIT_OK, exit_code_for, render_error};
use cistash::tracing::{TracingConfig, init_tracing};
use cistash::{commands, github, shutdown};
use tracing::instrument;

fn main() {
    // NOTE: Using eprintln! in panic hook is intentional - tracing infrastructure
    // may be corrupted during a panic, so we use the most reliable output method.
    #[allow(clippy::print_stderr)]
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=debug for more information.");
    }));

    let cli = cli::parse();

    let tracing_config = TracingConfig {
        format: cli.log_format,
        level: cli.level.into(),
        ..Default::default()
    };
    if let Err(e) = init_tracing(tracing_config) {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("{e:?}");
        }
    }

    let exit_code = run_with_tokio(cli);
    std::process::exit(exit_code);
}

/// Create tokio runtime and run the command
fn run_with_tokio(cli: Cli) -> i32 {
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create tokio runtime");
            return EXIT_FAILURE;
        }
    };

    rt.block_on(run(cli))
}

#[instrument(name = "cistash", skip_all, fields(correlation_id = %cistash::tracing::correlation_id()))]
async fn run(cli: Cli) -> i32 {
    let cancel = shutdown::install_signal_handlers();

    match commands::execute(cli.command, &cancel).await {
        Ok(()) => EXIT_OK,
        Err(err) => {
            render_error(&err, github::is_actions());
            exit_code_for(&err)
        }
    }
}
