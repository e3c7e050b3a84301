#![doc = include_str!("../README.md")]

mod archiver;
mod controller;
mod dispatch;
mod logging;
mod server;

use std::process::ExitCode;

use dispatch::Personality;

fn main() -> ExitCode {
    logging::install();

    let argv: Vec<String> = std::env::args().collect();
    let argv0 = argv.first().cloned().unwrap_or_default();
    let rest = &argv[1..];

    // Consumed, not merely read, so it never leaks into a spawned child's
    // environment the way the original pops `BEHAVE_AS_XPG_CTL`.
    let ctl_override = std::env::var("XPG_CTL")
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);
    if ctl_override {
        std::env::remove_var("XPG_CTL");
    }

    match Personality::detect(&argv0, rest, ctl_override) {
        Personality::Server => server::run(rest),
        Personality::Archiver => run_archiver(rest),
        Personality::Controller => run_controller(rest),
    }
}

fn run_archiver(argv: &[String]) -> ExitCode {
    // `argv[0]` is the literal "archive" sub-command word; Personality
    // detection already confirmed it is there.
    let rest = &argv[1..];
    match archiver::run(rest) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run_controller(argv: &[String]) -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("could not start the async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run_controller_async(argv))
}

async fn run_controller_async(argv: &[String]) -> ExitCode {
    let invocation = controller::parse(argv);
    let this_binary = std::env::current_exe().unwrap_or_else(|_| "pgguard".into());

    let result = match invocation.command.as_deref() {
        Some("start") => controller::start(&invocation, &this_binary).await,
        Some("stop") => controller::stop(&invocation).await,
        Some("restart") => controller::restart(&invocation).await,
        _ => {
            return match controller::passthrough(&invocation).await {
                Ok(code) => {
                    // `code` is already a valid process exit status; most
                    // values fit a `u8`, and anything larger truncates the
                    // same way a shell's `$?` does.
                    ExitCode::from(code.rem_euclid(256) as u8)
                }
                Err(err) => {
                    log::error!("{err}");
                    ExitCode::FAILURE
                }
            };
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(controller::ControllerError::NoControlPath(_)) => ExitCode::from(7),
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
