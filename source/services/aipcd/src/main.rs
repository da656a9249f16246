// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: aipcd entrypoint: logging, options, then the shared service loop

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let options = match aipcd::DaemonOptions::from_args(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("aipcd: {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = aipcd::service_main_loop(aipcd::ReadyNotifier::new(|| {}), options) {
        eprintln!("aipcd: exited with error: {err}");
        std::process::exit(1);
    }
}
