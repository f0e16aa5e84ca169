mod actions;
mod capture;
mod cli;
mod config;
mod fingers;
mod gestures;
mod ipc;
mod landmarks;
mod logging;
mod smoothing;

fn main() -> anyhow::Result<()> {
    logging::init();
    cli::run()
}
