mod config;
mod diff;
mod dispatch;
mod domain;
mod logging;
mod monitor;
mod render;
mod slack;
mod storage;
mod swarm;

use std::{env, process::ExitCode};

use tracing::{error, info};

use config::AppSettings;
use monitor::Monitor;
use render::Renderer;
use slack::{IdentityResolver, SlackClient};
use storage::CacheStore;
use swarm::SwarmClient;

fn main() -> ExitCode {
    let config_path = AppSettings::locate(env::args().nth(1));
    let settings = match AppSettings::load(&config_path) {
        Ok(settings) => settings,
        Err(err) => {
            logging::init_subscriber("info");
            error!(path = %config_path.display(), error = %err, "Could not load settings");
            return ExitCode::FAILURE;
        }
    };
    logging::init_subscriber(&settings.log_level);
    info!(path = %config_path.display(), "New session");

    match run(settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Swarm notifier stopped");
            ExitCode::FAILURE
        }
    }
}

fn run(settings: AppSettings) -> Result<(), Box<dyn std::error::Error>> {
    let swarm = SwarmClient::new(&settings.swarm)?;
    let notifier = SlackClient::new(&settings.slack.message_token)?;
    let directory = settings
        .slack
        .user_token
        .as_deref()
        .filter(|token| !token.is_empty())
        .map(SlackClient::new)
        .transpose()?;
    let mentions = IdentityResolver::new(
        swarm.clone(),
        directory,
        settings.slack.additional_lookup_domains.clone(),
    );

    let monitor = Monitor::new(
        swarm,
        notifier,
        mentions,
        Renderer::new(settings.event_icons.clone(), settings.swarm.web_uri()),
        settings.slack.channel.clone(),
        CacheStore::new(settings.monitor.resolved_cache_path()),
        &settings.monitor,
    );
    monitor.run()?;
    Ok(())
}
