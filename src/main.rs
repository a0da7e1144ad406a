mod attachments;
mod config;
mod db;
mod error;
mod http;
mod models;
mod monitor;
mod vk;

#[cfg(test)]
mod tests;

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use attachments::download::{Downloader, ReqwestFetcher};
use attachments::stickers::StickerCache;
use attachments::AttachmentPipeline;
use config::Settings;
use db::EventLog;
use error::AppError;
use http::DashboardState;
use monitor::state::BotState;
use monitor::{seed_demo, BotMonitor, Overview};
use vk::longpoll::LongPoll;
use vk::scraper::YtDlp;
use vk::VkClient;

const RECENT_CONVERSATIONS: u32 = 10;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        error!("monitor stopped: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), AppError> {
    let settings = Settings::from_env()?;
    let log = Arc::new(EventLog::open(settings.db_path.clone())?);
    fs::create_dir_all(&settings.attachments_dir)?;
    info!(
        "events in {}, attachments in {}",
        settings.db_path.display(),
        settings.attachments_dir.display()
    );
    let state = BotState::shared();

    // Blocking HTTP clients are built here, outside the dashboard runtime.
    let mut worker = None;
    let overview = match &settings.vk {
        None => {
            warn!("demo mode: running without a VK connection");
            seed_demo(&state, &log)?
        }
        Some(vk) => {
            info!("monitoring community {}", vk.group_id);
            let client = Arc::new(VkClient::new(
                vk.token.clone(),
                vk.api_version.clone(),
                settings.download_timeout,
            )?);
            let overview = load_overview(&client, vk.group_id);

            let fetcher = Arc::new(
                ReqwestFetcher::new(settings.download_timeout)
                    .map_err(|err| AppError::Config(format!("download client: {err}")))?,
            );
            let pipeline = AttachmentPipeline::new(
                settings.attachments_dir.clone(),
                client.clone(),
                Downloader::new(fetcher.clone(), Arc::new(YtDlp::new(settings.ytdlp_bin.clone()))),
                StickerCache::new(settings.attachments_dir.join("stickers"), fetcher),
            );
            let source = LongPoll::new(client.clone(), vk.group_id)?;
            let monitor = BotMonitor::new(
                Box::new(source),
                Arc::new(pipeline),
                log.clone(),
                client,
                state.clone(),
            );
            let stop = monitor.stop_handle();
            worker = Some((stop, monitor.spawn()?));
            overview
        }
    };

    let dashboard = DashboardState::new(
        log,
        state,
        overview,
        settings.attachments_dir.clone(),
        settings.demo_mode,
    );
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let served = runtime.block_on(http::serve(
        dashboard,
        settings.static_dir.clone(),
        settings.port,
    ));

    // The worker may sit in a long poll for a while; it exits on its next turn.
    if let Some((stop, _handle)) = worker {
        stop.store(true, Ordering::SeqCst);
    }
    served
}

fn load_overview(client: &VkClient, group_id: i64) -> Overview {
    let group = client.group_profile(group_id).unwrap_or_else(|err| {
        error!("could not load community profile: {err}");
        serde_json::json!({})
    });
    let conversations = client
        .recent_conversations(RECENT_CONVERSATIONS)
        .unwrap_or_else(|err| {
            error!("could not load conversations: {err}");
            Vec::new()
        });
    Overview {
        group,
        conversations,
    }
}
