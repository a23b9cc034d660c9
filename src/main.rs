mod config;
mod scheduler;
mod state;
mod storage;
mod tg;

use chrono::Local;
use dotenvy::dotenv;
use teloxide::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = config::Config::from_env()?;
    let bot = Bot::new(cfg.bot_token);

    let storage = storage::Storage::connect(&cfg.database_url).await?;
    storage.init_schema().await?;

    let tracker = state::Tracker::new();
    let (scheduler, fired) = scheduler::Scheduler::new();

    // таймеры живут только в памяти: поднимаем их заново из будущих строк
    let pending = storage.pending_reminders(Local::now().naive_local()).await?;
    let rearmed = scheduler.rearm(&pending);
    tracing::info!("re-armed {rearmed} reminder(s)");

    tokio::spawn(tg::deliver_reminders(bot.clone(), storage.clone(), fired));

    tg::run(bot, storage, tracker, scheduler, cfg.admins).await;
    Ok(())
}
