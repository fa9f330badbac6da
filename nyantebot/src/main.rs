mod modules;

use std::sync::Arc;
use std::time::Duration;

use log::info;
use modules::hub::HubModule;
use nyantebot_common::app::App;
use nyantebot_common::mongodb::options::ClientOptions;
use nyantebot_common::mongodb::{Client, Database};
use nyantebot_common::teloxide::adaptors::throttle::Limits;
use nyantebot_common::teloxide::adaptors::CacheMe;
use nyantebot_common::teloxide::prelude::{Bot, RequesterExt};
use nyantebot_common::tgbot::BotData;
use reqwest::Url;
use tipping::TippingModule;

fn main() -> Result<(), anyhow::Error> {
    dotenvy::dotenv().ok();
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .with_module_level(
            "nyantebot_common",
            if std::env::var("DEBUG").is_ok() {
                log::LevelFilter::Debug
            } else {
                log::LevelFilter::Info
            },
        )
        .with_module_level(
            "tipping",
            if std::env::var("DEBUG").is_ok() {
                log::LevelFilter::Debug
            } else {
                log::LevelFilter::Info
            },
        )
        .env()
        .init()?;

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install AWS LC provider");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async {
            let (client, db) = get_db().await?;
            let app = App::new(client, db).await?;

            let base: Url = if let Ok(url) = std::env::var("TELEGRAM_API_URL") {
                url.parse().unwrap()
            } else {
                "https://api.telegram.org".parse().unwrap()
            };

            let main_bot_token =
                std::env::var("MAIN_TOKEN").expect("MAIN_TOKEN not set");
            let main_bot = BotData::new(
                CacheMe::new(
                    Bot::with_client(
                        main_bot_token,
                        reqwest::Client::builder()
                            .timeout(Duration::from_secs(30))
                            .build()
                            .unwrap(),
                    )
                    .set_api_url(base)
                    .throttle(Limits::default()),
                ),
                app.arc_clone_state(),
            )
            .await?;
            app.state().add_bot(main_bot).await?;

            app.state()
                .add_bot_module(HubModule::new(app.arc_clone_state()))
                .await;
            app.state()
                .add_bot_module(TippingModule::new(app.arc_clone_state()).await?)
                .await;

            app.start_tg_bots().await?;

            info!("Nyante tip bot is up");

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            app.shutdown().await?;

            Ok(())
        })
}

async fn get_db() -> Result<(Client, Database), anyhow::Error> {
    let client_uri = std::env::var("MONGODB_URI").expect("MONGODB_URI not set");
    let options = ClientOptions::parse(&client_uri).await?;
    let client = Client::with_options(options)?;
    let db = client
        .default_database()
        .ok_or_else(|| anyhow::anyhow!("No default database specified in MONGODB_URI"))?;
    Ok((client, db))
}
