use std::{net::IpAddr, sync::Arc, time::Duration};

use actix_web::{web::Data, App, HttpServer};
use clap::Parser;
use confab_sfu::{
    backend::LocalBackend,
    config::{ServerConfig, TransportConfig},
    http,
    manager::RoomManager,
};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(version, about = "confab signaling and SFU server")]
struct Args {
    #[arg(long, env = "CONFAB_BIND", default_value = "0.0.0.0:4000")]
    bind: String,
    #[arg(long, env = "CONFAB_WORKERS", default_value_t = 4)]
    workers: usize,
    /// Seconds an empty room waits for a rejoin before it is deleted.
    #[arg(long, env = "CONFAB_EMPTY_ROOM_GRACE", default_value_t = 300)]
    empty_room_grace: u64,
    /// Public IP addresses of this server, comma separated.
    #[arg(long, env = "CONFAB_ANNOUNCED_IPS", value_delimiter = ',')]
    announced_ips: Vec<IpAddr>,
    #[arg(long, env = "CONFAB_RTC_MIN_PORT", default_value_t = 40000)]
    rtc_min_port: u16,
    #[arg(long, env = "CONFAB_RTC_MAX_PORT", default_value_t = 49999)]
    rtc_max_port: u16,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        worker_count: args.workers,
        empty_room_grace: Duration::from_secs(args.empty_room_grace),
        transport: TransportConfig {
            announced_ips: args.announced_ips,
            port_min: args.rtc_min_port,
            port_max: args.rtc_max_port,
            ..Default::default()
        },
        ..Default::default()
    };
    tracing::info!("starting with {:?}", config);

    let backend = LocalBackend::new(&config)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let manager = RoomManager::new(config, Arc::new(backend))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let data = Data::new(manager.clone());

    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(data.clone())
            .configure(http::configure)
    })
    .bind(args.bind)?
    .run()
    .await?;

    manager.close().await;
    Ok(())
}
