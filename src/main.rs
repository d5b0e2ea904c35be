//! Headless softphone runner
//!
//! Registers the extension from the environment, logs every status change
//! and call record, optionally dials `--dial <number>`, and logs out on
//! Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voip_softphone::cdr::{ApiClient, Finalizer, NameResolver};
use voip_softphone::media::RtpMediaDevices;
use voip_softphone::sip::{Credentials, RsipTransportFactory, SipConfig};
use voip_softphone::{init_softphone, softphone, CoreConfig, Softphone};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voip_softphone=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let sip_config = SipConfig::from_env().context("SIP configuration")?;
    let credentials = Credentials::from_env().context("SIP credentials")?;
    let core_config = CoreConfig::from_env().context("core configuration")?;
    let dial_target = dial_argument();

    let api = ApiClient::new(&core_config.api_url, core_config.api_token.clone());
    let names = NameResolver::new(core_config.display_name.clone(), Some(Arc::new(api.clone())));
    let finalizer = Arc::new(Finalizer::new(Arc::new(api), names));

    let installed = init_softphone(Softphone::new(
        Arc::new(RsipTransportFactory::new(sip_config.clone())),
        Arc::new(RtpMediaDevices::new(&sip_config)),
        finalizer,
        core_config,
    ));
    if !installed {
        anyhow::bail!("softphone already initialized");
    }
    let phone = softphone().context("softphone not initialized")?;

    tracing::info!(
        "Starting softphone for extension {} at {}",
        credentials.extension,
        sip_config.server_host
    );
    let control = phone.mount(credentials).await?;

    let mut status = control.subscribe();
    tokio::spawn(async move {
        let mut last_record = None;
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            tracing::info!(
                "Status: {} (registration {:?}, peer {}, elapsed {}s{}{})",
                current.state,
                current.registration,
                current.peer.as_deref().unwrap_or("-"),
                current.elapsed_seconds.unwrap_or(0),
                if current.muted { ", muted" } else { "" },
                if current.held { ", on hold" } else { "" },
            );
            if current.last_record.is_some() && current.last_record != last_record {
                if let Some(record) = &current.last_record {
                    match serde_json::to_string(record) {
                        Ok(json) => tracing::info!("Call record: {}", json),
                        Err(e) => tracing::warn!("Call record not printable: {}", e),
                    }
                }
                last_record = current.last_record;
            }
        }
    });

    // No capture device here; silence keeps the peer's media path open
    let feeder = control.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        while feeder.is_running() {
            ticker.tick().await;
            if let Some(input) = feeder.audio_input() {
                let _ = input.try_send(vec![0; 160]);
            }
        }
    });

    if let Some(target) = dial_target {
        if let Err(e) = control.dial(&target).await {
            tracing::error!("Dial {} refused: {}", target, e);
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received CTRL+C, shutting down");
    phone.shutdown().await;
    Ok(())
}

fn dial_argument() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--dial" {
            return args.next();
        }
        if let Some(target) = arg.strip_prefix("--dial=") {
            return Some(target.to_string());
        }
    }
    None
}
