use log::{error, info, warn};
use std::sync::Arc;

use tokio::sync::broadcast;

use gpiowatch::{AppConfig, EdgeEvent, GpioError, Pin, SysfsBackend, board};

#[tokio::main]
async fn main() -> Result<(), GpioError> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GPIOWATCH_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = AppConfig::load_from_file(&config_path)?;

    board::open_with(Arc::new(SysfsBackend::new(&config.sysfs)), &config.watcher)?;

    let (event_tx, mut event_rx) = broadcast::channel::<EdgeEvent>(config.event_capacity.max(1));

    let pins = board::watch_configured(&config.pins, |_| {
        let tx = event_tx.clone();
        move |pin: &Pin| match pin.read() {
            Ok(level) => {
                let _ = tx.send(EdgeEvent::now(pin.line(), level));
            }
            Err(e) => warn!("gpio{}: read after edge failed: {e}", pin.line()),
        }
    })
    .inspect_err(|e| error!("Failed to set up pins: {e}"))?;
    drop(event_tx);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down...");
                break;
            }
            event = event_rx.recv() => {
                match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(text) => println!("{text}"),
                        Err(e) => error!("failed to encode event: {e}"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event stream lagged by {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    board::release(&pins);

    Ok(())
}
