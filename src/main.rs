//! Cloud relay server binary.

use relay::config::Settings;
use relay::manager::ConnectionManager;
use relay::router::{self, AppState};
use relay::store::{InMemoryDeviceStatusStore, InMemoryDogMetricsStore, InMemoryPairingStore};
use relay::turn::TurnClient;
use slog::{error, info};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let _log_guard = relay::logging::init();

    let settings = match Settings::load() {
        Ok(s) => s,
        Err(e) => {
            error!(slog_scope::logger(), "failed to load configuration"; "error" => %e);
            std::process::exit(1);
        }
    };

    info!(slog_scope::logger(), "starting cloud relay"; "app_name" => &settings.app_name);

    let app_state = AppState {
        manager: ConnectionManager::new(),
        turn: TurnClient::new(settings.turn.clone()),
        settings: settings.clone(),
        pairing_store: Box::new(InMemoryPairingStore::new()),
        dog_store: Box::new(InMemoryDogMetricsStore::new()),
        device_status_store: Box::new(InMemoryDeviceStatusStore::new()),
    };

    router::run(settings, app_state).await
}
