use ledger_watch_domain::services::telemetry::TelemetryGuard;
use ledger_watch_monitor::WatchHub;

#[derive(Clone)]
pub struct AppState {
    hub: WatchHub,
    telemetry: TelemetryGuard,
}

impl AppState {
    pub fn new(hub: WatchHub, telemetry: TelemetryGuard) -> Self {
        Self { hub, telemetry }
    }

    pub fn hub(&self) -> &WatchHub {
        &self.hub
    }

    pub fn telemetry(&self) -> &TelemetryGuard {
        &self.telemetry
    }
}
