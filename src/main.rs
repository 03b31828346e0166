mod app;

use app::RgmApp;
use eframe::egui::ViewportBuilder;
use rgm::logging::init_tracing;
use rgm::{Monitor, MonitorConfig};
use tracing::{error, info};

fn main() -> eframe::Result<()> {
    init_tracing("info");

    let config = match std::env::var("RGM_CONFIG") {
        Ok(path) => match MonitorConfig::load(&path) {
            Ok(config) => config.with_overrides(|key| std::env::var(key).ok()),
            Err(e) => {
                error!("Failed to load {}: {}, using defaults", path, e);
                MonitorConfig::from_env()
            }
        },
        Err(_) => MonitorConfig::from_env(),
    };

    let monitor = match Monitor::initialize(&config) {
        Ok(monitor) => monitor,
        Err(e) => {
            error!("Failed to initialize GPU monitor: {}", e);
            std::process::exit(1);
        }
    };
    info!(status = ?monitor.telemetry_status(), "Starting viewer");

    let poll_interval = config.poll_interval();
    let native_options = eframe::NativeOptions {
        viewport: ViewportBuilder::default().with_inner_size([1000.0, 700.0]),
        ..Default::default()
    };

    eframe::run_native(
        "RGM",
        native_options,
        Box::new(move |cc| Ok(Box::new(RgmApp::new(cc, monitor, poll_interval)))),
    )
}
