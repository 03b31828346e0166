use crossbeam_channel::{bounded, Receiver};
use eframe::egui::{self, Color32};
use egui_plot::{Legend, Line, Plot, PlotPoints};
use rgm::{GpuSnapshot, Monitor, ProcessInfo, TelemetryStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::{thread, time::Duration};
use tracing::debug;

type Sample = (Vec<GpuSnapshot>, Vec<ProcessInfo>);

fn fmt_opt(value: Option<f64>, precision: usize, unit: &str) -> String {
    match value {
        Some(v) => format!("{v:.precision$}{unit}"),
        None => "N/A".to_string(),
    }
}

fn fmt_mhz(value: Option<u32>) -> String {
    value.map_or_else(|| "N/A".to_string(), |v| format!("{v} MHz"))
}

// Application state
pub struct RgmApp {
    monitor: Arc<Monitor>,
    receiver: Receiver<Sample>,
    display_duration: f64,
    history: HashMap<String, VecDeque<GpuSnapshot>>,
    processes: Vec<ProcessInfo>,
    selected: Option<String>,
}

impl RgmApp {
    pub fn new(cc: &eframe::CreationContext<'_>, monitor: Monitor, poll_interval: Duration) -> Self {
        let (sender, receiver) = bounded(100);
        let monitor = Arc::new(monitor);

        if monitor.is_available() {
            let poller = Arc::clone(&monitor);
            thread::spawn(move || loop {
                poller.poll();
                let processes = poller.collect_all_processes();
                // Re-read so the snapshots carry this cycle's process counts
                if sender.send((poller.latest(), processes)).is_err() {
                    debug!("viewer closed, stopping poller");
                    break;
                }
                thread::sleep(poll_interval);
            });
        }

        let mut style = (*cc.egui_ctx.style()).clone();
        style.visuals.dark_mode = true;
        cc.egui_ctx.set_style(style);

        Self {
            monitor,
            receiver,
            display_duration: 10.0,
            history: HashMap::new(),
            processes: Vec::new(),
            selected: None,
        }
    }

    fn ingest(&mut self) {
        while let Ok((snapshots, processes)) = self.receiver.try_recv() {
            for snapshot in snapshots {
                let window = self.history.entry(snapshot.device_id.clone()).or_default();
                let now = snapshot.captured_at;
                window.push_back(snapshot);
                while window.front().is_some_and(|s| {
                    (now - s.captured_at).num_milliseconds() as f64 / 1000.0
                        > self.display_duration
                }) {
                    window.pop_front();
                }
            }
            self.processes = processes;
        }
        if self.selected.is_none() {
            self.selected = self
                .history
                .keys()
                .min_by_key(|id| id.parse::<u32>().unwrap_or(u32::MAX))
                .cloned();
        }
    }
}

fn summary(ui: &mut egui::Ui, s: &GpuSnapshot) {
    egui::Frame::group(ui.style()).show(ui, |ui| {
        ui.horizontal(|ui| {
            ui.vertical(|ui| {
                ui.label(
                    egui::RichText::new(format!(
                        "GPU Utilization: {}",
                        fmt_opt(s.performance.utilization_gpu, 0, "%")
                    ))
                    .color(Color32::GREEN)
                    .size(22.0)
                    .strong(),
                );
                ui.label(format!(
                    "Temperature: {}",
                    fmt_opt(s.power_thermal.temperature_c, 0, "°C")
                ));
                ui.label(format!(
                    "Fan Speed: {}",
                    fmt_opt(s.power_thermal.fan_speed_pct, 0, "%")
                ));
                ui.label(format!(
                    "P-State: {}",
                    s.performance
                        .performance_state
                        .map_or_else(|| "N/A".to_string(), |p| format!("P{p}"))
                ));
            });
            ui.separator();
            ui.vertical(|ui| {
                ui.label(format!(
                    "Memory: {} / {}",
                    fmt_opt(s.memory.used_mib, 0, ""),
                    fmt_opt(s.memory.total_mib, 0, " MiB")
                ));
                ui.label(format!(
                    "Memory Rate: {}",
                    fmt_opt(s.derived.memory_change_rate_mib_s, 1, " MiB/s")
                ));
                ui.label(format!(
                    "Power: {} / {}",
                    fmt_opt(s.power_thermal.power_draw_w, 1, ""),
                    fmt_opt(s.power_thermal.power_limit_w, 1, " W")
                ));
                ui.label(format!("SM Clock: {}", fmt_mhz(s.clocks.sm.current_mhz)));
                ui.label(format!("Memory Clock: {}", fmt_mhz(s.clocks.memory.current_mhz)));
            });
            ui.separator();
            ui.vertical(|ui| {
                ui.label(format!(
                    "PCIe: Gen {} x{}",
                    s.connectivity
                        .pcie_gen_current
                        .map_or_else(|| "?".to_string(), |g| g.to_string()),
                    s.connectivity
                        .pcie_width_current
                        .map_or_else(|| "?".to_string(), |w| w.to_string())
                ));
                if s.derived.peak_tflops > 0.0 {
                    ui.label(format!(
                        "MFU (est.): {:.1}% of {:.1} TFLOPs",
                        s.derived.mfu_percent, s.derived.peak_tflops
                    ));
                } else {
                    ui.label("MFU (est.): unknown model");
                }
                ui.label(format!(
                    "Processes: {} compute, {} graphics",
                    s.processes.compute, s.processes.graphics
                ));
            });
        });
    });
}

fn plot(ui: &mut egui::Ui, window: &VecDeque<GpuSnapshot>, display_duration: f64) {
    let Some(latest) = window.back() else {
        return;
    };
    let seconds_ago = |s: &GpuSnapshot| {
        ((latest.captured_at - s.captured_at).num_milliseconds() as f64 / 1000.0).max(0.0)
    };
    let points = |value: &dyn Fn(&GpuSnapshot) -> Option<f64>| -> PlotPoints {
        window
            .iter()
            .filter_map(|s| value(s).map(|v| [seconds_ago(s), v]))
            .collect()
    };

    let util_points = points(&|s| s.performance.utilization_gpu);
    let memory_points = points(&|s| match (s.memory.used_mib, s.memory.total_mib) {
        (Some(used), Some(total)) if total > 0.0 => Some(used / total * 100.0),
        _ => None,
    });
    let temp_points = points(&|s| s.power_thermal.temperature_c);
    let mfu_points = points(&|s| (s.derived.peak_tflops > 0.0).then_some(s.derived.mfu_percent));

    Plot::new("gpu_metrics_plot")
        .view_aspect(2.5)
        .legend(Legend::default())
        .include_y(0.0)
        .include_y(100.0)
        .include_x(0.0)
        .include_x(display_duration)
        .x_axis_label("Seconds Ago (0 = now)")
        .show_x(true)
        .show_y(true)
        .show(ui, |plot_ui| {
            plot_ui.line(Line::new("GPU Utilization", util_points).color(Color32::GREEN));
            plot_ui.line(
                Line::new("Memory Usage (%)", memory_points).color(Color32::from_rgb(0, 128, 255)),
            );
            plot_ui.line(
                Line::new("Temperature (°C)", temp_points).color(Color32::from_rgb(255, 128, 0)),
            );
            plot_ui.line(
                Line::new("MFU estimate (%)", mfu_points).color(Color32::from_rgb(255, 0, 128)),
            );
        });
}

impl eframe::App for RgmApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.ingest();

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("🚀 GPU Monitor");

            if let TelemetryStatus::Disabled(reason) = self.monitor.telemetry_status() {
                ui.label(format!("GPU telemetry unavailable: {reason}"));
                return;
            }

            let mut ids: Vec<String> = self.history.keys().cloned().collect();
            ids.sort_by_key(|id| id.parse::<u32>().unwrap_or(u32::MAX));
            ui.horizontal(|ui| {
                for id in ids {
                    let label = format!("GPU {id}");
                    ui.selectable_value(&mut self.selected, Some(id), label);
                }
            });

            let Some(window) = self.selected.as_ref().and_then(|id| self.history.get(id)) else {
                ui.label("Waiting for first sample…");
                return;
            };
            let Some(latest) = window.back() else {
                return;
            };

            ui.label(format!(
                "{} ({}) - Driver: {}",
                latest.identity.name.as_deref().unwrap_or("N/A"),
                latest.identity.architecture.as_deref().unwrap_or("Unknown"),
                latest.identity.driver_version.as_deref().unwrap_or("N/A"),
            ));
            ui.add_space(8.0);
            summary(ui, latest);

            ui.add_space(12.0);
            ui.separator();
            ui.heading("📈 Real-time GPU Metrics (Last 10 Seconds)");
            plot(ui, window, self.display_duration);

            ui.add_space(12.0);
            ui.separator();
            ui.heading("🧩 GPU Processes");
            let device_id = latest.device_id.clone();
            egui::ScrollArea::vertical()
                .max_height(200.0)
                .show(ui, |ui| {
                    egui::Grid::new("processes_grid")
                        .striped(true)
                        .spacing([12.0, 6.0])
                        .show(ui, |ui| {
                            ui.label(egui::RichText::new("PID").strong());
                            ui.label(egui::RichText::new("Name").strong());
                            ui.label(egui::RichText::new("Type").strong());
                            ui.label(egui::RichText::new("Memory (MiB)").strong());
                            ui.label(egui::RichText::new("CPU").strong());
                            ui.end_row();
                            for proc in self.processes.iter().filter(|p| p.device_id == device_id) {
                                ui.label(proc.pid.to_string());
                                ui.label(&proc.name);
                                ui.label(format!("{:?}", proc.workload));
                                ui.label(format!("{:.1}", proc.memory_mib));
                                ui.label(fmt_opt(proc.cpu_percent.map(f64::from), 1, "%"));
                                ui.end_row();
                            }
                        });
                });
        });

        ctx.request_repaint_after(Duration::from_millis(100));
    }
}

impl Drop for RgmApp {
    fn drop(&mut self) {
        self.monitor.shutdown();
    }
}
