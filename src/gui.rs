//! Live plot window (eframe + egui_plot).
//!
//! Renders the [`LiveSeriesStore`](crate::data::series::LiveSeriesStore) shared with the run
//! loop: one plot per group, local wall-clock time on the x axis. The window only reads the
//! store; closing it does not stop the acquisition.

use crate::controller::{RunStatus, SharedSeries};
use crate::data::series::{Plot, SeriesBuffer};
use crate::error::{AppResult, DaqError};
use chrono::{Local, TimeZone};
use eframe::egui;
use egui_plot::{GridMark, Legend, Line, Plot as PlotWidget, PlotPoints};
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::sync::watch;

const REFRESH: Duration = Duration::from_millis(500);

/// The plot window.
pub struct PlotWindow {
    title: String,
    series: SharedSeries,
    status: watch::Receiver<RunStatus>,
}

impl PlotWindow {
    /// Window over `series`, with `status` shown in the top panel.
    pub fn new(title: impl Into<String>, series: SharedSeries, status: watch::Receiver<RunStatus>) -> Self {
        Self {
            title: title.into(),
            series,
            status,
        }
    }
}

impl eframe::App for PlotWindow {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let status = self.status.borrow().clone();

        egui::TopBottomPanel::top("status_panel").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.heading(&self.title);
                ui.separator();
                ui.label(status.to_string());
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            // The run loop holds the write lock only while ingesting; skip this frame then.
            let Ok(store) = self.series.try_read() else {
                return;
            };
            egui::ScrollArea::vertical().show(ui, |ui| {
                for plot in store.plots() {
                    group_plot(ui, plot);
                }
            });
        });

        ctx.request_repaint_after(REFRESH);
    }
}

fn group_plot(ui: &mut egui::Ui, plot: &Plot) {
    let group = plot.group();
    ui.heading(group.to_string());
    PlotWidget::new(group.to_string())
        .height(220.0)
        .legend(Legend::default())
        .y_axis_label(group.unit())
        .x_axis_formatter(|mark: GridMark, _range: &RangeInclusive<f64>| time_label(mark.value))
        .show(ui, |plot_ui| {
            for (name, buffer) in plot.series() {
                plot_ui.line(Line::new(PlotPoints::from(points(buffer))).name(legend(name, buffer)));
            }
        });
}

/// `[unix seconds, value]` pairs, oldest first.
pub fn points(buffer: &SeriesBuffer) -> Vec<[f64; 2]> {
    buffer
        .render()
        .into_iter()
        .map(|(timestamp, value)| [timestamp as f64, value])
        .collect()
}

/// Legend entry with the latest value, e.g. `pt31 56.300`.
pub fn legend(name: &str, buffer: &SeriesBuffer) -> String {
    match buffer.latest() {
        Some((_, value)) => format!("{} {:.3}", name, value),
        None => name.to_string(),
    }
}

/// Local `HH:MM:SS` of a unix timestamp.
pub fn time_label(seconds: f64) -> String {
    match Local.timestamp_opt(seconds.round() as i64, 0).single() {
        Some(time) => time.format("%H:%M:%S").to_string(),
        None => String::new(),
    }
}

/// Open the window and block until it is closed. Must run on the main thread.
pub fn show(title: &str, series: SharedSeries, status: watch::Receiver<RunStatus>) -> AppResult<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default().with_inner_size([1100.0, 800.0]),
        ..Default::default()
    };
    let window = PlotWindow::new(title, series, status);
    eframe::run_native(title, options, Box::new(|_cc| Ok(Box::new(window) as Box<dyn eframe::App>)))
        .map_err(|e| DaqError::Io(std::io::Error::other(format!("plot window: {}", e))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_follow_buffer_order() {
        let mut buffer = SeriesBuffer::new(2).unwrap();
        buffer.push(100, 1.0);
        buffer.push(160, 2.0);
        buffer.push(220, 3.0);
        assert_eq!(points(&buffer), vec![[160.0, 2.0], [220.0, 3.0]]);
    }

    #[test]
    fn legend_shows_latest_value() {
        let mut buffer = SeriesBuffer::new(4).unwrap();
        assert_eq!(legend("pt31", &buffer), "pt31");
        buffer.push(100, 55.0);
        buffer.push(160, 56.3);
        assert_eq!(legend("pt31", &buffer), "pt31 56.300");
    }

    #[test]
    fn time_labels_are_wall_clock() {
        let label = time_label(0.0);
        assert_eq!(label.len(), 8);
        assert_eq!(label.matches(':').count(), 2);
    }
}
