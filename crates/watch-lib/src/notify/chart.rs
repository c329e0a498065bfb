use std::io::Cursor;

use image::{DynamicImage, ImageFormat, RgbImage};
use plotters::prelude::*;

use super::{ChartRenderer, TrendSeries};
use crate::models::{ReferenceDay, DATE_FORMAT};

const CHART_WIDTH_PX: u32 = 1280;
const CHART_HEIGHT_PX: u32 = 800;

struct ChartStyle;

impl ChartStyle {
    const MARGIN: i32 = 20;
    const FONT_FAMILY: &'static str = "sans-serif";
    const CAPTION_FONT_SIZE: i32 = 32;
    const X_LABEL_AREA_SIZE: u32 = 48;
    const Y_LABEL_AREA_SIZE: u32 = 80;
    const X_LABEL_COUNT: usize = 12;
    const Y_LABEL_COUNT: usize = 8;
    const BACKGROUND: RGBColor = WHITE;
    const LEGEND_ALPHA: f64 = 0.8;
    const LEGEND_SWATCH_PX: i32 = 24;
    const Y_HEADROOM: f64 = 1.1;

    /// Today is drawn thicker than the reference days
    fn line(day: ReferenceDay) -> (RGBColor, u32) {
        match day {
            ReferenceDay::Today => (RGBColor(214, 39, 40), 4),
            ReferenceDay::OneDayAgo => (RGBColor(31, 119, 180), 3),
            ReferenceDay::SevenDaysAgo => (RGBColor(44, 160, 44), 3),
        }
    }
}

/// PNG line chart overlaying the reference dates on a time-of-day axis
#[derive(Debug, Clone, Copy, Default)]
pub struct PlottersChartRenderer;

impl ChartRenderer for PlottersChartRenderer {
    fn render(
        &self,
        group: &str,
        metric_name: &str,
        trend: &TrendSeries,
    ) -> Result<Vec<u8>, String> {
        render_trend_png(group, metric_name, trend)
    }
}

fn render_trend_png(group: &str, metric_name: &str, trend: &TrendSeries) -> Result<Vec<u8>, String> {
    if trend.days.iter().all(|series| series.points.len() < 2) {
        return Err("not enough points to render".to_string());
    }

    let minutes: Vec<i32> = trend
        .days
        .iter()
        .flat_map(|series| series.points.iter().map(|point| point.minute_of_day() as i32))
        .collect();
    let mut x_start = minutes
        .iter()
        .copied()
        .min()
        .ok_or_else(|| "missing start bucket".to_string())?;
    let mut x_end = minutes
        .iter()
        .copied()
        .max()
        .ok_or_else(|| "missing end bucket".to_string())?;
    if x_start == x_end {
        x_start -= 15;
        x_end += 15;
    }

    // Y axis always starts at zero
    let y_max = trend
        .max_value()
        .filter(|max| max.is_finite() && *max > 0.0)
        .unwrap_or(1.0)
        * ChartStyle::Y_HEADROOM;

    let width = CHART_WIDTH_PX;
    let height = CHART_HEIGHT_PX;
    let mut rgb_buffer = vec![255u8; width as usize * height as usize * 3];

    {
        let drawing_area =
            BitMapBackend::with_buffer(&mut rgb_buffer, (width, height)).into_drawing_area();
        drawing_area
            .fill(&ChartStyle::BACKGROUND)
            .map_err(|error| format!("background fill error: {:?}", error))?;

        let mut chart = ChartBuilder::on(&drawing_area)
            .margin(ChartStyle::MARGIN)
            .caption(
                format!("{} · {}", group, metric_name),
                (ChartStyle::FONT_FAMILY, ChartStyle::CAPTION_FONT_SIZE),
            )
            .x_label_area_size(ChartStyle::X_LABEL_AREA_SIZE)
            .y_label_area_size(ChartStyle::Y_LABEL_AREA_SIZE)
            .build_cartesian_2d(x_start..x_end, 0f64..y_max)
            .map_err(|error| format!("chart build error: {:?}", error))?;

        chart
            .configure_mesh()
            .x_labels(ChartStyle::X_LABEL_COUNT)
            .y_labels(ChartStyle::Y_LABEL_COUNT)
            .x_label_formatter(&|minute: &i32| format!("{:02}:{:02}", minute / 60, minute % 60))
            .x_desc("time")
            .y_desc(metric_name)
            .draw()
            .map_err(|error| format!("mesh draw error: {:?}", error))?;

        for series in trend.days.iter().filter(|series| !series.points.is_empty()) {
            let (color, stroke) = ChartStyle::line(series.day);
            chart
                .draw_series(LineSeries::new(
                    series
                        .points
                        .iter()
                        .map(|point| (point.minute_of_day() as i32, point.value)),
                    color.stroke_width(stroke),
                ))
                .map_err(|error| format!("series draw error: {:?}", error))?
                .label(series.date.format(DATE_FORMAT).to_string())
                .legend(move |(x, y)| {
                    PathElement::new(
                        vec![(x, y), (x + ChartStyle::LEGEND_SWATCH_PX, y)],
                        color.stroke_width(stroke),
                    )
                });
        }

        chart
            .configure_series_labels()
            .background_style(ChartStyle::BACKGROUND.mix(ChartStyle::LEGEND_ALPHA))
            .border_style(BLACK)
            .draw()
            .map_err(|error| format!("legend draw error: {:?}", error))?;

        drawing_area
            .present()
            .map_err(|error| format!("present error: {:?}", error))?;
    }

    let rgb_image = RgbImage::from_raw(width, height, rgb_buffer)
        .ok_or_else(|| "image buffer conversion failed".to_string())?;
    let mut output = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(rgb_image)
        .write_to(&mut output, ImageFormat::Png)
        .map_err(|error| format!("png encoding error: {}", error))?;

    Ok(output.into_inner())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::notify::{DaySeries, TrendPoint};

    #[test]
    fn rejects_not_enough_points() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let trend = TrendSeries {
            days: vec![DaySeries {
                day: ReferenceDay::Today,
                date,
                points: vec![TrendPoint {
                    bucket: date.and_hms_opt(12, 30, 0).unwrap(),
                    label: "12:30".to_string(),
                    value: 42.0,
                }],
            }],
        };

        let result = PlottersChartRenderer.render("total", "Views", &trend);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_empty_trend() {
        let result = PlottersChartRenderer.render("iOS", "CTR", &TrendSeries::default());
        assert!(result.is_err());
    }
}
