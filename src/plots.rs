//! Plots of predictions against the truth and of training curves

use std::error::Error;

use plotters::{
    chart::{ChartBuilder, SeriesLabelPosition},
    element::{Circle, ErrorBar, PathElement},
    prelude::{BitMapBackend, IntoDrawingArea},
    series::LineSeries,
    style::{BLACK, BLUE, Color, RED, WHITE},
};

use crate::train::History;

/// Smallest and largest value with some margin, `None` for empty input or if any value
/// is not finite
fn padded_range<'a>(mut values: impl Iterator<Item = &'a f32>) -> Option<(f32, f32)> {
    let (lo, hi) = values.try_fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
        v.is_finite().then(|| (lo.min(v), hi.max(v)))
    })?;
    // no values at all
    if lo > hi {
        return None;
    }
    let margin = ((hi - lo) * 0.05).max(1e-3);
    Some((lo - margin, hi + margin))
}

/// Scatter of predicted against true values, with one standard deviation error bars
/// and the diagonal of perfect predictions
pub fn plot_predictions(
    truth: &[f32],
    predicted: &[f32],
    sigma: &[f32],
    file_name: &str,
    caption: &str,
) -> Result<(), Box<dyn Error>> {
    if truth.len() != predicted.len() || truth.len() != sigma.len() {
        return Err(format!(
            "got {} true values, {} predictions and {} uncertainties",
            truth.len(),
            predicted.len(),
            sigma.len()
        )
        .into());
    }
    let (lo, hi) = padded_range(truth.iter().chain(predicted))
        .ok_or("no finite values to plot")?;

    let root_area = BitMapBackend::new(file_name, (640, 640)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root_area)
        .caption(caption, ("sans-serif", 30))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(lo..hi, lo..hi)?;

    chart
        .configure_mesh()
        .x_desc("truth")
        .y_desc("prediction")
        .draw()?;

    chart.draw_series(LineSeries::new([(lo, lo), (hi, hi)], BLACK.stroke_width(1)))?;
    chart.draw_series(
        truth
            .iter()
            .zip(predicted)
            .zip(sigma)
            .map(|((&t, &p), &s)| ErrorBar::new_vertical(t, p - s, p, p + s, RED.mix(0.3), 3)),
    )?;
    chart.draw_series(
        truth
            .iter()
            .zip(predicted)
            .map(|(&t, &p)| Circle::new((t, p), 2, BLUE.filled())),
    )?;

    root_area.present()?;
    log::info!("Prediction plot saved to '{}'.", file_name);
    Ok(())
}

/// Training and validation loss per epoch
pub fn plot_loss_curves(history: &History, file_name: &str) -> Result<(), Box<dyn Error>> {
    let train = history.train.iter().map(|s| s.loss).collect::<Vec<_>>();
    let val = history.val.iter().map(|s| s.loss).collect::<Vec<_>>();
    let (lo, hi) = padded_range(train.iter().chain(&val)).ok_or("no finite losses to plot")?;
    let n_epochs = train.len().max(val.len()) as f32;

    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root_area)
        .caption("Loss", ("sans-serif", 30))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(1.0f32..n_epochs.max(2.0), lo..hi)?;

    chart.configure_mesh().x_desc("epoch").draw()?;

    for (losses, name, color) in [(&train, "train", RED), (&val, "validation", BLUE)] {
        chart
            .draw_series(LineSeries::new(
                losses.iter().enumerate().map(|(i, &l)| (i as f32 + 1.0, l)),
                color.stroke_width(2),
            ))?
            .label(name)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }
    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root_area.present()?;
    log::info!("Loss curves saved to '{}'.", file_name);
    Ok(())
}
