use super::bus::{BusEvent, EventBus};
use super::lock::SessionToken;
use super::state::SessionState;
use super::task::LoopFlag;
use crate::metrics::over_budget_ms;
use crate::overlay;
use crate::background::cover_fit_as;
use crate::refine::RefinedMask;
use crate::render::RenderInput;
use crate::segmentation::Preprocessor;
use anyhow::Result;
use image::{imageops, DynamicImage, GrayImage, RgbaImage};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Start the display-cadence loop of session `token`.
///
/// Late ticks are skipped, never bunched up: the renderer always draws the
/// newest frame with whatever mask is current.
pub(crate) fn spawn(
    state: Rc<SessionState>,
    token: SessionToken,
    bus: EventBus,
    period: Duration,
    show_matte: bool,
    flag: LoopFlag,
) -> JoinHandle<()> {
    tokio::task::spawn_local(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick: Option<Instant> = None;

        loop {
            ticker.tick().await;
            if !flag.is_enabled() || !state.is_current(token) {
                break;
            }
            let now = tokio::time::Instant::now().into_std();
            let interval = last_tick.map(|t| now.saturating_duration_since(t));
            last_tick = Some(now);
            render_tick(&state, &bus, now, interval, show_matte);
        }
        tracing::debug!("Render loop for session {} stopped", token);
    })
}

fn render_tick(
    state: &SessionState,
    bus: &EventBus,
    now: Instant,
    interval: Option<Duration>,
    show_matte: bool,
) {
    let Some(frame) = state.latest_frame() else {
        return;
    };
    let output = state.output_size();
    let mask = state.mask();
    let background = state.background();
    let params = state.params();

    let started = Instant::now();
    let composed: Result<RgbaImage> = {
        let mut slot = state.renderer.borrow_mut();
        let Some(renderer) = slot.as_mut() else {
            return;
        };
        if let Some(binding) = renderer.composite_binding() {
            binding.update_mask(mask.as_ref());
            binding.bind_background(background.as_ref());
        }
        if show_matte {
            Ok(matte_frame(
                mask.as_deref(),
                frame.dimensions(),
                output,
                params.mirror,
            ))
        } else {
            renderer.render(&RenderInput {
                frame: &frame,
                mask: mask.as_deref(),
                background: background.as_deref(),
                params: &params,
                output,
            })
        }
    };

    let mut image = match composed {
        Ok(image) => image,
        Err(e) => {
            tracing::warn!("Render failed, frame skipped: {:#}", e);
            return;
        }
    };

    if let Some(meta) = state.overlay() {
        let (w, h) = image.dimensions();
        if let Some(card) = overlay::layout(&meta, w, h) {
            overlay::paint(&mut image, &card);
        }
    }
    let cpu_ms = started.elapsed().as_secs_f64() * 1000.0;

    if let Some(sink) = state.sink.borrow_mut().as_mut() {
        if let Err(e) = sink.write_frame(&image) {
            tracing::warn!("Failed to write output frame: {:#}", e);
        }
    }

    let snapshot = {
        let mut metrics = state.metrics.borrow_mut();
        metrics.record_frame(cpu_ms, interval.map(over_budget_ms).unwrap_or(0.0));
        if let Some(fps) = metrics.tick(now) {
            tracing::debug!(fps, "fps window closed");
        }
        metrics.poll_emit(now)
    };
    if let Some(snapshot) = snapshot {
        snapshot.log();
        bus.publish(BusEvent::MetricsSnapshot(snapshot));
    }
}

/// The refined mask as a grayscale frame, black while there is none. The
/// mask is cropped like the `frame` sized capture it covers.
fn matte_frame(
    mask: Option<&RefinedMask>,
    frame: (u32, u32),
    output: (u32, u32),
    mirror: bool,
) -> RgbaImage {
    let gray = match mask {
        Some(m) if m.dimensions() == output && frame == output => m.alpha.clone(),
        Some(m) => cover_fit_as(&m.alpha, frame, output.0, output.1),
        None => GrayImage::new(output.0, output.1),
    };
    let gray = if mirror {
        imageops::flip_horizontal(&gray)
    } else {
        gray
    };
    DynamicImage::ImageRgb8(Preprocessor::mask_to_rgb(&gray)).to_rgba8()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matte_without_mask_is_black() {
        let out = matte_frame(None, (4, 2), (4, 2), true);
        assert_eq!(out.dimensions(), (4, 2));
        assert!(out.pixels().all(|p| p.0 == [0, 0, 0, 255]));
    }

    #[test]
    fn matte_shows_mirrored_mask() {
        let mut alpha = GrayImage::new(4, 1);
        alpha.put_pixel(0, 0, image::Luma([255]));
        let mask = RefinedMask {
            alpha,
            subject_detected: true,
        };
        let out = matte_frame(Some(&mask), (4, 1), (4, 1), true);
        assert_eq!(out.get_pixel(3, 0).0, [255, 255, 255, 255]);
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 255]);
    }

    #[test]
    fn matte_is_cropped_like_the_frame() {
        // 16:9 capture into 4:3: the outer eighths of the mask are cut away
        let alpha = GrayImage::from_fn(32, 18, |x, _| image::Luma([if x < 4 { 255 } else { 0 }]));
        let mask = RefinedMask {
            alpha,
            subject_detected: true,
        };
        let out = matte_frame(Some(&mask), (160, 90), (60, 45), false);
        assert_eq!(out.dimensions(), (60, 45));
        assert_eq!(out.get_pixel(5, 20).0, [0, 0, 0, 255]);
    }
}
