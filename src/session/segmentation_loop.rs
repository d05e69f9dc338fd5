use super::lock::SessionToken;
use super::state::SessionState;
use super::task::RepeatingTask;
use crate::refine::{MaskRefiner, RefineOptions, RefinedMask};
use crate::segmentation::SharedModel;
use anyhow::{anyhow, Result};
use image::RgbaImage;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct CycleResult {
    mask: RefinedMask,
    latency_ms: f64,
}

/// Start the segmentation loop of session `token`.
///
/// Each cycle takes the newest frame, runs inference and refinement off the
/// runtime thread, and publishes the refined mask. The next cycle is
/// scheduled `interval` after the previous one finished.
pub(crate) fn spawn(
    state: Rc<SessionState>,
    token: SessionToken,
    model: SharedModel,
    interval: Duration,
) -> RepeatingTask {
    let refiner = Arc::new(Mutex::new(MaskRefiner::new()));
    let cycle_state = Rc::clone(&state);

    RepeatingTask::spawn(
        "segmentation",
        interval,
        move || {
            run_cycle(
                Rc::clone(&cycle_state),
                token,
                Arc::clone(&model),
                Arc::clone(&refiner),
            )
        },
        move |result: CycleResult| {
            if state.publish_mask(token, result.mask) {
                state.record_latency(token, result.latency_ms);
            }
        },
    )
}

async fn run_cycle(
    state: Rc<SessionState>,
    token: SessionToken,
    model: SharedModel,
    refiner: Arc<Mutex<MaskRefiner>>,
) -> Option<CycleResult> {
    if !state.is_current(token) {
        return None;
    }
    // No frame yet: nothing to do this cycle
    let frame = state.latest_frame()?;
    let output = state.output_size();
    let options = state.refine_options();
    let feather_px = state.params().feather_px;

    let started = tokio::time::Instant::now();
    let job = tokio::task::spawn_blocking(move || {
        infer(&model, &refiner, &frame, output, &options, feather_px)
    });

    match job.await {
        Ok(Ok(mask)) => {
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            tracing::debug!(
                latency_ms = format_args!("{:.1}", latency_ms),
                subject = mask.subject_detected,
                "segmentation cycle"
            );
            Some(CycleResult { mask, latency_ms })
        }
        Ok(Err(e)) => {
            tracing::warn!("Segmentation cycle failed, keeping previous mask: {:#}", e);
            None
        }
        Err(e) => {
            tracing::warn!("Segmentation task did not complete: {}", e);
            None
        }
    }
}

fn infer(
    model: &SharedModel,
    refiner: &Mutex<MaskRefiner>,
    frame: &RgbaImage,
    output: (u32, u32),
    options: &RefineOptions,
    feather_px: f32,
) -> Result<RefinedMask> {
    let raw = {
        let mut model = model
            .lock()
            .map_err(|_| anyhow!("Segmentation model lock poisoned"))?;
        model.segment(frame)?
    };

    let mut refiner = refiner
        .lock()
        .map_err(|_| anyhow!("Mask refiner lock poisoned"))?;
    let alpha = refiner.refine(&raw.mask, frame.dimensions(), output, options, feather_px);

    Ok(RefinedMask {
        alpha,
        subject_detected: raw.subject_detected,
    })
}
