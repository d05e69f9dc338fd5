//! Session lifecycle.
//!
//! A session is one capture device, one renderer, one output sink, one
//! render loop and at most one segmentation loop, all tied to a single
//! [`SessionToken`]. The coordinator is the only thing that creates or ends
//! sessions; starting a new one always tears the old one down first.

mod bus;
mod lock;
mod render_loop;
mod segmentation_loop;
mod state;
mod task;

pub use bus::{BusEvent, EventBus};
pub use lock::{RunLock, SessionToken};
pub use state::SessionState;
pub use task::{LoopFlag, RepeatingTask};

use crate::background::{self, BackgroundSelection, BackgroundStore};
use crate::capture::{CaptureRequest, FrameSource};
use crate::config::PipelineConfig;
use crate::error::SessionError;
use crate::metrics::SessionStatus;
use crate::output::OutputSink;
use crate::refine::RefineOptions;
use crate::render::{AcceleratedRenderer, BackendKind, FrameRenderer, RenderParams, SoftwareRenderer};
use crate::segmentation::{share, SegmentationModel, SharedModel};
use anyhow::Result;
use state::SessionLoops;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Device access the coordinator needs. Real hardware in the binary, fakes
/// in tests.
pub trait SessionIo {
    fn open_capture(&mut self, request: &CaptureRequest) -> Result<Box<dyn FrameSource>>;

    fn open_sink(&mut self, size: (u32, u32)) -> Result<Box<dyn OutputSink>>;

    fn load_model(&mut self) -> Result<Box<dyn SegmentationModel>>;

    fn create_accelerated(
        &mut self,
        frame_size: (u32, u32),
        output: (u32, u32),
    ) -> Result<Box<dyn FrameRenderer>> {
        Ok(Box::new(AcceleratedRenderer::new(frame_size, output)?))
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub capture: CaptureRequest,
    pub output: (u32, u32),
    pub frame_period: Duration,
    pub segmentation_interval: Duration,
    pub show_matte: bool,
}

impl SessionSettings {
    pub fn from_config(config: &PipelineConfig, capture: CaptureRequest, output: (u32, u32)) -> Self {
        Self {
            capture,
            output,
            frame_period: config.render.frame_period(),
            segmentation_interval: config.segmentation.interval(),
            show_matte: false,
        }
    }
}

pub struct SessionCoordinator<I: SessionIo> {
    io: I,
    settings: SessionSettings,
    state: Rc<SessionState>,
    bus: EventBus,
    model: Option<SharedModel>,
    backgrounds: Rc<RefCell<BackgroundStore>>,
    selection: Option<BackgroundSelection>,
    active: Option<(SessionToken, BackendKind)>,
}

impl<I: SessionIo> SessionCoordinator<I> {
    pub fn new(
        io: I,
        settings: SessionSettings,
        params: RenderParams,
        refine: RefineOptions,
        bus: EventBus,
    ) -> Self {
        let state = SessionState::new(params, refine, settings.output);
        Self {
            io,
            settings,
            state,
            bus,
            model: None,
            backgrounds: Rc::new(RefCell::new(BackgroundStore::new())),
            selection: None,
            active: None,
        }
    }

    /// Start a session on `backend`, replacing any running one.
    ///
    /// Returns the backend actually in use, which is the software one when
    /// the accelerated renderer could not be acquired. Must be called inside
    /// a `LocalSet`.
    pub fn start(&mut self, backend: BackendKind) -> Result<BackendKind, SessionError> {
        let (width, height) = self.settings.output;
        if width == 0 || height == 0 {
            return Err(SessionError::InvalidDimensions { width, height });
        }

        let previous = self.active.take();
        let weak = Rc::downgrade(&self.state);
        let token = self.state.lock.borrow_mut().acquire(move || {
            if let Some(state) = weak.upgrade() {
                state.teardown();
            }
        });
        if let Some((previous, _)) = previous {
            info!("Session {} replaced by {}", previous, token);
            self.bus.publish(BusEvent::SessionStopped);
        }

        match self.bring_up(token, backend) {
            Ok(actual) => {
                self.active = Some((token, actual));
                info!(
                    "Session {} started on {} backend at {}x{}",
                    token, actual, width, height
                );
                self.bus.publish(BusEvent::SessionStarted { backend: actual });
                self.publish_snapshot();
                Ok(actual)
            }
            Err(e) => {
                error!("Session start failed: {}", e);
                self.state.lock.borrow_mut().release(token);
                Err(e)
            }
        }
    }

    fn bring_up(&mut self, token: SessionToken, requested: BackendKind) -> Result<BackendKind, SessionError> {
        let output = self.settings.output;

        let source = self
            .io
            .open_capture(&self.settings.capture)
            .map_err(SessionError::CaptureUnavailable)?;
        let frame_size = source.resolution();
        *self.state.source.borrow_mut() = Some(source);

        let sink = self
            .io
            .open_sink(output)
            .map_err(SessionError::OutputUnavailable)?;
        *self.state.sink.borrow_mut() = Some(sink);
        self.state.set_output_size(output);

        let renderer = self.create_renderer(requested, frame_size, output);
        let backend = renderer.kind();
        *self.state.renderer.borrow_mut() = Some(renderer);

        let model = self.ensure_model();

        if let Some(selection) = self.selection.clone() {
            self.load_background(token, selection);
        }

        self.state.metrics.borrow_mut().reset(
            tokio::time::Instant::now().into_std(),
            backend.as_str(),
            SessionStatus::Running,
        );

        let render_flag = LoopFlag::enabled();
        let render = render_loop::spawn(
            Rc::clone(&self.state),
            token,
            self.bus.clone(),
            self.settings.frame_period,
            self.settings.show_matte,
            render_flag.clone(),
        );
        let segmentation = model.map(|model| {
            segmentation_loop::spawn(
                Rc::clone(&self.state),
                token,
                model,
                self.settings.segmentation_interval,
            )
        });
        *self.state.loops.borrow_mut() = Some(SessionLoops {
            render_flag,
            render,
            segmentation,
        });

        Ok(backend)
    }

    fn create_renderer(
        &mut self,
        requested: BackendKind,
        frame_size: (u32, u32),
        output: (u32, u32),
    ) -> Box<dyn FrameRenderer> {
        match requested {
            BackendKind::Software => Box::new(SoftwareRenderer::new()),
            BackendKind::Accelerated => match self.io.create_accelerated(frame_size, output) {
                Ok(renderer) => renderer,
                Err(e) => {
                    warn!("Accelerated renderer unavailable, using software: {:#}", e);
                    Box::new(SoftwareRenderer::new())
                }
            },
        }
    }

    /// Load the model on first use and reset its temporal state.
    fn ensure_model(&mut self) -> Option<SharedModel> {
        if self.model.is_none() {
            match self.io.load_model() {
                Ok(model) => {
                    let (w, h) = model.input_size();
                    info!("Segmentation model ready ({}x{} input)", w, h);
                    self.model = Some(share(model));
                }
                Err(e) => {
                    warn!("Segmentation unavailable, rendering raw video: {:#}", e);
                    return None;
                }
            }
        }

        let model = self.model.clone()?;
        let reset = match model.lock() {
            Ok(mut m) => {
                m.reset_state();
                true
            }
            Err(_) => false,
        };
        if !reset {
            warn!("Segmentation model lock poisoned, rendering raw video");
            self.model = None;
            return None;
        }
        Some(model)
    }

    /// Decode and fit `selection` on the blocking pool, then hand it to the
    /// session that asked for it. A newer selection or a session change in
    /// the meantime discards the result.
    fn load_background(&self, token: SessionToken, selection: BackgroundSelection) {
        let output = self.settings.output;
        let (cached, generation) = {
            let mut store = self.backgrounds.borrow_mut();
            (store.cached(&selection), store.next_generation())
        };
        let state = Rc::clone(&self.state);
        let store = Rc::clone(&self.backgrounds);

        tokio::task::spawn_local(async move {
            let job = selection.clone();
            let loaded = tokio::task::spawn_blocking(move || {
                background::load(&job, cached, output, generation)
            })
            .await;
            let asset = match loaded {
                Ok(Ok(asset)) => {
                    store.borrow_mut().remember(&selection, &asset);
                    Some(Arc::new(asset))
                }
                Ok(Err(e)) => {
                    warn!("Background '{}' unavailable: {:#}", selection.id, e);
                    None
                }
                Err(e) => {
                    warn!("Background load did not complete: {}", e);
                    None
                }
            };
            if !state.is_current(token) || !store.borrow().is_latest(generation) {
                debug!("Discarding superseded background '{}'", selection.id);
                return;
            }
            state.set_background(asset);
        });
    }

    /// Stop the running session. Returns false when nothing was running.
    pub fn stop(&mut self) -> bool {
        self.end_session(true)
    }

    fn end_session(&mut self, report: bool) -> bool {
        let Some((token, _)) = self.active.take() else {
            return false;
        };
        let released = self.state.lock.borrow_mut().release(token);
        if released {
            info!("Session {} stopped", token);
            self.bus.publish(BusEvent::SessionStopped);
            if report {
                self.publish_snapshot();
            }
        }
        released
    }

    /// Restart the running session on another backend. The old session is
    /// fully released before the new renderer is created.
    pub fn switch_backend(&mut self, backend: BackendKind) -> Result<Option<BackendKind>, SessionError> {
        if !self.is_running() {
            return Ok(None);
        }
        self.stop();
        self.start(backend).map(Some)
    }

    /// Apply a parameter or selection event.
    pub fn handle(&mut self, event: &BusEvent) {
        match event {
            BusEvent::BackgroundSelected(selection) => {
                self.selection = Some(selection.clone());
                if let Some(token) = self.token().filter(|_| self.is_running()) {
                    self.load_background(token, selection.clone());
                }
            }
            BusEvent::OpacityChanged(percent) => {
                self.state.update_params(|p| p.set_opacity_percent(*percent));
            }
            BusEvent::FeatherChanged(px) => {
                self.state.update_params(|p| p.set_feather(*px));
            }
            BusEvent::OverlayUpdated(meta) => {
                self.state.set_overlay(meta.clone());
            }
            BusEvent::MetricsSnapshot(_)
            | BusEvent::SessionStarted { .. }
            | BusEvent::SessionStopped => {}
        }
    }

    /// Report a lifecycle change through the same limiter as the render
    /// loop. A suppressed report is sent once the window reopens, unless a
    /// running session has taken over reporting by then.
    fn publish_snapshot(&self) {
        let now = tokio::time::Instant::now().into_std();
        if emit_snapshot(&self.state, &self.bus, now) {
            return;
        }
        let wait = self.state.metrics.borrow().until_next_emit(now);
        let state = Rc::clone(&self.state);
        let bus = self.bus.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(wait).await;
            if state.active_token().is_none() {
                emit_snapshot(&state, &bus, tokio::time::Instant::now().into_std());
            }
        });
    }

    pub fn is_running(&self) -> bool {
        self.active
            .is_some_and(|(token, _)| self.state.is_current(token))
    }

    pub fn backend(&self) -> Option<BackendKind> {
        self.active.map(|(_, backend)| backend)
    }

    pub fn token(&self) -> Option<SessionToken> {
        self.active.map(|(token, _)| token)
    }

    pub fn state(&self) -> &Rc<SessionState> {
        &self.state
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

fn emit_snapshot(state: &SessionState, bus: &EventBus, now: std::time::Instant) -> bool {
    let snapshot = state.metrics.borrow_mut().poll_emit(now);
    match snapshot {
        Some(snapshot) => {
            snapshot.log();
            bus.publish(BusEvent::MetricsSnapshot(snapshot));
            true
        }
        None => false,
    }
}

impl<I: SessionIo> Drop for SessionCoordinator<I> {
    fn drop(&mut self) {
        self.end_session(false);
    }
}
