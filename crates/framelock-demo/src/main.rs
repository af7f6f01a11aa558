//! framelock demo: windowed playback of a file or a synthetic stream.
//!
//! Runs the whole pipeline in one window: a decode session paced by the
//! process-wide gate publishes into the present slot, each publish wakes the
//! winit event loop through its proxy, and the presenter draws the freshest
//! frame on the redraw that follows.
//!
//! ```bash
//! # Synthetic gradient stream, no codec libraries needed:
//! cargo run -p framelock-demo
//!
//! # A real file or URL (requires the `ffmpeg` feature):
//! cargo run -p framelock-demo --features ffmpeg -- demo.mp4 d3d11va
//! ```
//!
//! Keys: Space pauses and resumes, Escape quits.

use std::sync::Arc;

use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowAttributes, WindowId};

#[cfg(feature = "ffmpeg")]
use framelock::HwAccel;
use framelock::{
    media::MediaSource, PipelineError, Player, PresentReader, Presenter, SessionOutcome,
    SourceFactory, SyntheticSource, VideoFrame,
};

/// Sent through the event-loop proxy after each frame publish.
#[derive(Debug, Clone, Copy)]
struct FramePublished;

/// Window-bound half of the app, created once the event loop is live.
struct Stage {
    window: Arc<Window>,
    presenter: Presenter,
}

struct DemoApp {
    player: Player,
    /// Reader waiting to be bound to the presenter at window creation.
    frames: Option<PresentReader<VideoFrame>>,
    stage: Option<Stage>,
}

impl DemoApp {
    fn shut_down(&mut self, event_loop: &ActiveEventLoop) {
        self.player.stop();
        if let Some(stage) = self.stage.as_mut() {
            stage.presenter.release_display();
        }
        event_loop.exit();
    }
}

impl ApplicationHandler<FramePublished> for DemoApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.stage.is_some() {
            return;
        }
        let Some(frames) = self.frames.take() else {
            return;
        };

        let attributes = WindowAttributes::default()
            .with_title("framelock demo")
            .with_inner_size(LogicalSize::new(960.0, 540.0));
        let window = match event_loop.create_window(attributes) {
            Ok(window) => Arc::new(window),
            Err(err) => {
                error!(%err, "window creation failed");
                event_loop.exit();
                return;
            }
        };

        match pollster::block_on(build_presenter(Arc::clone(&window), frames)) {
            Ok(presenter) => {
                self.stage = Some(Stage { window, presenter });
                self.player.play();
            }
            Err(err) => {
                error!(%err, "presenter setup failed");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => self.shut_down(event_loop),
            WindowEvent::Resized(size) => {
                if let Some(stage) = self.stage.as_mut() {
                    stage.presenter.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                if let Some(stage) = self.stage.as_mut() {
                    stage.presenter.render();
                }
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        state: ElementState::Pressed,
                        physical_key: PhysicalKey::Code(code),
                        ..
                    },
                ..
            } => match code {
                KeyCode::Escape => self.shut_down(event_loop),
                KeyCode::Space => {
                    self.player.pause();
                    info!(state = ?self.player.state(), "toggled pause");
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn user_event(&mut self, _event_loop: &ActiveEventLoop, _event: FramePublished) {
        if let Some(stage) = &self.stage {
            stage.window.request_redraw();
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(outcome) = self.player.take_outcome() {
            match outcome {
                SessionOutcome::Stopped { frames_presented } => {
                    info!(frames_presented, "playback stopped");
                }
                SessionOutcome::Failed(err) => error!(%err, "playback failed"),
            }
        }
    }
}

async fn build_presenter(
    window: Arc<Window>,
    frames: PresentReader<VideoFrame>,
) -> Result<Presenter, PipelineError> {
    let size = window.inner_size();
    let instance = wgpu::Instance::default();
    let surface = instance
        .create_surface(window)
        .map_err(|err| PipelineError::RenderTarget(format!("surface creation failed: {err}")))?;

    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
            ..Default::default()
        })
        .await
        .ok_or_else(|| PipelineError::RenderTarget("no compatible adapter".to_owned()))?;

    // Shared-surface playback samples NV12 directly; request the format
    // only where the adapter offers it.
    let required_features = adapter.features() & wgpu::Features::TEXTURE_FORMAT_NV12;
    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("framelock-demo"),
                required_features,
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::MemoryUsage,
            },
            None,
        )
        .await
        .map_err(|err| PipelineError::RenderTarget(format!("device request failed: {err}")))?;

    Presenter::new(
        &adapter,
        device,
        queue,
        surface,
        size.width,
        size.height,
        frames,
    )
}

fn synthetic_factory() -> SourceFactory {
    Arc::new(|| {
        // Two seconds per pass at the default cadence.
        Ok(Box::new(SyntheticSource::new(960, 540, 25.0, 50)) as Box<dyn MediaSource>)
    })
}

/// First argument: a file or URL to play (needs the `ffmpeg` feature).
/// Second argument: decode strategy (`cuda`, `dxva2`, `d3d11va`,
/// `software`). Without arguments a synthetic gradient stream plays.
fn player_from_args() -> Player {
    let mut args = std::env::args().skip(1);
    let Some(uri) = args.next() else {
        info!("no input given, playing a synthetic stream");
        return Player::new(synthetic_factory());
    };

    #[cfg(feature = "ffmpeg")]
    {
        let strategy = match args.next().as_deref() {
            Some("cuda") => HwAccel::Cuda,
            Some("dxva2") => HwAccel::Dxva2,
            Some("d3d11va") => HwAccel::D3d11va,
            Some("software") | None => HwAccel::Software,
            Some(other) => {
                warn!(strategy = other, "unknown strategy, using software");
                HwAccel::Software
            }
        };
        info!(uri = %uri, %strategy, "playing from input");
        Player::from_uri(uri, strategy)
    }

    #[cfg(not(feature = "ffmpeg"))]
    {
        warn!(uri = %uri, "built without the ffmpeg feature, playing a synthetic stream");
        Player::new(synthetic_factory())
    }
}

fn main() -> Result<(), winit::error::EventLoopError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("framelock=debug".parse().unwrap())
                .add_directive("framelock_demo=info".parse().unwrap()),
        )
        .init();

    let event_loop = EventLoop::<FramePublished>::with_user_event().build()?;
    event_loop.set_control_flow(ControlFlow::Wait);
    let proxy = event_loop.create_proxy();

    let mut player = player_from_args();
    let frames = player.take_frames();
    player.set_render_request(Arc::new(move || {
        // The loop may already be gone during shutdown.
        let _ = proxy.send_event(FramePublished);
    }));

    let mut app = DemoApp {
        player,
        frames,
        stage: None,
    };
    event_loop.run_app(&mut app)
}
