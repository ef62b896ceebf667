// =============================================================================
// STREAMING RENDERER DEMO
// =============================================================================
//
// Opens a window, starts the renderer and runs a small "simulation" thread
// that keeps spawning and despawning triangles through an EntitySubmitter.
//
// FRAME FLOW:
// 1. Simulation thread queues add/remove requests
// 2. Streaming thread uploads vertices and re-records the inactive set
// 3. RedrawRequested -> Renderer::render (wait, acquire, submit, present)
//
// =============================================================================

use anyhow::Result;
use glam::Vec3;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use stream_renderer::{Config, Entity, EntityRef, EntitySubmitter, Renderer, Vertex};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

/// Triangles alive at once before the oldest is despawned
const MAX_LIVE_TRIANGLES: usize = 64;
const SPAWN_INTERVAL: Duration = Duration::from_millis(50);

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting streaming renderer");
    log::info!(
        "Window: {}x{}, queue capacity {}",
        config.window.width,
        config.window.height,
        config.streaming.queue_capacity
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with optional file output
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env, Target};

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    if let Some(file) = open_log_file(config) {
        builder.target(Target::Pipe(Box::new(file)));
    }
    builder.init();
}

/// Create the log file with its header, if file logging is on
fn open_log_file(config: &Config) -> Option<File> {
    if !config.debug.log_to_file {
        return None;
    }

    let mut file = match OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&config.debug.log_file)
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Cannot open log file {}: {}", config.debug.log_file, e);
            return None;
        }
    };

    let _ = writeln!(file, "=== Streaming Renderer Log ===");
    let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
    let _ = writeln!(file);
    Some(file)
}

// =============================================================================
// SIMULATION
// =============================================================================

/// A triangle at slot `n` on a spiral, tinted by its index
fn spawn_triangle(n: u32) -> EntityRef {
    let angle = n as f32 * 0.7;
    let radius = 0.15 + (n % 8) as f32 * 0.1;
    let center = Vec3::new(angle.cos() * radius, angle.sin() * radius, 0.0);
    let size = 0.08;
    let color = Vec3::new(
        (n % 3) as f32 / 2.0,
        (n % 5) as f32 / 4.0,
        1.0 - (n % 7) as f32 / 6.0,
    );

    // Clockwise in Vulkan clip space (y down)
    Entity::with_vertices(vec![
        Vertex::new(center + Vec3::new(0.0, -size, 0.0), color),
        Vertex::new(center + Vec3::new(size, size, 0.0), color),
        Vertex::new(center + Vec3::new(-size, size, 0.0), color),
    ])
    .into_ref()
}

/// Producer thread feeding the renderer's transfer queue
struct Simulation {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Simulation {
    fn start(submitter: EntitySubmitter) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = thread::Builder::new()
            .name("simulation".into())
            .spawn(move || {
                let mut live: VecDeque<EntityRef> = VecDeque::new();
                let mut spawned = 0u32;

                while flag.load(Ordering::Relaxed) {
                    let entity = spawn_triangle(spawned);
                    if submitter.add_entity_timeout(&entity, SPAWN_INTERVAL) {
                        live.push_back(entity);
                        spawned = spawned.wrapping_add(1);
                    }

                    if live.len() > MAX_LIVE_TRIANGLES {
                        if let Some(oldest) = live.pop_front() {
                            if !submitter.remove_entity(&oldest) {
                                // Retry next tick
                                live.push_front(oldest);
                            }
                        }
                    }

                    thread::sleep(SPAWN_INTERVAL);
                }
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the simulation stops before the renderer,
/// and the renderer is gone before the window it presents to.
struct App {
    config: Config,
    simulation: Option<Simulation>,
    renderer: Renderer,
    window: Option<Arc<Window>>,
    fps: FpsCounter,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            renderer: Renderer::new(config.clone()),
            config,
            simulation: None,
            window: None,
            fps: FpsCounter::new(),
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut simulation) = self.simulation.take() {
            simulation.stop();
        }
        self.renderer.shutdown();
    }

    fn update_title(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        let Some((fps, frame_ms)) = self.fps.tick() else {
            return;
        };

        let stats = self.renderer.stream_stats();
        if let Some(ref window) = self.window {
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms) [{} streamed, {} dropped]",
                self.config.window.title,
                fps,
                frame_ms,
                stats.added.saturating_sub(stats.removed),
                stats.dropped
            ));
        }
    }
}

/// Frames per second, reported once per elapsed second
struct FpsCounter {
    frames: u32,
    window_start: Instant,
    last_frame: Instant,
}

impl FpsCounter {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            frames: 0,
            window_start: now,
            last_frame: now,
        }
    }

    /// Count a frame; returns (fps, last frame in ms) when a second has passed
    fn tick(&mut self) -> Option<(f32, f32)> {
        let now = Instant::now();
        let frame_ms = now.duration_since(self.last_frame).as_secs_f32() * 1000.0;
        self.last_frame = now;
        self.frames += 1;

        let elapsed = now.duration_since(self.window_start).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }
        let fps = self.frames as f32 / elapsed;
        self.frames = 0;
        self.window_start = now;
        Some((fps, frame_ms))
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_resizable(false)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.renderer.startup(&*window) {
            log::error!("Failed to start renderer: {}", e);
            self.renderer.shutdown();
            event_loop.exit();
            return;
        }

        match Simulation::start(self.renderer.submitter()) {
            Ok(simulation) => self.simulation = Some(simulation),
            Err(e) => log::error!("Failed to start simulation: {:#}", e),
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::RedrawRequested => match self.renderer.render() {
                Ok(()) => self.update_title(),
                Err(e) => log::error!("Render error: {}", e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    self.shutdown();
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.renderer.is_started() {
            if let Some(ref window) = self.window {
                window.request_redraw();
            }
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn log_config(path: &std::path::Path, enabled: bool) -> Config {
        let mut config = Config::default();
        config.debug.log_to_file = enabled;
        config.debug.log_file = path.to_string_lossy().into_owned();
        config
    }

    #[test]
    fn log_file_receives_header_and_later_writes() {
        let path = std::env::temp_dir().join(format!("stream-renderer-{}.log", std::process::id()));
        let config = log_config(&path, true);

        let mut file = open_log_file(&config).expect("log file should open");
        writeln!(file, "INFO frame rendered").unwrap();
        drop(file);

        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(contents.starts_with("=== Streaming Renderer Log ==="));
        assert!(contents.ends_with("INFO frame rendered\n"));
    }

    #[test]
    fn no_log_file_when_disabled() {
        let path = std::env::temp_dir().join("stream-renderer-disabled.log");
        let config = log_config(&path, false);

        assert!(open_log_file(&config).is_none());
        assert!(!path.exists());
    }
}
