//! SDL2 Window Display Module
//! Polls a live frame buffer and renders the latest frame into an SDL2 window.
//! Quits on window close, `q` or `Esc`.

use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use sdl2::event::Event;
use sdl2::keyboard::Keycode;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};

use tracing::{info, instrument, warn};

use crate::capture::{Frame, FrameSource, PixelFormat};
use crate::pipeline::{Grab, LiveFrameBuffer};
use crate::DisplayConfig;

/// SDL2 Window Display
/// Reads the buffer at its own cadence; frames the window is too slow for are skipped.
pub struct Sdl2Display {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
    poll_interval: Duration,
}

impl Sdl2Display {
    pub fn new(
        sdl_context: &sdl2::Sdl,
        config: &DisplayConfig,
        poll_interval: Duration,
    ) -> Result<Self> {
        let video_subsystem = sdl_context.video().map_err(|e| eyre!(e))?;

        let window_builder = video_subsystem
            .window(&config.title, config.width, config.height)
            .position_centered()
            .resizable()
            .build()?;

        let canvas_builder = window_builder.into_canvas().present_vsync();

        let canvas = canvas_builder.build()?;
        let texture_creator = canvas.texture_creator();

        Ok(Self {
            canvas,
            texture_creator,
            poll_interval,
        })
    }

    pub fn render_frame(&mut self, frame: &Frame) -> Result<()> {
        let render_start = Instant::now();

        let format = match frame.meta.format {
            PixelFormat::Rgb24 => PixelFormatEnum::RGB24,
            PixelFormat::Bgr24 => PixelFormatEnum::BGR24,
        };

        let mut texture = self
            .texture_creator
            .create_texture_streaming(format, frame.meta.width, frame.meta.height)
            .map_err(|e| eyre!(e))?;

        texture
            .update(None, &frame.data, frame.meta.stride as usize)
            .map_err(|e| eyre!(e))?;

        self.canvas.clear();
        self.canvas
            .copy(&texture, None, None)
            .map_err(|e| eyre!(e))?;

        self.canvas.present();

        metrics::histogram!("livecam_render_time_us")
            .record(render_start.elapsed().as_micros() as f64);
        Ok(())
    }

    #[instrument(skip_all)]
    pub fn run<S: FrameSource>(
        &mut self,
        sdl_context: &sdl2::Sdl,
        buffer: &LiveFrameBuffer<S>,
    ) -> Result<()> {
        let mut event_pump = sdl_context.event_pump().map_err(|e| eyre!(e))?;
        let mut shown: Option<u64> = None;
        let mut missing = false;

        'running: loop {
            for event in event_pump.poll_iter() {
                match event {
                    Event::Quit { .. } => {
                        info!("Quit event received");
                        break 'running;
                    }
                    Event::KeyDown {
                        keycode: Some(key), ..
                    } if key == Keycode::Q || key == Keycode::Escape => {
                        info!("Quit key pressed");
                        break 'running;
                    }
                    _ => {}
                }
            }

            match buffer.read() {
                Grab::Frame(frame) => {
                    if shown != Some(frame.sequence()) {
                        self.render_frame(&frame)?;
                        shown = Some(frame.sequence());
                    }
                    if missing {
                        info!("Frames resumed");
                        missing = false;
                    }
                }
                Grab::Pending | Grab::Missed => {
                    if !missing {
                        warn!(
                            streak = buffer.stats().miss_streak,
                            "Failed to get frame"
                        );
                        missing = true;
                    }
                }
            }

            std::thread::sleep(self.poll_interval);
        }

        Ok(())
    }
}
