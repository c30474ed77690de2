//! Terminal presentation for FlapNet runs.
//!
//! The world is painted into a virtual pixel grid at two pixels per terminal
//! row using the upper-half-block glyph, which doubles the vertical
//! resolution of whatever terminal the run lands in. The [`TerminalSink`]
//! owns the raw-mode terminal for the lifetime of a run and restores it on
//! drop, so a panic mid-run still leaves the shell usable.

use std::io::{Stdout, stdout};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::buffer::Buffer;
use ratatui::layout::Rect;
use ratatui::style::{Color, Style};
use ratatui::widgets::Widget;
use thiserror::Error;
use tracing::debug;

use flapnet_core::{
    BIRD_HEIGHT, BIRD_WIDTH, FrameSink, FrameSnapshot, PIPE_WIDTH, SimConfig, SimError, SinkSignal,
};

const SKY: Color = Color::Rgb(92, 170, 220);
const BIRD_BODY: Color = Color::Rgb(236, 200, 62);
const BIRD_WING: Color = Color::Rgb(244, 240, 222);
const PIPE_GREEN: Color = Color::Rgb(90, 170, 60);
const PIPE_LIP: Color = Color::Rgb(60, 130, 40);
const GROUND_TAN: Color = Color::Rgb(216, 186, 120);
const GROUND_SEAM: Color = Color::Rgb(170, 140, 90);

/// Rows reserved for the status line above the playfield.
const HUD_ROWS: u16 = 1;

/// Errors raised while setting up the terminal.
#[derive(Debug, Error)]
pub enum RenderError {
    /// Terminal io failure.
    #[error("terminal io: {0}")]
    Io(#[from] std::io::Error),
}

/// Virtual pixel grid blitted to the terminal as half-block glyphs.
///
/// Each terminal cell carries two vertically stacked pixels: the glyph's
/// foreground paints the top pixel and its background the bottom one.
struct PixelGrid {
    width: usize,
    height: usize,
    pixels: Vec<Color>,
}

impl PixelGrid {
    fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![SKY; width * height],
        }
    }

    fn set(&mut self, x: i32, y: i32, color: Color) {
        if x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height {
            self.pixels[y as usize * self.width + x as usize] = color;
        }
    }

    fn fill_rect(&mut self, x: i32, y: i32, width: i32, height: i32, color: Color) {
        for py in y..y + height {
            for px in x..x + width {
                self.set(px, py, color);
            }
        }
    }

    fn fill_ellipse(&mut self, cx: f32, cy: f32, rx: f32, ry: f32, color: Color) {
        let x0 = (cx - rx).floor() as i32;
        let x1 = (cx + rx).ceil() as i32;
        let y0 = (cy - ry).floor() as i32;
        let y1 = (cy + ry).ceil() as i32;
        for py in y0..=y1 {
            for px in x0..=x1 {
                let nx = (px as f32 + 0.5 - cx) / rx;
                let ny = (py as f32 + 0.5 - cy) / ry;
                if nx * nx + ny * ny <= 1.0 {
                    self.set(px, py, color);
                }
            }
        }
    }

    fn blit(&self, area: Rect, buf: &mut Buffer) {
        for row in 0..area.height {
            for col in 0..area.width {
                let x = col as usize;
                let top_y = row as usize * 2;
                let bottom_y = top_y + 1;
                if x >= self.width || top_y >= self.height {
                    continue;
                }
                let top = self.pixels[top_y * self.width + x];
                let bottom = if bottom_y < self.height {
                    self.pixels[bottom_y * self.width + x]
                } else {
                    top
                };
                buf[(area.x + col, area.y + row)]
                    .set_symbol("▀")
                    .set_style(Style::default().fg(top).bg(bottom));
            }
        }
    }
}

/// Widget that paints one [`FrameSnapshot`] into a terminal area.
pub struct WorldView<'a> {
    frame: &'a FrameSnapshot,
    world_width: f32,
    world_height: f32,
    floor_y: f32,
    bird_x: f32,
}

impl<'a> WorldView<'a> {
    /// Build a view over `frame` with the geometry it was simulated in.
    #[must_use]
    pub fn new(frame: &'a FrameSnapshot, config: &SimConfig) -> Self {
        Self {
            frame,
            world_width: config.world_width,
            world_height: config.world_height,
            floor_y: config.floor_y,
            bird_x: config.bird_x,
        }
    }

    fn paint(&self, grid: &mut PixelGrid) {
        let sx = grid.width as f32 / self.world_width;
        let sy = grid.height as f32 / self.world_height;
        let to_x = |world: f32| (world * sx).round() as i32;
        let to_y = |world: f32| (world * sy).round() as i32;
        let pipe_w = ((PIPE_WIDTH as f32 * sx).round() as i32).max(1);
        let lip_h = to_y(14.0).max(1);
        let floor = to_y(self.floor_y);

        for pipe in &self.frame.pipes {
            let x = to_x(pipe.x);
            let gap_top = to_y(pipe.gap_top);
            let gap_bottom = to_y(pipe.gap_bottom);
            grid.fill_rect(x, 0, pipe_w, gap_top, PIPE_GREEN);
            grid.fill_rect(x, gap_top - lip_h, pipe_w, lip_h, PIPE_LIP);
            grid.fill_rect(x, gap_bottom, pipe_w, floor - gap_bottom, PIPE_GREEN);
            grid.fill_rect(x, gap_bottom, pipe_w, lip_h, PIPE_LIP);
        }

        // Ground covers anything that scrolled beneath the floor line; the
        // seams at the strip edges make the scroll visible.
        grid.fill_rect(0, floor, grid.width as i32, grid.height as i32 - floor, GROUND_TAN);
        let seam_w = to_x(4.0).max(1);
        for seam in [self.frame.ground.x1, self.frame.ground.x2] {
            grid.fill_rect(to_x(seam), floor + 1, seam_w, grid.height as i32 - floor, GROUND_SEAM);
        }
        grid.fill_rect(0, floor, grid.width as i32, 1, GROUND_SEAM);

        let rx = (BIRD_WIDTH as f32 / 2.0 * sx).max(1.0);
        let ry = (BIRD_HEIGHT as f32 / 2.0 * sy).max(1.0);
        for bird in &self.frame.birds {
            let cx = (self.bird_x + BIRD_WIDTH as f32 / 2.0) * sx;
            let cy = (bird.y + BIRD_HEIGHT as f32 / 2.0) * sy;
            grid.fill_ellipse(cx, cy, rx, ry, BIRD_BODY);
            // A small wing patch shifted by the animation frame.
            let wing_dy = match bird.frame % 3 {
                0 => -ry * 0.4,
                1 => 0.0,
                _ => ry * 0.4,
            };
            grid.fill_ellipse(
                cx - rx * 0.2,
                cy + wing_dy,
                (rx * 0.4).max(1.0),
                (ry * 0.3).max(1.0),
                BIRD_WING,
            );
        }
    }

    fn hud_line(&self) -> String {
        format!(
            " gen {:>3}  score {:>3}  best {:>3}  alive {:>3}  tick {:>6}  [q] quit",
            self.frame.generation,
            self.frame.score,
            self.frame.best_score,
            self.frame.alive,
            self.frame.tick
        )
    }
}

impl Widget for WorldView<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        if area.height <= HUD_ROWS || area.width == 0 {
            return;
        }
        let hud = Rect::new(area.x, area.y, area.width, HUD_ROWS);
        let field = Rect::new(
            area.x,
            area.y + HUD_ROWS,
            area.width,
            area.height - HUD_ROWS,
        );

        let mut grid = PixelGrid::new(field.width as usize, field.height as usize * 2);
        self.paint(&mut grid);
        grid.blit(field, buf);

        let line = self.hud_line();
        buf.set_stringn(
            hud.x,
            hud.y,
            &line,
            hud.width as usize,
            Style::default().fg(Color::White).bg(Color::Black),
        );
    }
}

/// Raw-mode terminal sink; one [`FrameSnapshot`] in, one drawn frame out.
pub struct TerminalSink {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    config: SimConfig,
}

impl TerminalSink {
    /// Enter raw mode and the alternate screen. `config` is the simulation
    /// geometry the incoming frames are measured in.
    pub fn new(config: SimConfig) -> Result<Self, RenderError> {
        enable_raw_mode()?;
        let mut out = stdout();
        execute!(out, EnterAlternateScreen, crossterm::cursor::Hide)?;
        let terminal = Terminal::new(CrosstermBackend::new(out))?;
        debug!("terminal sink initialized");
        Ok(Self { terminal, config })
    }

    /// Drain pending key events, reporting whether a quit key was seen.
    fn poll_quit(&self) -> Result<bool, std::io::Error> {
        let mut quit = false;
        while event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()?
                && key.kind == KeyEventKind::Press
                && matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
            {
                quit = true;
            }
        }
        Ok(quit)
    }
}

impl FrameSink for TerminalSink {
    fn present(&mut self, frame: &FrameSnapshot) -> Result<SinkSignal, SimError> {
        let config = self.config.clone();
        self.terminal
            .draw(|terminal_frame| {
                let view = WorldView::new(frame, &config);
                terminal_frame.render_widget(view, terminal_frame.area());
            })
            .map_err(|err| SimError::Sink(err.to_string()))?;

        let quit = self
            .poll_quit()
            .map_err(|err| SimError::Sink(err.to_string()))?;
        Ok(if quit {
            SinkSignal::Quit
        } else {
            SinkSignal::Continue
        })
    }
}

impl Drop for TerminalSink {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(stdout(), LeaveAlternateScreen, crossterm::cursor::Show);
    }
}
