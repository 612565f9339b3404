//! Inline transcript rendering using termwiz
//!
//! Draws a few lines at the cursor position and redraws them in place, so the
//! demo works with piped stdout (termwiz talks to /dev/tty on Unix and
//! CONIN$/CONOUT$ on Windows).

use anyhow::{anyhow, Result};
use speech_bridge::SessionState;
use termwiz::cell::AttributeChange;
use termwiz::color::{ColorAttribute, SrgbaTuple};
use termwiz::surface::{Change, CursorVisibility, Position};
use termwiz::terminal::Terminal;

const LISTENING_FRAMES: usize = 4;
const WAITING_FRAMES: [&str; 12] = ["⠋", "⠙", "⠹", "⠸", "⢰", "⣰", "⣠", "⣄", "⣆", "⡆", "⠇", "⠏"];
const CHAR_DELAY_MS: f32 = 20.0;
const FADE_MS: f32 = 1500.0;
const MAX_LINES: usize = 10;

const DIM: ColorAttribute = ColorAttribute::PaletteIndex(8);

struct Segment {
    text: String,
    color: ColorAttribute,
}

impl Segment {
    fn new(text: impl Into<String>, color: ColorAttribute) -> Self {
        Self { text: text.into(), color }
    }
}

#[derive(Default)]
pub struct RenderState {
    pub rendered_lines: usize,
}

/// One frame's worth of session state.
pub struct UiState<'a> {
    pub session: SessionState,
    /// Settled text from final results
    pub committed: &'a str,
    /// Latest partial hypothesis
    pub live: &'a str,
    /// Audio is flowing
    pub ready: bool,
    pub last_error: Option<&'a str>,
    pub elapsed_ms: f32,
    pub animation_start_index: usize,
    pub animation_frame: usize,
}

fn render_err(e: impl std::fmt::Display) -> anyhow::Error {
    anyhow!("terminal error: {}", e)
}

pub fn hide_cursor(term: &mut dyn Terminal) -> Result<()> {
    term.render(&[Change::CursorVisibility(CursorVisibility::Hidden)])
        .map_err(render_err)
}

pub fn show_cursor(term: &mut dyn Terminal) -> Result<()> {
    term.render(&[Change::CursorVisibility(CursorVisibility::Visible)])
        .map_err(render_err)
}

/// Redraw the UI in place at the current cursor position
pub fn render(term: &mut dyn Terminal, state: &mut RenderState, ui: &UiState) -> Result<()> {
    let mut changes = Vec::new();

    let lines = build_lines(ui);
    let mut total_lines = 0;
    for line in lines.iter().take(MAX_LINES) {
        changes.push(Change::ClearToEndOfLine(Default::default()));
        for seg in line {
            changes.push(Change::Attribute(AttributeChange::Foreground(seg.color)));
            changes.push(Change::Text(seg.text.clone()));
        }
        changes.push(Change::Attribute(AttributeChange::Foreground(ColorAttribute::Default)));
        changes.push(Change::Text("\r\n".to_string()));
        total_lines += 1;
    }

    // Blank out lines left over from a taller previous frame
    while total_lines < state.rendered_lines {
        changes.push(Change::ClearToEndOfLine(Default::default()));
        changes.push(Change::Text("\r\n".to_string()));
        total_lines += 1;
    }

    // Back to the top for the next frame
    if total_lines > 0 {
        changes.push(Change::CursorPosition {
            x: Position::Absolute(0),
            y: Position::Relative(-(total_lines as isize)),
        });
    }
    state.rendered_lines = total_lines;

    term.render(&changes).map_err(render_err)
}

/// Clear rendered lines and restore the cursor.
pub fn cleanup(term: &mut dyn Terminal, lines: usize) -> Result<()> {
    let mut changes = Vec::new();
    for _ in 0..lines {
        changes.push(Change::ClearToEndOfLine(Default::default()));
        changes.push(Change::CursorPosition {
            x: Position::Absolute(0),
            y: Position::Relative(1),
        });
    }
    if lines > 0 {
        changes.push(Change::CursorPosition {
            x: Position::Absolute(0),
            y: Position::Relative(-(lines as isize)),
        });
    }

    term.render(&changes).map_err(render_err)?;
    show_cursor(term)
}

fn build_lines(ui: &UiState) -> Vec<Vec<Segment>> {
    let mut lines = Vec::new();

    // Line 1: indicator + transcript
    let mut line1 = Vec::new();
    let (indicator, indicator_color) = indicator(ui);
    line1.push(Segment::new(indicator, indicator_color));
    line1.push(Segment::new(" ", ColorAttribute::Default));

    if !ui.committed.is_empty() {
        line1.push(Segment::new(ui.committed, settled()));
    }
    if ui.live.is_empty() {
        if ui.committed.is_empty() {
            if let Some(hint) = placeholder(ui) {
                line1.push(Segment::new(hint, DIM));
            }
        }
    } else {
        for (i, ch) in ui.live.chars().enumerate() {
            if let Some(color) = char_color(i, ui.animation_start_index, ui.elapsed_ms) {
                line1.push(Segment::new(ch.to_string(), color));
            }
        }
    }
    lines.push(line1);

    if let Some(message) = ui.last_error {
        lines.push(vec![Segment::new(message, ColorAttribute::PaletteIndex(1))]);
    }

    // Key bar once there is something to control
    if ui.ready || ui.session == SessionState::Listening {
        lines.push(vec![
            Segment::new("Enter", ColorAttribute::PaletteIndex(3)),
            Segment::new(" finish • ", DIM),
            Segment::new("Ctrl+R", ColorAttribute::PaletteIndex(4)),
            Segment::new(" restart • ", DIM),
            Segment::new("Ctrl+C", ColorAttribute::PaletteIndex(1)),
            Segment::new(" cancel", DIM),
        ]);
    }

    lines
}

fn placeholder(ui: &UiState) -> Option<&'static str> {
    match ui.session {
        SessionState::AwaitingAuthorization => Some("Waiting for permission..."),
        SessionState::Listening if ui.ready => Some("Speak now..."),
        SessionState::Stopping => Some("Finishing..."),
        _ => None,
    }
}

fn indicator(ui: &UiState) -> (&'static str, ColorAttribute) {
    match ui.session {
        SessionState::Listening if ui.ready => {
            // Pulsing red dot
            let phase = ui.animation_frame % LISTENING_FRAMES;
            let pulse = (phase as f32 / LISTENING_FRAMES as f32 * std::f32::consts::PI).sin();
            let brightness = 200.0 + (pulse + 1.0) / 2.0 * 55.0;
            let color = ColorAttribute::TrueColorWithDefaultFallback(
                SrgbaTuple(brightness / 255.0, 0.0, 0.0, 1.0).into(),
            );
            ("●", color)
        }
        SessionState::AwaitingAuthorization | SessionState::Listening | SessionState::Stopping => {
            let frame = ui.animation_frame % WAITING_FRAMES.len();
            (WAITING_FRAMES[frame], DIM)
        }
        SessionState::Idle | SessionState::Closed => ("○", DIM),
    }
}

fn settled() -> ColorAttribute {
    ColorAttribute::TrueColorWithDefaultFallback(SrgbaTuple(1.0, 1.0, 1.0, 1.0).into())
}

/// Characters of a new hypothesis appear one by one and fade from cyan to
/// white. `None` means not visible yet.
fn char_color(index: usize, animation_start: usize, elapsed: f32) -> Option<ColorAttribute> {
    if index < animation_start {
        return Some(settled());
    }

    let appear_time = (index - animation_start) as f32 * CHAR_DELAY_MS;
    if elapsed < appear_time {
        return None;
    }

    let progress = ((elapsed - appear_time) / FADE_MS).min(1.0);
    let eased = 1.0 - (1.0 - progress).powi(3);

    // (120, 160, 180) -> (255, 255, 255)
    let r = (120.0 + 135.0 * eased) / 255.0;
    let g = (160.0 + 95.0 * eased) / 255.0;
    let b = (180.0 + 75.0 * eased) / 255.0;
    Some(ColorAttribute::TrueColorWithDefaultFallback(
        SrgbaTuple(r, g, b, 1.0).into(),
    ))
}
