//! speech-bridge - live transcription demo
//!
//! Drives a [`RecognizerSession`] from a single runtime thread: asks for
//! permission, listens, renders partial results inline and prints the final
//! transcript to stdout.

use std::cell::RefCell;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use termwiz::caps::Capabilities;
use termwiz::input::{InputEvent, KeyCode, KeyEvent, Modifiers};
use termwiz::terminal::{new_terminal, Terminal};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use speech_bridge::speech::{self, MockPlatform, NativePlatform};
use speech_bridge::{
    registry, BridgeConfig, RecognitionEvent, RecognizerSession, RuntimeLoop, SessionState,
    SessionStatus,
};

mod render;

const FRAME: Duration = Duration::from_millis(50);
const ANIMATION_TICK: Duration = Duration::from_millis(150);

#[derive(Parser, Debug)]
#[command(name = "speech-bridge", version, about = "Live speech transcription in the terminal")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Recognition locale, e.g. en-US
    #[arg(short, long)]
    locale: Option<String>,

    /// Use the scripted mock recognizer instead of the platform one
    #[arg(long)]
    mock: bool,

    /// Only report final results
    #[arg(long)]
    no_partials: bool,

    /// Stop listening after this many seconds
    #[arg(long, value_name = "SECONDS")]
    max_seconds: Option<u64>,
}

#[derive(Default)]
struct Transcript {
    committed: String,
    live: String,
    ready: bool,
    /// The recognizer confirmed it was listening at least once this cycle
    started: bool,
    last_error: Option<String>,
    // Animation bookkeeping for the live hypothesis
    previous_len: usize,
    animation_start_index: usize,
    changed_at: Option<Instant>,
}

impl Transcript {
    fn apply(&mut self, event: RecognitionEvent) {
        match event {
            RecognitionEvent::Partial { text } => self.live = text,
            RecognitionEvent::Final { text } => {
                if !self.committed.is_empty() && !text.is_empty() {
                    self.committed.push(' ');
                }
                self.committed.push_str(&text);
                self.live.clear();
            }
        }

        let len = self.live.chars().count();
        if len != self.previous_len {
            self.animation_start_index = self.previous_len.min(len);
            self.previous_len = len;
            self.changed_at = Some(Instant::now());
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        self.ready = status == SessionStatus::Started;
        self.started |= self.ready;
    }

    /// The error that kept the cycle from ever starting, if that is how it
    /// ended.
    fn start_failure(&self) -> Option<&str> {
        if self.started {
            None
        } else {
            self.last_error.as_deref()
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn text(&self) -> String {
        match (self.committed.is_empty(), self.live.is_empty()) {
            (_, true) => self.committed.clone(),
            (true, false) => self.live.clone(),
            (false, false) => format!("{} {}", self.committed, self.live),
        }
    }
}

enum Outcome {
    Finished,
    Cancelled,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so stdout carries only the transcript
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(Some(text)) => {
            println!("{}", text);
            ExitCode::SUCCESS
        }
        // Standard Ctrl+C exit code
        Ok(None) => ExitCode::from(130),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<Option<String>> {
    let mut config = BridgeConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(locale) = cli.locale {
        config = config.with_locale(locale);
    }
    if cli.no_partials {
        config.report_partial_results = false;
    }

    let platform: Box<dyn NativePlatform> = if cli.mock {
        Box::new(MockPlatform::scripted())
    } else {
        speech::default_platform()
    };
    let registration = registry::register(platform)?;

    let runtime = RuntimeLoop::new();
    let mut session = registration
        .create_session(config, &runtime.handle())
        .context("failed to create recognizer session")?;

    let transcript = Rc::new(RefCell::new(Transcript::default()));
    {
        let transcript = Rc::clone(&transcript);
        session.on_result(move |event| transcript.borrow_mut().apply(event));
    }
    {
        let transcript = Rc::clone(&transcript);
        session.on_error(move |err| {
            warn!(code = err.code, "recognition error: {}", err.message);
            transcript.borrow_mut().last_error = Some(err.to_string());
        });
    }
    {
        let transcript = Rc::clone(&transcript);
        session.on_status(move |status| {
            debug!(%status, "session status");
            transcript.borrow_mut().set_status(status);
        });
    }

    let mut auth = session.request_authorization()?;
    let granted = loop {
        if let Some(outcome) = auth.try_outcome()? {
            break outcome;
        }
        runtime.wait(FRAME);
        session.dispatch_pending()?;
    };
    if let Err(err) = granted.require_granted() {
        session.close();
        bail!("speech recognition is not available: {}", err);
    }

    session.start()?;
    info!(locale = session.locale(), "listening");

    let caps = Capabilities::new_from_env().map_err(|e| anyhow::anyhow!("{}", e))?;
    let mut terminal = new_terminal(caps).map_err(|e| anyhow::anyhow!("{}", e))?;
    terminal.set_raw_mode().map_err(|e| anyhow::anyhow!("{}", e))?;
    render::hide_cursor(&mut terminal)?;

    let result = event_loop(&runtime, &mut session, &transcript, &mut terminal, cli.max_seconds);

    let render_lines = result.as_ref().map(|(_, lines)| *lines).unwrap_or(0);
    render::cleanup(&mut terminal, render_lines)?;
    terminal.set_cooked_mode().map_err(|e| anyhow::anyhow!("{}", e))?;

    let report = session.close();
    debug!(?report, "session torn down");

    let text = transcript.borrow().text();
    match result?.0 {
        Outcome::Finished => Ok(Some(text)),
        Outcome::Cancelled => Ok(None),
    }
}

fn event_loop(
    runtime: &RuntimeLoop,
    session: &mut RecognizerSession,
    transcript: &Rc<RefCell<Transcript>>,
    terminal: &mut impl Terminal,
    max_seconds: Option<u64>,
) -> Result<(Outcome, usize)> {
    let mut render_state = render::RenderState::default();
    let deadline = max_seconds.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut finishing = false;
    let mut restarting = false;
    let mut animation_frame = 0;
    let mut last_frame_time = Instant::now();

    loop {
        runtime.wait(FRAME);
        session.dispatch_pending()?;

        while let Some(input) = terminal
            .poll_input(Some(Duration::ZERO))
            .map_err(|e| anyhow::anyhow!("{}", e))?
        {
            let InputEvent::Key(KeyEvent { key, modifiers }) = input else {
                continue;
            };
            match key {
                KeyCode::Enter if modifiers == Modifiers::NONE => {
                    finishing = true;
                    session.stop()?;
                }
                KeyCode::Char('c') if modifiers == Modifiers::CTRL => {
                    session.stop()?;
                    return Ok((Outcome::Cancelled, render_state.rendered_lines));
                }
                KeyCode::Char('r') if modifiers == Modifiers::CTRL => {
                    restarting = true;
                    session.stop()?;
                }
                _ => {}
            }
        }

        if deadline.is_some_and(|d| Instant::now() >= d) && !finishing {
            info!("time limit reached");
            finishing = true;
            session.stop()?;
        }

        if session.state() == SessionState::Idle {
            if restarting && !finishing {
                restarting = false;
                transcript.borrow_mut().reset();
                session.start()?;
            } else {
                if let Some(err) = transcript.borrow().start_failure() {
                    bail!("speech recognition failed to start: {}", err);
                }
                // Finished on request, or the platform ended the session
                return Ok((Outcome::Finished, render_state.rendered_lines));
            }
        }

        if last_frame_time.elapsed() >= ANIMATION_TICK {
            animation_frame += 1;
            last_frame_time = Instant::now();
        }

        let t = transcript.borrow();
        let ui = render::UiState {
            session: session.state(),
            committed: &t.committed,
            live: &t.live,
            ready: t.ready,
            last_error: t.last_error.as_deref(),
            elapsed_ms: t
                .changed_at
                .map(|at| at.elapsed().as_secs_f32() * 1000.0)
                .unwrap_or(f32::MAX),
            animation_start_index: t.animation_start_index,
            animation_frame,
        };
        render::render(terminal, &mut render_state, &ui)?;
    }
}
