//! Linux speech recognition using Vosk offline speech recognition.
//!
//! Requires a Vosk model to be downloaded and available. The model path
//! is resolved from, in order:
//! 1. `model_path` in the bridge configuration
//! 2. `VOSK_MODEL_PATH` environment variable
//! 3. `~/.local/share/vosk/model`
//!
//! Download models from: https://alphacephei.com/vosk/models

use std::env;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, warn};
use vosk::{DecodingState, Model, Recognizer};

use crate::auth::AuthorizationOutcome;
use crate::config::BridgeConfig;
use crate::error::{codes, RecognitionError};
use crate::speech::{AuthorizationCallback, EventSink, NativePlatform, NativeRecognizer, StopMode};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct VoskPlatform;

impl NativePlatform for VoskPlatform {
    fn name(&self) -> &'static str {
        "vosk"
    }

    fn acquire(&self, config: &BridgeConfig) -> Result<Box<dyn NativeRecognizer>, RecognitionError> {
        Ok(Box::new(SpeechRecognizerImpl::new(config)?))
    }
}

fn model_path(config: &BridgeConfig) -> Result<PathBuf, RecognitionError> {
    if let Some(path) = &config.model_path {
        return Ok(path.clone());
    }
    if let Ok(path) = env::var("VOSK_MODEL_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = env::var("HOME").map_err(|_| {
        RecognitionError::new(codes::MODEL_MISSING, "HOME environment variable not set")
    })?;
    Ok(PathBuf::from(home).join(".local/share/vosk/model"))
}

pub struct SpeechRecognizerImpl {
    model_path: PathBuf,
    report_partial_results: bool,
    stop_signal: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    // Workers of earlier cycles still winding down; joined at release
    retired: Vec<thread::JoinHandle<()>>,
}

impl SpeechRecognizerImpl {
    fn new(config: &BridgeConfig) -> Result<Self, RecognitionError> {
        let model_path = model_path(config)?;
        if !model_path.exists() {
            return Err(RecognitionError::new(
                codes::MODEL_MISSING,
                format!(
                    "Vosk model not found at {}; download one from \
                     https://alphacephei.com/vosk/models or set VOSK_MODEL_PATH",
                    model_path.display()
                ),
            ));
        }

        Ok(Self {
            model_path,
            report_partial_results: config.report_partial_results,
            stop_signal: Arc::new(AtomicBool::new(false)),
            worker: None,
            retired: Vec::new(),
        })
    }

    /// Hand the current worker over to the retired list without waiting.
    fn retire_worker(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            self.retired.push(handle);
        }
        reap_workers(&mut self.retired, false);
    }

    fn run_recognition(
        model_path: PathBuf,
        report_partial_results: bool,
        sink: &EventSink,
        stop_signal: &AtomicBool,
    ) -> Result<(), RecognitionError> {
        let model = Model::new(model_path.to_string_lossy()).ok_or_else(|| {
            RecognitionError::new(
                codes::MODEL_MISSING,
                format!("failed to load Vosk model from {}", model_path.display()),
            )
        })?;

        // Set up audio capture
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| RecognitionError::new(codes::NO_INPUT, "no input device available"))?;

        let config = device
            .default_input_config()
            .map_err(|e| RecognitionError::new(codes::NO_INPUT, e.to_string()))?;
        let sample_rate = config.sample_rate().0 as f32;
        let channels = config.channels() as usize;

        let mut recognizer = Recognizer::new(&model, sample_rate).ok_or_else(|| {
            RecognitionError::new(codes::RECOGNITION, "failed to create Vosk recognizer")
        })?;
        recognizer.set_words(true);
        recognizer.set_partial_words(report_partial_results);

        let audio_buffer: Arc<Mutex<Vec<i16>>> = Arc::new(Mutex::new(Vec::new()));
        let audio_buffer_for_callback = Arc::clone(&audio_buffer);
        let stream_sink = sink.clone();

        let stream = device
            .build_input_stream(
                &config.into(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Downmix to mono i16
                    let samples = data.chunks(channels).map(|frame| {
                        let sum: f32 = frame.iter().sum();
                        ((sum / channels as f32) * 32767.0) as i16
                    });
                    if let Ok(mut buffer) = audio_buffer_for_callback.lock() {
                        buffer.extend(samples);
                    }
                },
                move |err| {
                    stream_sink.error(RecognitionError::new(codes::AUDIO_ENGINE, err.to_string()));
                },
                None,
            )
            .map_err(|e| RecognitionError::new(codes::AUDIO_ENGINE, e.to_string()))?;

        stream
            .play()
            .map_err(|e| RecognitionError::new(codes::AUDIO_ENGINE, e.to_string()))?;
        sink.started();

        let mut last_partial = String::new();
        while !stop_signal.load(Ordering::SeqCst) {
            let samples = match audio_buffer.lock() {
                Ok(mut buffer) => std::mem::take(&mut *buffer),
                Err(_) => break,
            };

            if !samples.is_empty() {
                let state = recognizer.accept_waveform(&samples);
                if matches!(state, Ok(DecodingState::Finalized)) {
                    // Utterance boundary
                    if let Some(result) = recognizer.result().single() {
                        if !result.text.is_empty() {
                            sink.final_text(result.text);
                        }
                    }
                    last_partial.clear();
                } else if report_partial_results {
                    let partial = recognizer.partial_result().partial;
                    if !partial.is_empty() && partial != last_partial {
                        last_partial = partial.to_string();
                        sink.partial(partial);
                    }
                }
            }

            thread::sleep(POLL_INTERVAL);
        }

        drop(stream);
        if let Some(result) = recognizer.final_result().single() {
            if !result.text.is_empty() {
                sink.final_text(result.text);
            }
        }
        Ok(())
    }
}

impl NativeRecognizer for SpeechRecognizerImpl {
    fn authorization_required(&self) -> bool {
        false
    }

    fn authorization_status(&self) -> AuthorizationOutcome {
        AuthorizationOutcome::Granted
    }

    fn request_authorization(&mut self, respond: AuthorizationCallback) {
        respond(AuthorizationOutcome::Granted);
    }

    fn start(&mut self, sink: EventSink) -> Result<(), RecognitionError> {
        // A worker from a previous cycle may still be finishing; its sink
        // belongs to that cycle, so it can wind down on its own.
        self.retire_worker();

        let stop_signal = Arc::new(AtomicBool::new(false));
        self.stop_signal = Arc::clone(&stop_signal);
        let model_path = self.model_path.clone();
        let report_partial_results = self.report_partial_results;

        let handle = thread::Builder::new()
            .name("vosk-recognizer".into())
            .spawn(move || {
                let outcome =
                    Self::run_recognition(model_path, report_partial_results, &sink, &stop_signal);
                if let Err(err) = outcome {
                    sink.error(err);
                }
                if stop_signal.load(Ordering::SeqCst) {
                    sink.stopped();
                } else {
                    sink.ended();
                }
            })
            .map_err(|e| RecognitionError::new(codes::AUDIO_ENGINE, e.to_string()))?;

        self.worker = Some(handle);
        debug!(model = %self.model_path.display(), "vosk worker started");
        Ok(())
    }

    fn stop(&mut self) -> StopMode {
        self.stop_signal.store(true, Ordering::SeqCst);
        if self.worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            StopMode::Deferred
        } else {
            StopMode::Completed
        }
    }

    fn release(&mut self) -> Result<(), RecognitionError> {
        self.retire_worker();
        reap_workers(&mut self.retired, true);
        Ok(())
    }
}

/// Join finished workers, or all of them when `wait` is set.
fn reap_workers(workers: &mut Vec<thread::JoinHandle<()>>, wait: bool) {
    let mut still_running = Vec::new();
    for handle in workers.drain(..) {
        if !wait && !handle.is_finished() {
            still_running.push(handle);
            continue;
        }
        if handle.join().is_err() {
            warn!("vosk worker thread panicked");
        }
    }
    *workers = still_running;
}
