//! macOS speech recognition using the native Speech framework.

use std::ptr::NonNull;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use block2::RcBlock;
use objc2::rc::Retained;
use objc2::AllocAnyThread;
use objc2_avf_audio::{AVAudioEngine, AVAudioPCMBuffer, AVAudioTime};
use objc2_foundation::{NSError, NSLocale, NSOperationQueue, NSString};
use objc2_speech::{
    SFSpeechAudioBufferRecognitionRequest, SFSpeechRecognitionResult, SFSpeechRecognitionTask,
    SFSpeechRecognitionTaskState, SFSpeechRecognizer, SFSpeechRecognizerAuthorizationStatus,
};
use tracing::debug;

use crate::auth::AuthorizationOutcome;
use crate::config::BridgeConfig;
use crate::error::{codes, RecognitionError};
use crate::speech::{AuthorizationCallback, EventSink, NativePlatform, NativeRecognizer, StopMode};

// ~200ms of audio at 1024 samples per buffer before we call it started.
const WARMUP_BUFFERS: usize = 10;

pub struct MacSpeechPlatform;

impl NativePlatform for MacSpeechPlatform {
    fn name(&self) -> &'static str {
        "macos-speech"
    }

    fn acquire(&self, config: &BridgeConfig) -> Result<Box<dyn NativeRecognizer>, RecognitionError> {
        Ok(Box::new(SpeechRecognizerImpl::new(config)?))
    }
}

fn outcome_from_status(status: SFSpeechRecognizerAuthorizationStatus) -> AuthorizationOutcome {
    match status.0 {
        1 => AuthorizationOutcome::Denied,
        2 => AuthorizationOutcome::Restricted,
        3 => AuthorizationOutcome::Granted,
        _ => AuthorizationOutcome::Undetermined,
    }
}

pub struct SpeechRecognizerImpl {
    recognizer: Retained<SFSpeechRecognizer>,
    audio_engine: Retained<AVAudioEngine>,
    request: Option<Retained<SFSpeechAudioBufferRecognitionRequest>>,
    task: Option<Retained<SFSpeechRecognitionTask>>,
    report_partial_results: bool,
    // Keep blocks alive
    _tap_block: Option<RcBlock<dyn Fn(NonNull<AVAudioPCMBuffer>, NonNull<AVAudioTime>)>>,
    _handler: Option<RcBlock<dyn Fn(*mut SFSpeechRecognitionResult, *mut NSError)>>,
    _queue: Retained<NSOperationQueue>,
}

impl SpeechRecognizerImpl {
    fn new(config: &BridgeConfig) -> Result<Self, RecognitionError> {
        // Create speech recognizer for the configured locale
        let recognizer = unsafe {
            let identifier = NSString::from_str(&config.locale);
            let locale = NSLocale::initWithLocaleIdentifier(NSLocale::alloc(), &identifier);
            SFSpeechRecognizer::initWithLocale(SFSpeechRecognizer::alloc(), &locale)
        }
        .ok_or_else(|| {
            RecognitionError::new(
                codes::ACQUIRE_FAILED,
                format!("no speech recognizer for locale {}", config.locale),
            )
        })?;

        // Set a custom operation queue for callbacks (CLI apps don't have a main run loop)
        let queue = NSOperationQueue::new();
        unsafe {
            recognizer.setQueue(&queue);
        }

        let audio_engine = unsafe { AVAudioEngine::new() };

        Ok(Self {
            recognizer,
            audio_engine,
            request: None,
            task: None,
            report_partial_results: config.report_partial_results,
            _tap_block: None,
            _handler: None,
            _queue: queue,
        })
    }

    /// Stop feeding audio and ask the task to finish. The task and its result
    /// handler stay alive so the final result can still be reported.
    fn teardown_audio(&mut self) {
        unsafe {
            if self.audio_engine.isRunning() {
                self.audio_engine.stop();
            }
            let input_node = self.audio_engine.inputNode();
            input_node.removeTapOnBus(0);
        }

        if let Some(ref request) = self.request {
            unsafe {
                request.endAudio();
            }
        }

        // finish() rather than cancel() so the last result is still reported
        if let Some(ref task) = self.task {
            unsafe {
                task.finish();
            }
        }

        self.request = None;
        self._tap_block = None;
    }

    /// Cancel whatever the previous task still has in flight and drop it.
    fn discard_task(&mut self) {
        if let Some(task) = self.task.take() {
            unsafe {
                task.cancel();
            }
        }
        self._handler = None;
    }

    fn task_running(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|task| unsafe { task.state() } != SFSpeechRecognitionTaskState::Completed)
    }
}

impl NativeRecognizer for SpeechRecognizerImpl {
    fn authorization_status(&self) -> AuthorizationOutcome {
        outcome_from_status(unsafe { SFSpeechRecognizer::authorizationStatus() })
    }

    fn request_authorization(&mut self, respond: AuthorizationCallback) {
        // The platform may invoke the block more than once; answer only the first.
        let respond = Mutex::new(Some(respond));
        let handler = RcBlock::new(move |status: SFSpeechRecognizerAuthorizationStatus| {
            let respond = respond.lock().ok().and_then(|mut slot| slot.take());
            if let Some(respond) = respond {
                respond(outcome_from_status(status));
            }
        });

        unsafe {
            SFSpeechRecognizer::requestAuthorization(&handler);
        }
    }

    fn start(&mut self, sink: EventSink) -> Result<(), RecognitionError> {
        let available = unsafe { self.recognizer.isAvailable() };
        if !available {
            return Err(RecognitionError::new(
                codes::UNAVAILABLE,
                "speech recognition service is unavailable",
            ));
        }

        // A previous task must not keep feeding the new cycle
        self.discard_task();

        let request = unsafe { SFSpeechAudioBufferRecognitionRequest::new() };
        unsafe {
            request.setShouldReportPartialResults(self.report_partial_results);
        }

        let input_node = unsafe { self.audio_engine.inputNode() };
        let format = unsafe { input_node.outputFormatForBus(0) };
        if unsafe { format.channelCount() } == 0 {
            return Err(RecognitionError::new(
                codes::NO_INPUT,
                "microphone has no input; check permissions and device connection",
            ));
        }

        // Set up the recognition handler. Runs on the recognizer's queue.
        let handler_sink = sink.clone();
        let handler = RcBlock::new(
            move |result: *mut SFSpeechRecognitionResult, error: *mut NSError| {
                if !result.is_null() {
                    let result = unsafe { &*result };
                    let best_transcription = unsafe { result.bestTranscription() };
                    let formatted_string = unsafe { best_transcription.formattedString() };
                    let text = formatted_string.to_string();

                    if unsafe { result.isFinal() } {
                        handler_sink.final_text(text);
                        handler_sink.ended();
                        return;
                    }
                    handler_sink.partial(text);
                }

                if !error.is_null() {
                    let error = unsafe { &*error };
                    let message = error.localizedDescription().to_string();
                    handler_sink.error(RecognitionError::new(error.code() as i64, message));
                    handler_sink.ended();
                }
            },
        );

        // Start recognition task
        let task = unsafe {
            self.recognizer
                .recognitionTaskWithRequest_resultHandler(&request, &handler)
        };

        // Install tap on input node to capture audio
        let request_for_tap = request.clone();
        let buffer_count = Arc::new(AtomicUsize::new(0));
        let announced = Arc::new(AtomicBool::new(false));
        let tap_sink = sink;
        let tap_block = RcBlock::new(
            move |buffer: NonNull<AVAudioPCMBuffer>, _when: NonNull<AVAudioTime>| {
                // Report started once audio has been flowing for a moment
                let count = buffer_count.fetch_add(1, Ordering::SeqCst);
                if count >= WARMUP_BUFFERS && !announced.swap(true, Ordering::SeqCst) {
                    tap_sink.started();
                }
                unsafe {
                    request_for_tap.appendAudioPCMBuffer(buffer.as_ref());
                }
            },
        );

        unsafe {
            // Convert RcBlock to raw pointer for the C API
            let tap_block_ptr = &*tap_block as *const block2::Block<_> as *mut block2::Block<_>;
            input_node.installTapOnBus_bufferSize_format_block(0, 1024, Some(&format), tap_block_ptr);
        }

        self.request = Some(request);
        self.task = Some(task);
        self._tap_block = Some(tap_block);
        self._handler = Some(handler);

        // Prepare and start audio engine
        let started = unsafe {
            self.audio_engine.prepare();
            self.audio_engine.startAndReturnError()
        };
        if let Err(err) = started {
            let message = format!(
                "audio engine failed to start: {}",
                err.localizedDescription()
            );
            self.teardown_audio();
            self.discard_task();
            return Err(RecognitionError::new(codes::AUDIO_ENGINE, message));
        }

        debug!("macOS recognition task started");
        Ok(())
    }

    fn stop(&mut self) -> StopMode {
        self.teardown_audio();
        // The result handler reports the final transcription, then ended()
        if self.task_running() {
            StopMode::Deferred
        } else {
            StopMode::Completed
        }
    }

    fn release(&mut self) -> Result<(), RecognitionError> {
        self.teardown_audio();
        self.discard_task();
        Ok(())
    }
}
