//! Windows speech recognition using the native Windows.Media.SpeechRecognition API.

use tracing::{debug, warn};
use windows::{
    core::HSTRING,
    Foundation::{EventRegistrationToken, TypedEventHandler},
    Globalization::Language,
    Media::SpeechRecognition::{
        SpeechContinuousRecognitionCompletedEventArgs,
        SpeechContinuousRecognitionResultGeneratedEventArgs, SpeechContinuousRecognitionSession,
        SpeechRecognitionHypothesisGeneratedEventArgs, SpeechRecognitionResultStatus,
        SpeechRecognizer as WinSpeechRecognizer, SpeechRecognizerState,
    },
};

use crate::auth::AuthorizationOutcome;
use crate::config::BridgeConfig;
use crate::error::{codes, RecognitionError};
use crate::speech::{AuthorizationCallback, EventSink, NativePlatform, NativeRecognizer, StopMode};

pub struct WindowsSpeechPlatform;

impl NativePlatform for WindowsSpeechPlatform {
    fn name(&self) -> &'static str {
        "windows-speech"
    }

    fn acquire(&self, config: &BridgeConfig) -> Result<Box<dyn NativeRecognizer>, RecognitionError> {
        Ok(Box::new(SpeechRecognizerImpl::new(config)?))
    }
}

fn native_error(code: i64, context: &str, err: windows::core::Error) -> RecognitionError {
    RecognitionError::new(code, format!("{context}: {err}"))
}

struct Registrations {
    session: SpeechContinuousRecognitionSession,
    hypothesis: Option<EventRegistrationToken>,
    result: EventRegistrationToken,
    completed: EventRegistrationToken,
}

pub struct SpeechRecognizerImpl {
    recognizer: WinSpeechRecognizer,
    report_partial_results: bool,
    registrations: Option<Registrations>,
}

impl SpeechRecognizerImpl {
    fn new(config: &BridgeConfig) -> Result<Self, RecognitionError> {
        let language = Language::CreateLanguage(&HSTRING::from(config.locale.as_str()))
            .map_err(|e| native_error(codes::ACQUIRE_FAILED, "failed to create language", e))?;
        let recognizer = WinSpeechRecognizer::Create(&language)
            .map_err(|e| native_error(codes::ACQUIRE_FAILED, "failed to create speech recognizer", e))?;

        // Compile the default dictation grammar
        recognizer
            .CompileConstraintsAsync()
            .and_then(|op| op.get())
            .map_err(|e| native_error(codes::ACQUIRE_FAILED, "failed to compile grammar", e))?;

        Ok(Self {
            recognizer,
            report_partial_results: config.report_partial_results,
            registrations: None,
        })
    }

    fn unregister(&mut self) {
        let Some(registrations) = self.registrations.take() else {
            return;
        };
        if let Some(token) = registrations.hypothesis {
            let _ = self.recognizer.RemoveHypothesisGenerated(token);
        }
        let _ = registrations.session.RemoveResultGenerated(registrations.result);
        let _ = registrations.session.RemoveCompleted(registrations.completed);
    }

    /// A continuous session is running (capturing or still processing).
    fn session_active(&self) -> bool {
        self.registrations.is_some()
            && matches!(self.recognizer.State(), Ok(state) if state != SpeechRecognizerState::Idle)
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
        // Microphone consent is handled by the OS on first capture.
        respond(AuthorizationOutcome::Granted);
    }

    fn start(&mut self, sink: EventSink) -> Result<(), RecognitionError> {
        self.unregister();

        let session = self
            .recognizer
            .ContinuousRecognitionSession()
            .map_err(|e| native_error(codes::REQUEST_FAILED, "failed to get recognition session", e))?;

        // Intermediate hypotheses become partial results
        let hypothesis = if self.report_partial_results {
            let hypothesis_sink = sink.clone();
            let handler = TypedEventHandler::new(
                move |_sender: &Option<WinSpeechRecognizer>,
                      args: &Option<SpeechRecognitionHypothesisGeneratedEventArgs>| {
                    if let Some(args) = args {
                        let text = args.Hypothesis()?.Text()?.to_string();
                        if !text.is_empty() {
                            hypothesis_sink.partial(text);
                        }
                    }
                    Ok(())
                },
            );
            let token = self
                .recognizer
                .HypothesisGenerated(&handler)
                .map_err(|e| native_error(codes::REQUEST_FAILED, "failed to register hypothesis handler", e))?;
            Some(token)
        } else {
            None
        };

        // Generated results are settled utterances
        let result_sink = sink.clone();
        let result_handler = TypedEventHandler::new(
            move |_sender: &Option<SpeechContinuousRecognitionSession>,
                  args: &Option<SpeechContinuousRecognitionResultGeneratedEventArgs>| {
                if let Some(args) = args {
                    let text = args.Result()?.Text()?.to_string();
                    if !text.is_empty() {
                        result_sink.final_text(text);
                    }
                }
                Ok(())
            },
        );
        let result = session
            .ResultGenerated(&result_handler)
            .map_err(|e| native_error(codes::REQUEST_FAILED, "failed to register result handler", e))?;

        let completed_sink = sink.clone();
        let completed_handler = TypedEventHandler::new(
            move |_sender: &Option<SpeechContinuousRecognitionSession>,
                  args: &Option<SpeechContinuousRecognitionCompletedEventArgs>| {
                if let Some(args) = args {
                    let status = args.Status()?;
                    if status != SpeechRecognitionResultStatus::Success
                        && status != SpeechRecognitionResultStatus::UserCanceled
                    {
                        completed_sink.error(RecognitionError::new(
                            codes::RECOGNITION,
                            format!("recognition session completed with status {}", status.0),
                        ));
                    }
                }
                completed_sink.ended();
                Ok(())
            },
        );
        let completed = session
            .Completed(&completed_handler)
            .map_err(|e| native_error(codes::REQUEST_FAILED, "failed to register completion handler", e))?;

        self.registrations = Some(Registrations {
            session: session.clone(),
            hypothesis,
            result,
            completed,
        });

        // Start continuous recognition
        if let Err(e) = session.StartAsync().and_then(|op| op.get()) {
            self.unregister();
            return Err(native_error(codes::AUDIO_ENGINE, "failed to start recognition session", e));
        }

        sink.started();
        debug!("windows recognition session started");
        Ok(())
    }

    fn stop(&mut self) -> StopMode {
        if self.session_active() {
            // StopAsync lets pending audio finish; the Completed handler
            // confirms with ended(). Handlers stay registered until then.
            let stopping = self
                .recognizer
                .ContinuousRecognitionSession()
                .and_then(|session| session.StopAsync());
            match stopping {
                Ok(_) => return StopMode::Deferred,
                Err(e) => warn!("failed to stop recognition session: {}", e),
            }
        }
        self.unregister();
        StopMode::Completed
    }

    fn release(&mut self) -> Result<(), RecognitionError> {
        if self.session_active() {
            if let Err(e) = self
                .recognizer
                .ContinuousRecognitionSession()
                .and_then(|session| session.CancelAsync())
            {
                warn!("failed to cancel recognition session: {}", e);
            }
        }
        self.unregister();
        self.recognizer
            .Close()
            .map_err(|e| native_error(codes::RECOGNITION, "failed to close recognizer", e))
    }
}
