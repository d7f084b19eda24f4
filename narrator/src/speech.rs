use async_trait::async_trait;
use scene_narrator_common::config::SpeechConfig;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

const MAX_SPOKEN_CHARS: usize = 2000;

/// Where descriptions go once they come back from the model.
#[async_trait]
pub trait NarrationSink: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver `text`. Failures are handled inside the sink.
    async fn narrate(&self, text: &str);
}

#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("nothing to say")]
    EmptyText,
}

/// Speaks through a command-line synthesizer (`espeak-ng`, `say`, ...) and
/// waits for playback to finish.
pub struct SpeechCommand {
    program: String,
    voice: Option<String>,
    rate: Option<u32>,
}

impl SpeechCommand {
    pub fn new(program: String, voice: Option<String>, rate: Option<u32>) -> Self {
        Self {
            program,
            voice,
            rate,
        }
    }

    /// macOS `say` spells the rate flag differently from espeak.
    fn is_say(&self) -> bool {
        Path::new(&self.program)
            .file_name()
            .is_some_and(|name| name == "say")
    }

    fn args(&self, text: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(voice) = &self.voice {
            args.push("-v".to_string());
            args.push(voice.clone());
        }
        if let Some(rate) = self.rate {
            args.push(if self.is_say() { "-r" } else { "-s" }.to_string());
            args.push(rate.to_string());
        }
        args.push(text.to_string());
        args
    }

    pub async fn speak(&self, text: &str) -> Result<(), SpeechError> {
        let text = sanitize(text);
        if text.is_empty() {
            return Err(SpeechError::EmptyText);
        }

        let output = Command::new(&self.program)
            .args(self.args(&text))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SpeechError::Spawn {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SpeechError::Failed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(program = self.program, chars = text.len(), "speech finished");
        Ok(())
    }

    /// Check whether the synthesizer is on PATH. Logs a warning if not found.
    pub async fn check_available(&self) {
        match Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(_) => debug!(program = self.program, "speech synthesizer is available"),
            Err(e) => warn!(
                program = self.program,
                error = %e,
                "speech synthesizer not found on PATH; descriptions will only be logged"
            ),
        }
    }
}

#[async_trait]
impl NarrationSink for SpeechCommand {
    fn name(&self) -> &str {
        &self.program
    }

    async fn narrate(&self, text: &str) {
        info!(description = text, "narrating");
        if let Err(e) = self.speak(text).await {
            warn!(error = %e, "speech failed");
        }
    }
}

/// Writes descriptions to the log only.
pub struct LogNarrator;

#[async_trait]
impl NarrationSink for LogNarrator {
    fn name(&self) -> &str {
        "log"
    }

    async fn narrate(&self, text: &str) {
        info!(description = text, "scene description");
    }
}

/// Pick the sink described by the config.
pub async fn build_sink(config: &SpeechConfig) -> Box<dyn NarrationSink> {
    if !config.enabled {
        info!("speech disabled, descriptions will be logged");
        return Box::new(LogNarrator);
    }
    let speaker = SpeechCommand::new(config.command.clone(), config.voice.clone(), config.rate);
    speaker.check_available().await;
    Box::new(speaker)
}

/// Drop control characters, collapse whitespace and keep the text from
/// being read as a command-line flag.
fn sanitize(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_SPOKEN_CHARS)
        .collect::<String>();
    collapsed.trim_start_matches('-').trim_start().to_string()
}
