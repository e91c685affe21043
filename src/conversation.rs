//! Top-level conversation controller: owns the configuration, the
//! selected persona language, and at most one session at a time.

use crate::audio::{CpalDeviceFactory, DeviceFactory};
use crate::config::Config;
use crate::error::{Result, VoxliveError};
use crate::session::{Session, SessionHandle, SessionState};
use crate::transcript::TranscriptItem;
use crate::transport::{RemoteConnector, SetupConfig, WsConnector};
use std::sync::Arc;

/// One push-to-talk style conversation: `toggle` starts a session when
/// idle and stops the running one otherwise. The transcript of the last
/// session stays readable after it ends, until the next one starts.
pub struct Conversation {
    config: Config,
    language: String,
    connector: Arc<dyn RemoteConnector>,
    devices: Arc<dyn DeviceFactory>,
    session: Option<SessionHandle>,
}

impl Conversation {
    /// Controller wired to the real websocket service and audio devices.
    ///
    /// Quiets the audio backends' startup chatter before any device is
    /// probed; construct the controller before spawning other threads.
    pub fn new(config: Config) -> Self {
        crate::audio::suppress_audio_warnings();
        let connector = Arc::new(WsConnector::new(config.session.endpoint.clone()));
        let devices = Arc::new(CpalDeviceFactory {
            input_device: config.audio.input_device.clone(),
            output_device: config.audio.output_device.clone(),
        });
        Self::with_parts(config, connector, devices)
    }

    /// Controller with caller-supplied connector and devices (tests).
    pub fn with_parts(
        config: Config,
        connector: Arc<dyn RemoteConnector>,
        devices: Arc<dyn DeviceFactory>,
    ) -> Self {
        let language = config.session.language.clone();
        Self {
            config,
            language,
            connector,
            devices,
            session: None,
        }
    }

    /// Start a session if none is active, stop the active one otherwise.
    ///
    /// # Errors
    /// Fails only when the selected language has no persona; session
    /// start failures surface through the session's own state and
    /// transcript instead.
    pub fn toggle(&mut self) -> Result<()> {
        if let Some(session) = &mut self.session
            && session.is_active()
        {
            session.stop();
            return Ok(());
        }

        let instruction = self.config.resolve_persona(&self.language)?;
        let setup = SetupConfig::new(instruction, self.config.session.voice.clone());
        let handle = Session::new(setup).start(self.connector.as_ref(), self.devices.as_ref());
        self.session = Some(handle);
        Ok(())
    }

    /// Switch the persona language. Only allowed between sessions.
    pub fn select_language(&mut self, key: &str) -> Result<()> {
        if self.session.as_ref().is_some_and(|s| s.is_active()) {
            return Err(VoxliveError::Other(
                "cannot change language during an active session".to_string(),
            ));
        }
        // Validate before committing.
        self.config.resolve_persona(key)?;
        self.language = key.to_string();
        Ok(())
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Status label for the current (or most recent) session.
    pub fn status(&self) -> &'static str {
        match &self.session {
            Some(session) => session.status(),
            None => SessionState::Idle.status_label(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_active())
    }

    /// Finalized transcript of the current (or most recent) session.
    pub fn transcript(&self) -> Vec<TranscriptItem> {
        self.session
            .as_ref()
            .map(|s| s.transcript())
            .unwrap_or_default()
    }

    /// In-flight user and agent text of the current session.
    pub fn interim(&self) -> (String, String) {
        self.session
            .as_ref()
            .map(|s| s.interim())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MockDeviceFactory;
    use crate::transport::ScriptedConnector;
    use std::thread;
    use std::time::{Duration, Instant};

    fn test_conversation(connector: ScriptedConnector) -> Conversation {
        Conversation::with_parts(
            Config::default(),
            Arc::new(connector),
            Arc::new(MockDeviceFactory::new()),
        )
    }

    fn wait_until(deadline_ms: u64, mut predicate: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        predicate()
    }

    #[test]
    fn starts_idle() {
        let conversation = test_conversation(ScriptedConnector::new());
        assert_eq!(conversation.status(), "Idle");
        assert!(!conversation.is_active());
        assert!(conversation.transcript().is_empty());
    }

    #[test]
    fn toggle_starts_then_stops_a_session() {
        let mut conversation = test_conversation(ScriptedConnector::new());

        conversation.toggle().unwrap();
        assert!(wait_until(2000, || conversation.status() == "Connected"));

        conversation.toggle().unwrap();
        assert_eq!(conversation.status(), "Disconnected");
        assert!(!conversation.is_active());
        // Transcript survives the session.
        assert!(!conversation.transcript().is_empty());
    }

    #[test]
    fn toggle_after_close_starts_a_fresh_session() {
        let mut conversation = test_conversation(ScriptedConnector::new());

        conversation.toggle().unwrap();
        assert!(wait_until(2000, || conversation.is_active()));
        conversation.toggle().unwrap();
        let old_len = conversation.transcript().len();
        assert!(old_len >= 2);

        conversation.toggle().unwrap();
        assert!(wait_until(2000, || conversation.status() == "Connected"));
        // New session's transcript replaced the old one.
        assert_eq!(conversation.transcript().len(), 1);
        conversation.toggle().unwrap();
    }

    #[test]
    fn language_change_rejected_while_active() {
        let mut conversation = test_conversation(ScriptedConnector::new());
        conversation.toggle().unwrap();
        assert!(wait_until(2000, || conversation.is_active()));

        let err = conversation.select_language("es").unwrap_err();
        assert!(err.to_string().contains("active session"));
        assert_eq!(conversation.language(), "en");

        conversation.toggle().unwrap();
        conversation.select_language("es").unwrap();
        assert_eq!(conversation.language(), "es");
    }

    #[test]
    fn unknown_language_is_rejected() {
        let mut conversation = test_conversation(ScriptedConnector::new());
        assert!(conversation.select_language("tlh").is_err());
        assert_eq!(conversation.language(), "en");
    }

    #[test]
    fn toggle_with_unknown_language_fails_without_session() {
        let mut conversation = test_conversation(ScriptedConnector::new());
        conversation.language = "tlh".to_string();
        assert!(conversation.toggle().is_err());
        assert_eq!(conversation.status(), "Idle");
    }
}
