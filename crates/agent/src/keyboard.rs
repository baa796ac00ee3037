//! Keyboard focus and text changes

use crate::gestures::GestureTarget;
use crate::host::Host;
use std::time::Duration;
use synctap_common::{Error, NormalizedPoint, Result};
use tracing::{debug, warn};

/// Key code typed to delete the current selection
pub const DELETE_KEY: &str = "\u{8}";

/// Tap offset used to focus a text input, away from clear buttons and centred labels
const FOCUS_POINT: NormalizedPoint = NormalizedPoint::new(0.9, 0.9);

/// Requested text change
#[derive(Debug, Clone, PartialEq)]
pub enum TextChange {
    Type(String),
    Clear,
    Replace(String),
}

/// Drives keyboard interactions on one text input
pub struct TextEditor<'a, H: Host + ?Sized> {
    host: &'a H,
    target: &'a GestureTarget,
    menu_wait: Duration,
}

impl<'a, H: Host + ?Sized> TextEditor<'a, H> {
    pub fn new(host: &'a H, target: &'a GestureTarget, menu_wait: Duration) -> Self {
        Self {
            host,
            target,
            menu_wait,
        }
    }

    pub fn apply(&self, change: &TextChange) -> Result<()> {
        if self.host.text_value(self.target.handle).is_none() {
            return Err(Error::NotTextInput {
                identifier: self.target.identifier.clone(),
            });
        }

        match change {
            TextChange::Type(text) => self.type_text(text),
            TextChange::Clear => self.clear(),
            TextChange::Replace(text) => self.replace(text),
        }
    }

    pub fn focus_keyboard(&self) -> Result<()> {
        if self.host.has_keyboard_focus(self.target.handle) {
            return Ok(());
        }

        self.host.tap(self.target.frame.point_at(FOCUS_POINT));

        if !self.host.has_keyboard_focus(self.target.handle) {
            return Err(Error::FailedToFocusKeyboard {
                identifier: self.target.identifier.clone(),
            });
        }
        Ok(())
    }

    /// Select the whole value; `false` when there was nothing to select
    pub fn select_all(&self) -> Result<bool> {
        self.focus_keyboard()?;
        self.host.tap(self.target.frame.point_at(NormalizedPoint::CENTER));

        let has_text = self
            .host
            .text_value(self.target.handle)
            .map(|value| !value.is_empty())
            .unwrap_or(false);

        if !has_text {
            return Ok(false);
        }

        let selected = self.host.tap_menu_item("Select All", self.menu_wait);
        debug!("Select All on `{}`: {}", self.target.identifier, selected);
        Ok(selected)
    }

    fn type_text(&self, text: &str) -> Result<()> {
        self.focus_keyboard()?;
        self.host.type_text(text);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.select_all()? {
            self.host.type_text(DELETE_KEY);
            return Ok(());
        }

        let remaining = self.host.text_value(self.target.handle).unwrap_or_default();
        if !remaining.is_empty() {
            warn!(
                "Select All unavailable on `{}`, {} chars left in place",
                self.target.identifier,
                remaining.chars().count()
            );
        }
        Ok(())
    }

    fn replace(&self, text: &str) -> Result<()> {
        self.host.set_pasteboard(text);
        self.select_all()?;

        if !self.host.tap_menu_item("Paste", self.menu_wait) {
            return Err(Error::FailedToPasteNewText {
                on_action: "replaceText".to_string(),
            });
        }

        // iOS asks before an app reads the pasteboard
        if self.host.tap_alert_button("Allow Paste", self.menu_wait) {
            debug!("Dismissed paste permission alert");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_host::VirtualHost;
    use serde_json::json;

    fn form() -> VirtualHost {
        VirtualHost::from_json(json!({
            "screen": [400, 800],
            "surfaces": [{
                "identifier": "root",
                "frame": [0, 0, 400, 800],
                "children": [
                    { "identifier": "name", "frame": [20, 100, 360, 44], "editable": true, "text": "Jane" },
                    { "identifier": "title", "frame": [20, 20, 360, 44], "text": "Profile" },
                    { "identifier": "notes", "frame": [20, 200, 360, 44], "editable": true, "text": "" },
                    { "identifier": "password", "frame": [20, 300, 360, 44], "editable": true, "secure": true, "text": "hunter2" }
                ]
            }]
        }))
        .unwrap()
    }

    fn editor_target(host: &VirtualHost, identifier: &str) -> GestureTarget {
        GestureTarget::new(host, host.handle_of(identifier).unwrap(), identifier)
    }

    #[test]
    fn test_type_appends() {
        let host = form();
        let target = editor_target(&host, "name");

        TextEditor::new(&host, &target, Duration::from_millis(500))
            .apply(&TextChange::Type(" Doe".to_string()))
            .unwrap();
        assert_eq!(host.text_of("name").as_deref(), Some("Jane Doe"));
    }

    #[test]
    fn test_clear_selects_all_then_deletes() {
        let host = form();
        let target = editor_target(&host, "name");

        TextEditor::new(&host, &target, Duration::from_millis(500))
            .apply(&TextChange::Clear)
            .unwrap();
        assert_eq!(host.text_of("name").as_deref(), Some(""));
    }

    #[test]
    fn test_clear_without_edit_menu_keeps_text() {
        let host = form();
        let target = editor_target(&host, "password");

        TextEditor::new(&host, &target, Duration::from_millis(500))
            .apply(&TextChange::Clear)
            .unwrap();
        assert_eq!(host.text_of("password").as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_clear_empty_field_is_noop() {
        let host = form();
        let target = editor_target(&host, "notes");

        TextEditor::new(&host, &target, Duration::from_millis(500))
            .apply(&TextChange::Clear)
            .unwrap();
        assert_eq!(host.text_of("notes").as_deref(), Some(""));
    }

    #[test]
    fn test_replace_pastes_over_selection() {
        let host = form();
        let target = editor_target(&host, "name");

        TextEditor::new(&host, &target, Duration::from_millis(500))
            .apply(&TextChange::Replace("John".to_string()))
            .unwrap();
        assert_eq!(host.text_of("name").as_deref(), Some("John"));
    }

    #[test]
    fn test_replace_empty_field() {
        let host = form();
        let target = editor_target(&host, "notes");

        TextEditor::new(&host, &target, Duration::from_millis(500))
            .apply(&TextChange::Replace("hello".to_string()))
            .unwrap();
        assert_eq!(host.text_of("notes").as_deref(), Some("hello"));
    }

    #[test]
    fn test_static_text_cannot_be_focused() {
        let host = form();
        let target = editor_target(&host, "title");

        let err = TextEditor::new(&host, &target, Duration::from_millis(500))
            .apply(&TextChange::Type("x".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::FailedToFocusKeyboard { ref identifier } if identifier == "title"));
    }
}
