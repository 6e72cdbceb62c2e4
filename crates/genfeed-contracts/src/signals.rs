use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::patch::ImagePatch;
use crate::requests::ImageStatus;

/// Out-of-band status push for a single image, keyed by content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEvent {
    pub status: ImageStatus,
    pub image_hash: String,
}

impl SignalEvent {
    pub fn new(status: ImageStatus, image_hash: impl Into<String>) -> Self {
        Self {
            status,
            image_hash: image_hash.into(),
        }
    }

    pub fn to_patch(&self) -> ImagePatch {
        ImagePatch::from_signal(self.image_hash.clone(), self.status)
    }
}

/// Parses one line of a signal stream. Blank lines yield `None`.
pub fn parse_signal_line(line: &str) -> anyhow::Result<Option<SignalEvent>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let event: SignalEvent = serde_json::from_str(trimmed)
        .with_context(|| format!("invalid signal payload: {}", truncate(trimmed, 120)))?;
    if event.image_hash.trim().is_empty() {
        anyhow::bail!("signal payload has an empty imageHash");
    }
    Ok(Some(event))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use crate::requests::ImageStatus;

    use super::{parse_signal_line, SignalEvent};

    #[test]
    fn parses_camel_case_signal() -> anyhow::Result<()> {
        let event = parse_signal_line(r#"{"status":"Success","imageHash":"a"}"#)?;
        assert_eq!(event, Some(SignalEvent::new(ImageStatus::Success, "a")));
        Ok(())
    }

    #[test]
    fn blank_lines_are_skipped() -> anyhow::Result<()> {
        assert_eq!(parse_signal_line("   \n")?, None);
        Ok(())
    }

    #[test]
    fn rejects_unknown_status_and_empty_hash() {
        assert!(parse_signal_line(r#"{"status":"Done","imageHash":"a"}"#).is_err());
        assert!(parse_signal_line(r#"{"status":"Success","imageHash":" "}"#).is_err());
    }

    #[test]
    fn signal_patch_carries_availability() {
        let patch = SignalEvent::new(ImageStatus::Success, "h").to_patch();
        assert_eq!(patch.hash, "h");
        assert_eq!(patch.status, Some(ImageStatus::Success));
        assert_eq!(patch.available, Some(true));
        assert_eq!(patch.removed_for_safety, None);
    }
}
