use super::fields;
use super::{Normalized, RecordDetector};
use crate::types::Role;
use serde_json::{Map, Value};

/// Free-form records without any role discriminator.
///
/// `prompt` is the user's turn, `completion` the assistant's; bare `text` or
/// `content` is treated as system output.
pub struct LegacyTextDetector;

const LEGACY_KEYS: &[(&str, Role)] = &[
    ("prompt", Role::User),
    ("completion", Role::Assistant),
    ("text", Role::System),
    ("content", Role::System),
];

impl RecordDetector for LegacyTextDetector {
    fn name(&self) -> &'static str {
        "legacy_text"
    }

    fn matches(&self, record: &Map<String, Value>) -> bool {
        !fields::has_discriminator(record)
            && LEGACY_KEYS.iter().any(|(k, _)| record.contains_key(*k))
    }

    fn normalize(&self, record: &Map<String, Value>) -> Result<Normalized, String> {
        let (key, role) = LEGACY_KEYS
            .iter()
            .find(|(k, _)| record.contains_key(*k))
            .ok_or("no legacy text field")?;
        Ok(Normalized::Message(fields::message_parts(
            *role,
            record.get(*key),
            record.get("usage"),
            record,
        )))
    }
}
