// Notification templates keyed by template id and identity state
//
// The table file maps each template id to texts per state key:
//
// {
//   "validation.ready.1-day": { "default": "...", "newbie": "...", "newbie-1": "..." }
// }

use crate::errors::TemplateError;
use crate::models::{Identity, IdentityState};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Identity state selector inside one template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKey {
    Default,
    Invite,
    Candidate,
    Newbie(Option<u32>),
    Verified(Option<u32>),
    Human(Option<u32>),
}

impl StateKey {
    pub fn parse(key: &str) -> Option<Self> {
        let (base, age) = match key.split_once('-') {
            Some((base, age)) => (base, Some(age.parse::<u32>().ok()?)),
            None => (key, None),
        };
        match (base, age) {
            ("default", None) => Some(StateKey::Default),
            ("invite", None) => Some(StateKey::Invite),
            ("candidate", None) => Some(StateKey::Candidate),
            ("newbie", age) => Some(StateKey::Newbie(age)),
            ("verified", age) => Some(StateKey::Verified(age)),
            ("human", age) => Some(StateKey::Human(age)),
            _ => None,
        }
    }

    /// Keys to try for an identity, most specific first
    fn candidates(identity: &Identity) -> Vec<StateKey> {
        let age = Some(identity.age);
        match identity.state {
            IdentityState::Undefined => vec![StateKey::Default],
            IdentityState::Invite => vec![StateKey::Invite],
            IdentityState::Candidate | IdentityState::Suspended | IdentityState::Zombie => {
                vec![StateKey::Candidate]
            }
            IdentityState::Newbie => vec![StateKey::Newbie(age), StateKey::Newbie(None)],
            IdentityState::Verified => vec![StateKey::Verified(age), StateKey::Verified(None)],
            IdentityState::Human => vec![StateKey::Human(age), StateKey::Human(None)],
        }
    }
}

/// Loaded template table
#[derive(Debug, Clone, Default)]
pub struct TemplateTable {
    templates: HashMap<String, HashMap<StateKey, String>>,
}

impl TemplateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| TemplateError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let table = Self::from_json_str(&content)?;
        tracing::info!(
            path = %path.display(),
            templates = table.templates.len(),
            "Notification templates loaded"
        );
        Ok(table)
    }

    pub fn from_json_str(content: &str) -> Result<Self, TemplateError> {
        let raw: BTreeMap<String, BTreeMap<String, String>> =
            serde_json::from_str(content).map_err(|e| TemplateError::InvalidJson(e.to_string()))?;

        let mut table = Self::new();
        for (template_id, texts) in raw {
            for (key, text) in texts {
                table.insert(&template_id, &key, text)?;
            }
        }
        Ok(table)
    }

    /// Add one text, rejecting unknown state keys
    pub fn insert(
        &mut self,
        template_id: &str,
        state_key: &str,
        text: impl Into<String>,
    ) -> Result<(), TemplateError> {
        let key = StateKey::parse(state_key).ok_or_else(|| TemplateError::UnknownStateKey {
            template: template_id.to_string(),
            key: state_key.to_string(),
        })?;
        self.templates
            .entry(template_id.to_string())
            .or_default()
            .insert(key, text.into());
        Ok(())
    }

    /// Builder-style [`insert`](Self::insert) for fixtures
    pub fn with(mut self, template_id: &str, state_key: &str, text: &str) -> Self {
        if let Err(e) = self.insert(template_id, state_key, text) {
            tracing::warn!(error = %e, "Ignoring template entry");
        }
        self
    }

    /// Fail when a required template is absent or has no text at all
    pub fn validate<S: AsRef<str>>(&self, required: &[S]) -> Result<(), TemplateError> {
        let missing: Vec<String> = required
            .iter()
            .map(|id| -> &str { id.as_ref() })
            .filter(|id| {
                self.templates
                    .get(*id)
                    .map_or(true, |texts| texts.values().all(|t| t.trim().is_empty()))
            })
            .map(str::to_string)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(TemplateError::Missing(missing))
        }
    }

    /// Text for an identity, `None` when the template has nothing for its state
    pub fn lookup(&self, template_id: &str, identity: &Identity) -> Option<&str> {
        let texts = self.templates.get(template_id)?;
        StateKey::candidates(identity)
            .into_iter()
            .find_map(|key| texts.get(&key))
            .map(String::as_str)
            .filter(|text| !text.is_empty())
    }
}

/// Substitute `{name}` placeholders
pub fn fill(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |text, (name, value)| {
        text.replace(&format!("{{{}}}", name), value)
    })
}

/// Escape text for Telegram MarkdownV2
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '_' | '*'
                | '['
                | ']'
                | '('
                | ')'
                | '~'
                | '`'
                | '>'
                | '#'
                | '+'
                | '-'
                | '='
                | '|'
                | '{'
                | '}'
                | '.'
                | '!'
                | '\\'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Google Calendar link for a 30 minute ceremony slot
pub fn calendar_link(next_validation: DateTime<Utc>) -> String {
    const FORMAT: &str = "%Y%m%dT%H%M%SZ";
    let end = next_validation + Duration::minutes(30);
    format!(
        "https://calendar.google.com/calendar/render?action=TEMPLATE&dates={}%2F{}\
         &details=Plan%20your%20time%20in%20advance%20to%20take%20part%20in%20the%20validation%20ceremony%21\
         &text=Idena%20Validation%20Ceremony",
        next_validation.format(FORMAT),
        end.format(FORMAT)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(state: IdentityState, age: u32) -> Identity {
        Identity {
            state,
            age,
            ..Default::default()
        }
    }

    fn table() -> TemplateTable {
        TemplateTable::from_json_str(
            r#"{
                "extra-flip": {
                    "default": "hello",
                    "candidate": "candidate text",
                    "newbie": "newbie text",
                    "newbie-2": "second epoch newbie"
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_state_key_parse() {
        assert_eq!(StateKey::parse("default"), Some(StateKey::Default));
        assert_eq!(StateKey::parse("human-5"), Some(StateKey::Human(Some(5))));
        assert_eq!(StateKey::parse("verified"), Some(StateKey::Verified(None)));
        assert_eq!(StateKey::parse("invite-3"), None);
        assert_eq!(StateKey::parse("newbie-x"), None);
        assert_eq!(StateKey::parse("killed"), None);
    }

    #[test]
    fn test_lookup_by_state() {
        let table = table();
        assert_eq!(
            table.lookup("extra-flip", &identity(IdentityState::Undefined, 0)),
            Some("hello")
        );
        for state in [
            IdentityState::Candidate,
            IdentityState::Suspended,
            IdentityState::Zombie,
        ] {
            assert_eq!(
                table.lookup("extra-flip", &identity(state, 0)),
                Some("candidate text")
            );
        }
        assert_eq!(table.lookup("extra-flip", &identity(IdentityState::Invite, 0)), None);
    }

    #[test]
    fn test_lookup_prefers_age_specific_key() {
        let table = table();
        assert_eq!(
            table.lookup("extra-flip", &identity(IdentityState::Newbie, 2)),
            Some("second epoch newbie")
        );
        assert_eq!(
            table.lookup("extra-flip", &identity(IdentityState::Newbie, 1)),
            Some("newbie text")
        );
    }

    #[test]
    fn test_unknown_state_key_rejected() {
        let result = TemplateTable::from_json_str(r#"{"x": {"killed": "text"}}"#);
        assert!(matches!(result, Err(TemplateError::UnknownStateKey { .. })));
    }

    #[test]
    fn test_validate_reports_missing_and_empty() {
        let table = table().with("empty", "default", "  ");
        let err = table
            .validate(&["extra-flip", "empty", "validation.ready.now"])
            .unwrap_err();
        match err {
            TemplateError::Missing(ids) => {
                assert_eq!(ids, vec!["empty".to_string(), "validation.ready.now".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(table.validate(&["extra-flip"]).is_ok());
    }

    #[test]
    fn test_fill_placeholders() {
        let text = fill(
            "Committee of {commitee-size}, pool {prize-pool}, again {prize-pool}",
            &[("commitee-size", "100"), ("prize-pool", "5")],
        );
        assert_eq!(text, "Committee of 100, pool 5, again 5");
    }

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("0xab-cd.e!"), "0xab\\-cd\\.e\\!");
        assert_eq!(escape_markdown("plain"), "plain");
    }

    #[test]
    fn test_calendar_link() {
        let nv = DateTime::parse_from_rfc3339("2024-01-10T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let link = calendar_link(nv);
        assert!(link.contains("dates=20240110T120000Z%2F20240110T123000Z"));
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"accept-invite": {{"invite": "Activate it"}}}}"#).unwrap();

        let table = TemplateTable::load(file.path()).unwrap();
        assert_eq!(
            table.lookup("accept-invite", &identity(IdentityState::Invite, 0)),
            Some("Activate it")
        );

        let missing = TemplateTable::load(file.path().with_extension("absent"));
        assert!(matches!(missing, Err(TemplateError::Io { .. })));
    }
}
