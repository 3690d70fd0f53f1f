//! Directives a page can post to a worker.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Directive {
  /// Leave the waiting phase and activate now
  SkipWaiting,
}

impl Directive {
  /// Parse a raw message. Anything unrecognised is ignored.
  pub fn parse(raw: &str) -> Option<Self> {
    serde_json::from_str(raw).ok()
  }

  pub fn to_json(self) -> String {
    match self {
      Self::SkipWaiting => r#"{"type":"SKIP_WAITING"}"#.to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_skip_waiting() {
    assert_eq!(
      Directive::parse(r#"{"type":"SKIP_WAITING"}"#),
      Some(Directive::SkipWaiting)
    );
  }

  #[test]
  fn test_unknown_messages_are_ignored() {
    assert_eq!(Directive::parse(r#"{"type":"CLAIM"}"#), None);
    assert_eq!(Directive::parse("null"), None);
    assert_eq!(Directive::parse(""), None);
    assert_eq!(Directive::parse(r#"{"kind":"SKIP_WAITING"}"#), None);
  }

  #[test]
  fn test_wire_form_matches_serde() {
    let json = Directive::SkipWaiting.to_json();
    assert_eq!(json, serde_json::to_string(&Directive::SkipWaiting).unwrap());
  }
}
