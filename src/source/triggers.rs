//! Classification of Slack messages that ask for something to be kept.

use serde::Serialize;

const KEYWORDS: &[&str] = &["save this", "important", "remember this", "@ai", "@bot"];

const PATTERNS: &[&str] = &["todo:", "note:", "reminder:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    BotMention,
    AisaveCommand,
    KeywordTrigger,
    PatternMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub details: String,
}

/// Classify a message. The first matching rule wins, in order: direct bot
/// mention, `/aisave`, keywords, then `todo:`/`note:`/`reminder:` patterns.
pub fn detect(text: &str, bot_user_id: Option<&str>) -> Option<Trigger> {
    if let Some(bot) = bot_user_id {
        if text.contains(&format!("<@{}>", bot)) {
            return Some(Trigger {
                kind: TriggerKind::BotMention,
                details: "Direct bot mention".to_string(),
            });
        }
    }

    let lower = text.to_lowercase();
    if lower.contains("/aisave") {
        return Some(Trigger {
            kind: TriggerKind::AisaveCommand,
            details: "Manual /aisave command".to_string(),
        });
    }

    let matched: Vec<&str> = KEYWORDS
        .iter()
        .copied()
        .filter(|kw| lower.contains(kw))
        .collect();
    if !matched.is_empty() {
        return Some(Trigger {
            kind: TriggerKind::KeywordTrigger,
            details: format!("Keywords: {}", matched.join(", ")),
        });
    }

    if PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(Trigger {
            kind: TriggerKind::PatternMatch,
            details: "Contains todo/note/reminder pattern".to_string(),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_mention_wins_over_keywords() {
        let t = detect("<@U999> this is important", Some("U999")).unwrap();
        assert_eq!(t.kind, TriggerKind::BotMention);
    }

    #[test]
    fn mention_of_other_user_is_not_bot_mention() {
        let t = detect("<@U123> hello", Some("U999"));
        assert!(t.is_none());
    }

    #[test]
    fn aisave_is_case_insensitive() {
        let t = detect("please /AISAVE the notes", None).unwrap();
        assert_eq!(t.kind, TriggerKind::AisaveCommand);
    }

    #[test]
    fn keywords_are_listed() {
        let t = detect("Important: Save this for later", None).unwrap();
        assert_eq!(t.kind, TriggerKind::KeywordTrigger);
        assert_eq!(t.details, "Keywords: save this, important");
    }

    #[test]
    fn patterns_match_last() {
        let t = detect("TODO: ship the release", None).unwrap();
        assert_eq!(t.kind, TriggerKind::PatternMatch);
    }

    #[test]
    fn plain_chatter_has_no_trigger() {
        assert!(detect("lunch at noon?", Some("U1")).is_none());
    }
}
