//! Typed payloads for each entity kind.
//!
//! A [`Payload`] is a closed sum over the six kinds the engine stores. Each
//! variant carries a concrete struct with its own validation rules, checked at
//! the store boundary before any tier is written.

use crate::{error::Result, EntityKind, Error, Timestamp};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Lowest ease factor the SM-2 scheduler allows.
pub const MIN_EASE_FACTOR: f64 = 1.3;

/// Starting ease factor for a new card.
pub const DEFAULT_EASE_FACTOR: f64 = 2.5;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Learner profile and preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub display_name: String,
    /// Language the learner already speaks (BCP-47 style code)
    pub native_language: String,
    /// Language being learned
    pub target_language: String,
    pub daily_goal_minutes: u32,
    pub streak_days: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_date: Option<NaiveDate>,
}

impl UserProfile {
    pub fn new(
        display_name: impl Into<String>,
        native_language: impl Into<String>,
        target_language: impl Into<String>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            native_language: native_language.into(),
            target_language: target_language.into(),
            daily_goal_minutes: 10,
            streak_days: 0,
            last_active_date: None,
        }
    }
}

/// Progress through a language course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningProgress {
    pub language: String,
    pub level: u32,
    pub xp: u64,
    pub lessons_completed: u32,
    /// Share of correct answers, 0.0 to 1.0
    pub accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_lesson_id: Option<String>,
}

impl LearningProgress {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            level: 1,
            xp: 0,
            lessons_completed: 0,
            accuracy: 0.0,
            current_lesson_id: None,
        }
    }
}

/// A spaced-repetition flashcard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SrsItem {
    pub term: String,
    pub translation: String,
    pub language: String,
    pub ease_factor: f64,
    pub interval_days: u32,
    pub repetitions: u32,
    pub lapses: u32,
    /// When the card is next due for review
    pub due_at: Timestamp,
}

impl SrsItem {
    pub fn new(
        term: impl Into<String>,
        translation: impl Into<String>,
        language: impl Into<String>,
        due_at: Timestamp,
    ) -> Self {
        Self {
            term: term.into(),
            translation: translation.into(),
            language: language.into(),
            ease_factor: DEFAULT_EASE_FACTOR,
            interval_days: 0,
            repetitions: 0,
            lapses: 0,
            due_at,
        }
    }
}

/// Study totals for one calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsDay {
    pub date: NaiveDate,
    pub minutes_studied: u32,
    pub words_learned: u32,
    pub sessions: u32,
    pub xp_earned: u64,
}

impl AnalyticsDay {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            minutes_studied: 0,
            words_learned: 0,
            sessions: 0,
            xp_earned: 0,
        }
    }
}

/// A time-boxed goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub title: String,
    pub goal: u32,
    pub current: u32,
    pub expires_at: Timestamp,
    pub completed: bool,
}

impl Challenge {
    pub fn new(title: impl Into<String>, goal: u32, expires_at: Timestamp) -> Self {
        Self {
            title: title.into(),
            goal,
            current: 0,
            expires_at,
            completed: false,
        }
    }
}

/// An unlockable badge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
    pub code: String,
    pub title: String,
    /// Percent complete, 0 to 100
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlocked_at: Option<Timestamp>,
}

impl Achievement {
    pub fn new(code: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            title: title.into(),
            progress: 0,
            unlocked_at: None,
        }
    }
}

/// Entity data, one variant per [`EntityKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    User(UserProfile),
    Progress(LearningProgress),
    SrsItem(SrsItem),
    Analytics(AnalyticsDay),
    Challenge(Challenge),
    Achievement(Achievement),
}

impl Payload {
    /// The entity kind this payload belongs to.
    pub fn kind(&self) -> EntityKind {
        match self {
            Payload::User(_) => EntityKind::User,
            Payload::Progress(_) => EntityKind::Progress,
            Payload::SrsItem(_) => EntityKind::SrsItem,
            Payload::Analytics(_) => EntityKind::Analytics,
            Payload::Challenge(_) => EntityKind::Challenge,
            Payload::Achievement(_) => EntityKind::Achievement,
        }
    }

    /// Decode the untagged JSON body of a payload of the given kind.
    pub fn from_json(kind: EntityKind, value: serde_json::Value) -> Result<Self> {
        let payload = match kind {
            EntityKind::User => Payload::User(serde_json::from_value(value)?),
            EntityKind::Progress => Payload::Progress(serde_json::from_value(value)?),
            EntityKind::SrsItem => Payload::SrsItem(serde_json::from_value(value)?),
            EntityKind::Analytics => Payload::Analytics(serde_json::from_value(value)?),
            EntityKind::Challenge => Payload::Challenge(serde_json::from_value(value)?),
            EntityKind::Achievement => Payload::Achievement(serde_json::from_value(value)?),
        };
        Ok(payload)
    }

    /// Validate the payload against its kind's rules.
    pub fn validate(&self) -> Result<()> {
        let kind = self.kind();
        let invalid = |reason: String| Error::InvalidPayload { kind, reason };

        match self {
            Payload::User(user) => {
                require_text("displayName", &user.display_name).map_err(invalid)?;
                require_language("nativeLanguage", &user.native_language).map_err(invalid)?;
                require_language("targetLanguage", &user.target_language).map_err(invalid)?;
                if user.daily_goal_minutes == 0 || user.daily_goal_minutes > MINUTES_PER_DAY {
                    return Err(invalid(format!(
                        "dailyGoalMinutes must be between 1 and {MINUTES_PER_DAY}"
                    )));
                }
            }
            Payload::Progress(progress) => {
                require_language("language", &progress.language).map_err(invalid)?;
                if progress.level == 0 {
                    return Err(invalid("level starts at 1".into()));
                }
                if !(0.0..=1.0).contains(&progress.accuracy) {
                    return Err(invalid("accuracy must be within 0.0 and 1.0".into()));
                }
            }
            Payload::SrsItem(item) => {
                require_text("term", &item.term).map_err(invalid)?;
                require_text("translation", &item.translation).map_err(invalid)?;
                require_language("language", &item.language).map_err(invalid)?;
                if !item.ease_factor.is_finite() || item.ease_factor < MIN_EASE_FACTOR {
                    return Err(invalid(format!(
                        "easeFactor must be at least {MIN_EASE_FACTOR}"
                    )));
                }
            }
            Payload::Analytics(day) => {
                if day.minutes_studied > MINUTES_PER_DAY {
                    return Err(invalid(format!(
                        "minutesStudied exceeds {MINUTES_PER_DAY} on {}",
                        day.date
                    )));
                }
            }
            Payload::Challenge(challenge) => {
                require_text("title", &challenge.title).map_err(invalid)?;
                if challenge.goal == 0 {
                    return Err(invalid("goal must be positive".into()));
                }
                if challenge.completed && challenge.current < challenge.goal {
                    return Err(invalid("completed challenge has not reached its goal".into()));
                }
            }
            Payload::Achievement(achievement) => {
                require_text("code", &achievement.code).map_err(invalid)?;
                if achievement.progress > 100 {
                    return Err(invalid("progress is a percentage".into()));
                }
                if achievement.unlocked_at.is_some() && achievement.progress != 100 {
                    return Err(invalid("unlocked achievement must be at 100%".into()));
                }
            }
        }

        Ok(())
    }
}

fn require_text(field: &str, value: &str) -> std::result::Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{field} must not be empty"))
    } else {
        Ok(())
    }
}

fn require_language(field: &str, value: &str) -> std::result::Result<(), String> {
    let valid = (2..=8).contains(&value.len())
        && value.chars().all(|c| c.is_ascii_alphabetic() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(format!("{field} is not a language code: {value:?}"))
    }
}
