use chrono::{Duration, NaiveDateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of identifier fields an event may carry.
///
/// The set is fixed and small, so it is spelled out rather than derived from
/// the row type. `column` is the only place a field name turns into SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierField {
    Cookie,
    MessageId,
    Phone,
}

impl IdentifierField {
    pub const ALL: [IdentifierField; 3] = [
        IdentifierField::Cookie,
        IdentifierField::MessageId,
        IdentifierField::Phone,
    ];

    /// The column this field maps to in both the `profiles` table and the
    /// event `identifiers` jsonb object.
    pub fn column(&self) -> &'static str {
        match self {
            IdentifierField::Cookie => "cookie",
            IdentifierField::MessageId => "message_id",
            IdentifierField::Phone => "phone",
        }
    }
}

/// An identifier triple. The empty string means the identifier is absent;
/// matching and enrichment skip empty fields. Values are case-sensitive.
///
/// Serialized as the event `identifiers` jsonb object, always carrying all
/// three keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Identifiers {
    #[serde(default)]
    pub cookie: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub phone: String,
}

impl Identifiers {
    pub fn new(cookie: &str, message_id: &str, phone: &str) -> Self {
        Self {
            cookie: cookie.to_owned(),
            message_id: message_id.to_owned(),
            phone: phone.to_owned(),
        }
    }

    pub fn get(&self, field: IdentifierField) -> &str {
        match field {
            IdentifierField::Cookie => &self.cookie,
            IdentifierField::MessageId => &self.message_id,
            IdentifierField::Phone => &self.phone,
        }
    }

    /// `(field, value)` pairs in declaration order, including empty values.
    pub fn pairs(&self) -> [(IdentifierField, &str); 3] {
        [
            (IdentifierField::Cookie, &self.cookie),
            (IdentifierField::MessageId, &self.message_id),
            (IdentifierField::Phone, &self.phone),
        ]
    }

    /// True when every field is empty. Such a triple matches nothing.
    pub fn is_empty(&self) -> bool {
        self.pairs().iter().all(|(_, value)| value.is_empty())
    }

    /// The merge rule: for each field, the lexicographically smallest
    /// non-empty value across `rows`, or empty if no row has one.
    pub fn merged_over(rows: &[Identifiers]) -> Identifiers {
        let min_non_empty = |field: IdentifierField| -> String {
            rows.iter()
                .map(|row| row.get(field))
                .filter(|value| !value.is_empty())
                .min()
                .unwrap_or("")
                .to_owned()
        };

        Identifiers {
            cookie: min_non_empty(IdentifierField::Cookie),
            message_id: min_non_empty(IdentifierField::MessageId),
            phone: min_non_empty(IdentifierField::Phone),
        }
    }
}

/// An event as handed to intake, before it has a row in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Arbitrary small-integer payload. Not a key.
    pub event_id: i16,
    /// UTC. Orders events for processing.
    pub event_timestamp: NaiveDateTime,
    pub identifiers: Identifiers,
}

impl NewEvent {
    /// A random event for load generation: unique cookie and message id, a
    /// `+1#########` phone, and a timestamp jittered up to a second forward.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            event_id: rng.gen_range(0..100),
            event_timestamp: Utc::now().naive_utc()
                + Duration::milliseconds(rng.gen_range(0..1000)),
            identifiers: Identifiers {
                cookie: Uuid::new_v4().to_string(),
                message_id: Uuid::new_v4().to_string(),
                phone: format!("+1{:09}", rng.gen_range(0..1_000_000_000)),
            },
        }
    }
}

/// A stored event. Immutable once written; only its `processed` flag ever
/// changes, and that is tracked in the store rather than on this struct.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct EventRecord {
    /// Surrogate row id; the event's key.
    pub id: i32,
    pub event_id: i16,
    pub event_timestamp: NaiveDateTime,
    #[sqlx(flatten)]
    pub identifiers: Identifiers,
}

/// A profile: the canonical identity for one subject, holding the smallest
/// non-empty value observed for each identifier field.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Profile {
    /// Surrogate id, assigned by the store, never reused.
    pub id: i32,
    #[sqlx(flatten)]
    pub identifiers: Identifiers,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_follow_declaration_order() {
        let identifiers = Identifiers::new("c", "m", "p");
        let fields: Vec<IdentifierField> = identifiers
            .pairs()
            .iter()
            .map(|(field, _)| *field)
            .collect();
        assert_eq!(fields, IdentifierField::ALL);
    }

    #[test]
    fn is_empty_ignores_nothing() {
        assert!(Identifiers::default().is_empty());
        assert!(!Identifiers::new("", "", "p").is_empty());
    }

    #[test]
    fn merged_over_picks_smallest_non_empty_per_field() {
        let rows = vec![
            Identifiers::new("c-c", "m-c", "p1"),
            Identifiers::new("c-b", "m-b", ""),
            Identifiers::new("c-a", "m-a", ""),
        ];
        let merged = Identifiers::merged_over(&rows);
        assert_eq!(merged, Identifiers::new("c-a", "m-a", "p1"));
    }

    #[test]
    fn merged_over_keeps_field_empty_when_no_row_has_it() {
        let rows = vec![Identifiers::new("c1", "", ""), Identifiers::new("c2", "", "")];
        let merged = Identifiers::merged_over(&rows);
        assert_eq!(merged, Identifiers::new("c1", "", ""));
    }

    #[test]
    fn merged_over_is_case_sensitive() {
        // Uppercase sorts before lowercase in lexicographic order.
        let rows = vec![Identifiers::new("cookie", "", ""), Identifiers::new("Cookie", "", "")];
        let merged = Identifiers::merged_over(&rows);
        assert_eq!(merged.cookie, "Cookie");
    }

    #[test]
    fn identifiers_serialize_with_all_keys() {
        let json = serde_json::to_value(Identifiers::new("c1", "", "")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"cookie": "c1", "message_id": "", "phone": ""})
        );
    }

    #[test]
    fn random_events_carry_distinct_identifiers() {
        let a = NewEvent::random();
        let b = NewEvent::random();
        assert_ne!(a.identifiers.cookie, b.identifiers.cookie);
        assert_ne!(a.identifiers.message_id, b.identifiers.message_id);
        assert!(a.identifiers.phone.starts_with("+1"));
        assert_eq!(a.identifiers.phone.len(), 11);
    }
}
