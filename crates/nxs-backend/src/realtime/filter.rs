use super::protocol::{ChangeEvent, ChangeKind};
use crate::query::Filter;
use serde_json::{json, Value};

/// Which change kinds a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventFilter {
    #[default]
    All,
    Only(ChangeKind),
}

impl EventFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventFilter::All => "*",
            EventFilter::Only(ChangeKind::Insert) => "INSERT",
            EventFilter::Only(ChangeKind::Update) => "UPDATE",
            EventFilter::Only(ChangeKind::Delete) => "DELETE",
        }
    }

    pub fn accepts(&self, kind: ChangeKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(k) => *k == kind,
        }
    }
}

/// A `postgres_changes` subscription target.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFilter {
    pub schema: String,
    pub table: String,
    pub event: EventFilter,
    /// Single column predicate evaluated by the platform.
    pub filter: Option<Filter>,
}

impl ChangeFilter {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.into(),
            event: EventFilter::All,
            filter: None,
        }
    }

    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    #[must_use]
    pub fn on(mut self, kind: ChangeKind) -> Self {
        self.event = EventFilter::Only(kind);
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.with_filter(Filter::eq(column, value))
    }

    /// Platform filter string, e.g. `chat_id=eq.42`.
    pub fn render_filter(&self) -> Option<String> {
        self.filter
            .as_ref()
            .map(|f| format!("{}={}", f.column, f.render()))
    }

    /// The `postgres_changes` entry sent in `phx_join`.
    pub fn to_config(&self) -> Value {
        let mut entry = json!({
            "event": self.event.as_str(),
            "schema": self.schema,
            "table": self.table,
        });
        if let Some(filter) = self.render_filter() {
            entry["filter"] = Value::String(filter);
        }
        entry
    }

    /// Local check of an event against this target.
    ///
    /// Deletes are matched against the old row when it carries the filtered
    /// column, and accepted otherwise.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table || event.schema != self.schema {
            return false;
        }
        if !self.event.accepts(event.kind) {
            return false;
        }
        let Some(filter) = &self.filter else {
            return true;
        };
        match (&event.new, &event.old) {
            (Some(new), _) => filter.matches(new),
            (None, Some(old)) if old.contains_key(&filter.column) => filter.matches(old),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Row;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn test_render_config() {
        let f = ChangeFilter::table("messages").eq("chat_id", "c1");
        assert_eq!(f.render_filter().as_deref(), Some("chat_id=eq.c1"));
        let config = f.to_config();
        assert_eq!(config["event"], "*");
        assert_eq!(config["schema"], "public");
        assert_eq!(config["filter"], "chat_id=eq.c1");

        let plain = ChangeFilter::table("status").on(ChangeKind::Insert).to_config();
        assert_eq!(plain["event"], "INSERT");
        assert!(plain.get("filter").is_none());
    }

    #[test]
    fn test_matches_table_kind_and_filter() {
        let f = ChangeFilter::table("messages").eq("chat_id", "c1");
        let hit = ChangeEvent::new(
            ChangeKind::Insert,
            "messages",
            Some(row(&[("id", "m1"), ("chat_id", "c1")])),
            None,
        );
        let other_chat = ChangeEvent::new(
            ChangeKind::Insert,
            "messages",
            Some(row(&[("id", "m2"), ("chat_id", "c2")])),
            None,
        );
        let other_table = ChangeEvent::new(
            ChangeKind::Insert,
            "status",
            Some(row(&[("id", "s1"), ("chat_id", "c1")])),
            None,
        );
        assert!(f.matches(&hit));
        assert!(!f.matches(&other_chat));
        assert!(!f.matches(&other_table));

        let inserts_only = ChangeFilter::table("messages").on(ChangeKind::Insert);
        let update = ChangeEvent::new(ChangeKind::Update, "messages", Some(row(&[("id", "m1")])), None);
        assert!(!inserts_only.matches(&update));
    }

    #[test]
    fn test_delete_with_key_only_old_row_is_accepted() {
        let f = ChangeFilter::table("messages").eq("chat_id", "c1");
        let delete = ChangeEvent::new(ChangeKind::Delete, "messages", None, Some(row(&[("id", "m1")])));
        assert!(f.matches(&delete));
        let full = ChangeEvent::new(
            ChangeKind::Delete,
            "messages",
            None,
            Some(row(&[("id", "m1"), ("chat_id", "c9")])),
        );
        assert!(!f.matches(&full));
    }
}
